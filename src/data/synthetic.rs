//! Synthetic few-shot text classification tasks.
//!
//! Each task draws a fresh set of keyword tokens per class. A sequence of a
//! given class mixes that class's keywords with uniform noise tokens, so the
//! class is recoverable from a handful of labelled examples but the mapping
//! differs from task to task. Token id `0` is reserved for padding.

use super::task::{Task, TaskBatch};
use crate::config::MetaConfig;
use crate::{MAMLError, Result};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Configuration for the synthetic task sampler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Vocabulary size, including the padding token
    pub vocab_size: usize,
    /// Padded sequence width
    pub max_len: usize,
    /// Shortest sequence generated
    pub min_len: usize,
    /// Classes per task (N-way)
    pub num_classes: usize,
    /// Support examples per class (K-shot)
    pub k_shot: usize,
    /// Query examples per class
    pub query_per_class: usize,
    /// Keyword tokens assigned to each class
    pub keywords_per_class: usize,
    /// Probability that a position holds a class keyword
    pub keyword_prob: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            vocab_size: 64,
            max_len: 12,
            min_len: 4,
            num_classes: 2,
            k_shot: 5,
            query_per_class: 5,
            keywords_per_class: 3,
            keyword_prob: 0.4,
        }
    }
}

impl SamplerConfig {
    /// Sampler sizing that matches a meta-learning configuration
    /// (query set of `k_shot * num_classes` examples).
    pub fn from_meta(config: &MetaConfig) -> Self {
        Self {
            num_classes: config.num_classes,
            k_shot: config.k_shot,
            query_per_class: config.k_shot,
            ..Self::default()
        }
    }

    pub fn with_vocab_size(mut self, vocab_size: usize) -> Self {
        self.vocab_size = vocab_size;
        self
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn with_keyword_prob(mut self, keyword_prob: f64) -> Self {
        self.keyword_prob = keyword_prob;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_classes < 2 {
            return Err(MAMLError::Config("num_classes must be at least 2".to_string()));
        }
        if self.k_shot == 0 || self.query_per_class == 0 {
            return Err(MAMLError::Config(
                "k_shot and query_per_class must be positive".to_string(),
            ));
        }
        if self.min_len == 0 || self.min_len > self.max_len {
            return Err(MAMLError::Config(format!(
                "invalid length range {}..={}",
                self.min_len, self.max_len
            )));
        }
        if self.keywords_per_class == 0
            || self.num_classes * self.keywords_per_class >= self.vocab_size
        {
            return Err(MAMLError::Config(format!(
                "vocabulary of {} cannot hold {} keywords per class for {} classes",
                self.vocab_size, self.keywords_per_class, self.num_classes
            )));
        }
        if !(0.0..=1.0).contains(&self.keyword_prob) {
            return Err(MAMLError::Config("keyword_prob must lie in [0, 1]".to_string()));
        }
        Ok(())
    }
}

/// Seeded generator of N-way K-shot sequence classification tasks
#[derive(Debug)]
pub struct SyntheticTaskSampler {
    config: SamplerConfig,
    rng: StdRng,
}

impl SyntheticTaskSampler {
    pub fn new(config: SamplerConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Draw one task with disjoint support and query examples
    pub fn sample_task(&mut self) -> Result<Task> {
        let cfg = self.config.clone();

        let mut vocabulary: Vec<usize> = (1..cfg.vocab_size).collect();
        vocabulary.shuffle(&mut self.rng);
        let keywords: Vec<Vec<usize>> = vocabulary
            .chunks(cfg.keywords_per_class)
            .take(cfg.num_classes)
            .map(<[usize]>::to_vec)
            .collect();

        let (x_train, y_train, lens_train) = self.sample_split(&keywords, cfg.k_shot);
        let (x_test, y_test, lens_test) = self.sample_split(&keywords, cfg.query_per_class);

        Task::new(x_train, y_train, lens_train, x_test, y_test, lens_test)
    }

    /// Draw `num_tasks` independent tasks
    pub fn sample_batch(&mut self, num_tasks: usize) -> Result<TaskBatch> {
        let tasks = (0..num_tasks)
            .map(|_| self.sample_task())
            .collect::<Result<Vec<_>>>()?;
        Ok(TaskBatch::new(tasks))
    }

    fn sample_split(
        &mut self,
        keywords: &[Vec<usize>],
        per_class: usize,
    ) -> (Array2<usize>, Vec<usize>, Vec<usize>) {
        let cfg = &self.config;
        let mut labels: Vec<usize> = (0..keywords.len())
            .flat_map(|class| std::iter::repeat(class).take(per_class))
            .collect();
        labels.shuffle(&mut self.rng);

        let mut inputs = Array2::zeros((labels.len(), cfg.max_len));
        let mut lengths = Vec::with_capacity(labels.len());
        for (row, &label) in labels.iter().enumerate() {
            let len = self.rng.gen_range(cfg.min_len..=cfg.max_len);
            let class_keywords = &keywords[label];
            for col in 0..len {
                inputs[[row, col]] = if self.rng.gen::<f64>() < cfg.keyword_prob {
                    class_keywords[self.rng.gen_range(0..class_keywords.len())]
                } else {
                    self.rng.gen_range(1..cfg.vocab_size)
                };
            }
            lengths.push(len);
        }

        (inputs, labels, lengths)
    }
}
