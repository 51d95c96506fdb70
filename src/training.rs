//! Meta-training driver and checkpoints

use crate::config::MetaConfig;
use crate::data::TaskSource;
use crate::maml::{MetaLearner, MetaMetrics};
use crate::metrics::{self, MetricsSink};
use crate::model::{DifferentiableModel, Parameters};
use crate::{MAMLError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Configuration for the meta-trainer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Number of meta-iterations
    pub iterations: u64,
    /// Validation frequency (iterations); 0 disables validation
    pub eval_interval: u64,
    /// Batches per validation pass
    pub eval_batches: usize,
    /// Where to write a checkpoint after each validation pass and at the end
    pub checkpoint_path: Option<PathBuf>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            iterations: 1000,
            eval_interval: 100,
            eval_batches: 10,
            checkpoint_path: None,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.eval_interval > 0 && self.eval_batches == 0 {
            return Err(MAMLError::Config(
                "eval_batches must be at least 1 when validation is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Train,
    Validation,
}

/// Summary of one meta-iteration, or of a whole validation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub step: u64,
    pub phase: Phase,
    pub meta_loss: Option<f64>,
    pub support_loss: f64,
    pub before_loss: f64,
    pub before_acc: f64,
    pub after_loss: f64,
    pub after_acc: f64,
}

impl TrainingRecord {
    fn from_metrics(step: u64, phase: Phase, metrics: &MetaMetrics) -> Self {
        let (before_loss, before_acc) = metrics.before();
        let (after_loss, after_acc) = metrics.after();
        Self {
            step,
            phase,
            meta_loss: metrics.meta_loss,
            support_loss: metrics.support_loss,
            before_loss,
            before_acc,
            after_loss,
            after_acc,
        }
    }

    /// Mean of several records of the same step
    fn average(step: u64, phase: Phase, records: &[TrainingRecord]) -> Self {
        let n = records.len().max(1) as f64;
        let mean = |f: fn(&TrainingRecord) -> f64| records.iter().map(f).sum::<f64>() / n;
        Self {
            step,
            phase,
            meta_loss: None,
            support_loss: mean(|r| r.support_loss),
            before_loss: mean(|r| r.before_loss),
            before_acc: mean(|r| r.before_acc),
            after_loss: mean(|r| r.after_loss),
            after_acc: mean(|r| r.after_acc),
        }
    }

    /// Accuracy gained by adaptation
    pub fn improvement(&self) -> f64 {
        self.after_acc - self.before_acc
    }
}

/// Saved learner state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub step: u64,
    pub config: MetaConfig,
    pub parameters: Parameters,
}

impl Checkpoint {
    pub fn from_learner<M, S>(learner: &MetaLearner<M, S>, step: u64) -> Self
    where
        M: DifferentiableModel,
        S: MetricsSink,
    {
        Self {
            step,
            config: learner.config().clone(),
            parameters: learner.store().snapshot(),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let checkpoint: Self = serde_json::from_reader(reader)?;
        checkpoint.config.validate()?;
        Ok(checkpoint)
    }
}

/// Drives meta-training with periodic validation
#[derive(Debug, Clone)]
pub struct MetaTrainer {
    config: TrainerConfig,
    history: Vec<TrainingRecord>,
}

impl MetaTrainer {
    pub fn new(config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            history: Vec::new(),
        })
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Run `iterations` meta-iterations, starting the step counter at
    /// `start_step`.
    ///
    /// Training batches come from `train_tasks`, validation batches from
    /// `validation_tasks`. Returns the last validation record, if any.
    pub fn train<M, S, T, V>(
        &mut self,
        learner: &mut MetaLearner<M, S>,
        mut train_tasks: T,
        mut validation_tasks: V,
        start_step: u64,
    ) -> Result<Option<TrainingRecord>>
    where
        M: DifferentiableModel,
        S: MetricsSink,
        T: TaskSource,
        V: TaskSource,
    {
        let batch_size = learner.config().batch_size;
        let mut last_validation = None;

        for step in start_step..start_step + self.config.iterations {
            let batch = train_tasks.next_batch(batch_size)?;
            let metrics = learner.run_meta_iteration(&batch, step, false)?;
            self.history
                .push(TrainingRecord::from_metrics(step, Phase::Train, &metrics));

            let done = step + 1 - start_step;
            if self.config.eval_interval > 0 && done % self.config.eval_interval == 0 {
                let record = self.validate(learner, &mut validation_tasks, step)?;
                info!(
                    step,
                    before_acc = record.before_acc,
                    after_acc = record.after_acc,
                    improvement = record.improvement(),
                    "Validation"
                );
                self.save_checkpoint(learner, step)?;
                self.history.push(record.clone());
                last_validation = Some(record);
            }
        }

        if self.config.iterations > 0 {
            self.save_checkpoint(learner, start_step + self.config.iterations - 1)?;
        }
        learner.sink_mut().flush();
        Ok(last_validation)
    }

    /// Evaluate-only pass over `eval_batches` batches.
    ///
    /// Per-batch metrics stay out of the sink; the averaged record is
    /// reported once under the `validation/` tags at `step`.
    pub fn validate<M, S, V>(
        &self,
        learner: &mut MetaLearner<M, S>,
        validation_tasks: &mut V,
        step: u64,
    ) -> Result<TrainingRecord>
    where
        M: DifferentiableModel,
        S: MetricsSink,
        V: TaskSource,
    {
        let batch_size = learner.config().batch_size;
        let records = (0..self.config.eval_batches)
            .map(|_| {
                let batch = validation_tasks.next_batch(batch_size)?;
                let metrics = learner.evaluate_batch(&batch, step)?;
                Ok(TrainingRecord::from_metrics(step, Phase::Validation, &metrics))
            })
            .collect::<Result<Vec<_>>>()?;
        let record = TrainingRecord::average(step, Phase::Validation, &records);

        let sink = learner.sink_mut();
        sink.add_scalar(metrics::VALIDATION_BEFORE_LOSS, record.before_loss, step);
        sink.add_scalar(metrics::VALIDATION_BEFORE_ACC, record.before_acc, step);
        sink.add_scalar(metrics::VALIDATION_AFTER_LOSS, record.after_loss, step);
        sink.add_scalar(metrics::VALIDATION_AFTER_ACC, record.after_acc, step);
        Ok(record)
    }

    fn save_checkpoint<M, S>(&self, learner: &MetaLearner<M, S>, step: u64) -> Result<()>
    where
        M: DifferentiableModel,
        S: MetricsSink,
    {
        if let Some(path) = &self.config.checkpoint_path {
            Checkpoint::from_learner(learner, step).save(path)?;
            info!(step, path = %path.display(), "Saved checkpoint");
        }
        Ok(())
    }

    pub fn history(&self) -> &[TrainingRecord] {
        &self.history
    }

    pub fn records(&self, phase: Phase) -> impl DoubleEndedIterator<Item = &TrainingRecord> {
        self.history.iter().filter(move |r| r.phase == phase)
    }

    /// Validation record with the highest post-adaptation accuracy
    pub fn best_validation(&self) -> Option<&TrainingRecord> {
        self.records(Phase::Validation)
            .max_by(|a, b| a.after_acc.total_cmp(&b.after_acc))
    }

    /// Mean post-adaptation training accuracy over the last `n` iterations
    pub fn recent_accuracy(&self, n: usize) -> f64 {
        let recent: Vec<_> = self.records(Phase::Train).rev().take(n).collect();
        if recent.is_empty() {
            return 0.0;
        }
        recent.iter().map(|r| r.after_acc).sum::<f64>() / recent.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SamplerConfig, SyntheticTaskSampler};
    use crate::metrics::MemorySink;
    use crate::model::{ClassifierConfig, SequenceClassifier};

    fn setup() -> (MetaLearner<SequenceClassifier, MemorySink>, SamplerConfig) {
        let config = MetaConfig::default()
            .with_shots(2, 2)
            .with_batch_size(2)
            .with_meta_lr(0.01);
        let model = SequenceClassifier::new(ClassifierConfig {
            vocab_size: 16,
            embed_dim: 4,
            hidden_dim: 4,
            num_classes: 2,
        });
        let sampler = SamplerConfig::from_meta(&config)
            .with_vocab_size(16)
            .with_max_len(6);
        let learner = MetaLearner::with_sink(model, config, 3, MemorySink::new()).unwrap();
        (learner, sampler)
    }

    #[test]
    fn test_training_history() {
        let (mut learner, sampler_config) = setup();
        let train = SyntheticTaskSampler::new(sampler_config.clone(), 1).unwrap();
        let validation = SyntheticTaskSampler::new(sampler_config, 2).unwrap();

        let mut trainer = MetaTrainer::new(TrainerConfig {
            iterations: 4,
            eval_interval: 2,
            eval_batches: 2,
            checkpoint_path: None,
        })
        .unwrap();

        let last = trainer.train(&mut learner, train, validation, 0).unwrap();

        assert_eq!(trainer.records(Phase::Train).count(), 4);
        assert_eq!(trainer.records(Phase::Validation).count(), 2);
        assert!(trainer.records(Phase::Train).all(|r| r.meta_loss.is_some()));
        assert_eq!(last.unwrap().step, 3);
        assert!(trainer.best_validation().is_some());
        assert!((0.0..=1.0).contains(&trainer.recent_accuracy(2)));
        assert_eq!(learner.optimizer().steps(), 4);
    }

    #[test]
    fn test_validation_does_not_train() {
        let (mut learner, sampler_config) = setup();
        let mut validation = SyntheticTaskSampler::new(sampler_config, 5).unwrap();
        let trainer = MetaTrainer::new(TrainerConfig::default()).unwrap();
        let before = learner.parameters().clone();

        let record = trainer.validate(&mut learner, &mut validation, 0).unwrap();

        assert_eq!(record.phase, Phase::Validation);
        assert!(record.meta_loss.is_none());
        assert_eq!(learner.parameters(), &before);
    }

    #[test]
    fn test_checkpoint_written_and_restored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let (mut learner, sampler_config) = setup();
        let mut train = SyntheticTaskSampler::new(sampler_config.clone(), 1).unwrap();
        let mut validation = SyntheticTaskSampler::new(sampler_config, 2).unwrap();

        let mut trainer = MetaTrainer::new(TrainerConfig {
            iterations: 3,
            eval_interval: 0,
            eval_batches: 0,
            checkpoint_path: Some(path.clone()),
        })
        .unwrap();
        trainer
            .train(&mut learner, &mut train, &mut validation, 10)
            .unwrap();

        let checkpoint = Checkpoint::load(&path).unwrap();
        assert_eq!(checkpoint.step, 12);
        assert_eq!(&checkpoint.parameters, learner.parameters());
        assert_eq!(&checkpoint.config, learner.config());

        let (mut fresh, _) = setup();
        fresh.load_weights(&checkpoint.parameters).unwrap();
        assert_eq!(fresh.parameters(), learner.parameters());
    }

    #[test]
    fn test_validation_reports_once_per_pass() {
        let (mut learner, sampler_config) = setup();
        let train = SyntheticTaskSampler::new(sampler_config.clone(), 1).unwrap();
        let validation = SyntheticTaskSampler::new(sampler_config, 2).unwrap();

        let mut trainer = MetaTrainer::new(TrainerConfig {
            iterations: 1,
            eval_interval: 1,
            eval_batches: 3,
            checkpoint_path: None,
        })
        .unwrap();
        let record = trainer
            .train(&mut learner, train, validation, 0)
            .unwrap()
            .unwrap();

        let sink = learner.sink();
        for tag in [
            metrics::TRAIN_LOSS,
            metrics::BEFORE_LOSS,
            metrics::BEFORE_ACC,
            metrics::AFTER_LOSS,
            metrics::AFTER_ACC,
            metrics::VALIDATION_BEFORE_LOSS,
            metrics::VALIDATION_BEFORE_ACC,
            metrics::VALIDATION_AFTER_LOSS,
            metrics::VALIDATION_AFTER_ACC,
        ] {
            assert_eq!(sink.values(tag).len(), 1, "{tag}");
        }
        assert_eq!(sink.records().len(), 9);
        assert_eq!(sink.latest(metrics::VALIDATION_AFTER_ACC), Some(record.after_acc));
    }

    #[test]
    fn test_trainer_config_validation() {
        let config = TrainerConfig {
            eval_batches: 0,
            ..TrainerConfig::default()
        };
        assert!(matches!(MetaTrainer::new(config), Err(MAMLError::Config(_))));
    }
}
