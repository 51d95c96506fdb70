//! Bag-of-embeddings sequence classifier.
//!
//! Architecture:
//! - Embedding lookup, mean-pooled over each sequence's valid tokens
//! - Hidden layer with tanh
//! - Linear output layer producing class logits
//!
//! Pooling is a constant `[batch, vocab]` matrix multiplied with the embedding
//! table, so the whole forward pass is made of differentiable graph ops.

use super::{DifferentiableModel, Parameters};
use crate::autograd::{Graph, Var};
use crate::{MAMLError, Result};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Sizes of the classifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Number of distinct token ids
    pub vocab_size: usize,
    /// Embedding dimension
    pub embed_dim: usize,
    /// Hidden layer size
    pub hidden_dim: usize,
    /// Number of output classes
    pub num_classes: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            vocab_size: 64,
            embed_dim: 16,
            hidden_dim: 32,
            num_classes: 2,
        }
    }
}

/// Token-sequence classifier used as the meta-learned model
#[derive(Debug, Clone)]
pub struct SequenceClassifier {
    config: ClassifierConfig,
}

impl SequenceClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Row-normalized token counts over the first `len` tokens of each row
    fn pooling_matrix(&self, inputs: &Array2<usize>, lengths: &[usize]) -> Result<Array2<f64>> {
        let (batch, width) = inputs.dim();
        if lengths.len() != batch {
            return Err(MAMLError::ShapeMismatch(format!(
                "{} lengths for {} sequences",
                lengths.len(),
                batch
            )));
        }

        let vocab = self.config.vocab_size;
        let mut pooling = Array2::zeros((batch, vocab));
        for (row, &len) in lengths.iter().enumerate() {
            if len > width {
                return Err(MAMLError::InvalidInput(format!(
                    "sequence {row} has length {len} but only {width} columns"
                )));
            }
            if len == 0 {
                continue;
            }
            let weight = 1.0 / len as f64;
            for &token in inputs.row(row).iter().take(len) {
                if token >= vocab {
                    return Err(MAMLError::InvalidInput(format!(
                        "token id {token} outside vocabulary of {vocab}"
                    )));
                }
                pooling[[row, token]] += weight;
            }
        }
        Ok(pooling)
    }
}

impl DifferentiableModel for SequenceClassifier {
    fn parameter_shapes(&self) -> Vec<(usize, usize)> {
        let c = &self.config;
        vec![
            (c.vocab_size, c.embed_dim),
            (c.embed_dim, c.hidden_dim),
            (1, c.hidden_dim),
            (c.hidden_dim, c.num_classes),
            (1, c.num_classes),
        ]
    }

    fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    /// Xavier-normal weights, zero biases
    fn init_parameters(&self, seed: u64) -> Parameters {
        let mut rng = StdRng::seed_from_u64(seed);
        let tensors = self
            .parameter_shapes()
            .into_iter()
            .map(|(rows, cols)| {
                if rows == 1 {
                    return Array2::zeros((rows, cols));
                }
                let scale = (2.0 / (rows + cols) as f64).sqrt();
                Array2::from_shape_fn((rows, cols), |_| {
                    let z: f64 = rng.sample(StandardNormal);
                    z * scale
                })
            })
            .collect();
        Parameters::new(tensors)
    }

    fn predict<'g>(
        &self,
        graph: &'g Graph,
        inputs: &Array2<usize>,
        lengths: &[usize],
        params: &[Var<'g>],
    ) -> Result<Var<'g>> {
        self.check_parameters(params)?;
        let [embedding, w_hidden, b_hidden, w_out, b_out] = params else {
            return Err(MAMLError::ShapeMismatch(format!(
                "expected 5 parameter tensors, got {}",
                params.len()
            )));
        };

        let pooled = graph
            .constant(self.pooling_matrix(inputs, lengths)?)
            .matmul(*embedding)?;
        let hidden = pooled.matmul(*w_hidden)?.add_row(*b_hidden)?.tanh();
        hidden.matmul(*w_out)?.add_row(*b_out)
    }
}
