//! Per-task adaptation traces and their aggregation over a task batch.

use crate::{MAMLError, Result};
use serde::{Deserialize, Serialize};

/// Query-set results of one task at every adaptation depth.
///
/// Index 0 is the evaluation before any inner-loop step; index `k` follows
/// the `k`-th step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationTrace {
    /// Number of query examples of the task
    pub query_size: usize,
    /// Mean cross-entropy over the query set, per depth
    pub losses: Vec<f64>,
    /// Correctly classified query examples, per depth
    pub corrects: Vec<usize>,
    /// Support-set loss before the first inner-loop step
    pub support_loss: f64,
}

impl AdaptationTrace {
    pub fn new(query_size: usize, support_loss: f64) -> Self {
        Self {
            query_size,
            losses: Vec::new(),
            corrects: Vec::new(),
            support_loss,
        }
    }

    pub fn record(&mut self, loss: f64, correct: usize) {
        self.losses.push(loss);
        self.corrects.push(correct);
    }

    /// Number of recorded depths
    pub fn depths(&self) -> usize {
        self.losses.len()
    }

    pub fn accuracies(&self) -> Vec<f64> {
        self.corrects
            .iter()
            .map(|&c| c as f64 / self.query_size as f64)
            .collect()
    }
}

/// Metrics of one meta-iteration, indexed by adaptation depth
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaMetrics {
    /// Summed task query losses over total query examples, per depth
    pub losses: Vec<f64>,
    /// Query accuracy at each depth
    pub accuracies: Vec<f64>,
    /// Meta-loss handed to the optimizer; `None` in evaluate-only mode
    pub meta_loss: Option<f64>,
    /// Mean support loss before adaptation
    pub support_loss: f64,
    /// Per-task traces, in batch order
    pub traces: Vec<AdaptationTrace>,
}

impl MetaMetrics {
    /// Aggregate task traces.
    ///
    /// Per-depth sums of the task losses and of the correct counts are both
    /// divided by the total number of query examples, which is
    /// `query_size * number_of_tasks` for uniformly sized tasks.
    pub fn from_traces(traces: Vec<AdaptationTrace>, meta_loss: Option<f64>) -> Result<Self> {
        let first = traces.first().ok_or(MAMLError::EmptyTaskBatch)?;
        let depths = first.depths();
        if let Some(bad) = traces.iter().find(|t| t.depths() != depths || t.corrects.len() != depths) {
            return Err(MAMLError::ShapeMismatch(format!(
                "trace with {} depths in a batch of {} depths",
                bad.depths(),
                depths
            )));
        }

        let examples: usize = traces.iter().map(|t| t.query_size).sum();
        let denom = examples as f64;

        let mut losses = vec![0.0; depths];
        let mut corrects = vec![0usize; depths];
        for trace in &traces {
            for depth in 0..depths {
                losses[depth] += trace.losses[depth];
                corrects[depth] += trace.corrects[depth];
            }
        }

        let support_loss =
            traces.iter().map(|t| t.support_loss).sum::<f64>() / traces.len() as f64;

        Ok(Self {
            losses: losses.into_iter().map(|l| l / denom).collect(),
            accuracies: corrects.into_iter().map(|c| c as f64 / denom).collect(),
            meta_loss,
            support_loss,
            traces,
        })
    }

    /// Number of depths, `num_updates + 1`
    pub fn num_depths(&self) -> usize {
        self.accuracies.len()
    }

    /// `(loss, accuracy)` before adaptation
    pub fn before(&self) -> (f64, f64) {
        (self.losses[0], self.accuracies[0])
    }

    /// `(loss, accuracy)` at the deepest adaptation step
    pub fn after(&self) -> (f64, f64) {
        let last = self.num_depths() - 1;
        (self.losses[last], self.accuracies[last])
    }
}
