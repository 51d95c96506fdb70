//! Outer-loop optimizer.

use crate::autograd::{Graph, Var};
use crate::config::MetaConfig;
use crate::model::ParameterStore;
use crate::{MAMLError, Result};
use ndarray::{Array2, Zip};

/// Adam applied to the canonical parameters.
///
/// Gradients are computed fresh from the meta-loss on every step, so there is
/// no stale gradient state to clear between iterations. Moment estimates
/// persist across steps.
#[derive(Debug, Clone)]
pub struct MetaOptimizer {
    lr: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    steps: u64,
    first_moment: Vec<Array2<f64>>,
    second_moment: Vec<Array2<f64>>,
}

impl MetaOptimizer {
    pub fn adam(lr: f64, beta1: f64, beta2: f64, epsilon: f64) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            epsilon,
            steps: 0,
            first_moment: Vec::new(),
            second_moment: Vec::new(),
        }
    }

    pub fn from_config(config: &MetaConfig) -> Self {
        Self::adam(
            config.meta_lr,
            config.adam_beta1,
            config.adam_beta2,
            config.adam_epsilon,
        )
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    /// Number of updates applied so far
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Forget the moment estimates
    pub fn reset(&mut self) {
        self.steps = 0;
        self.first_moment.clear();
        self.second_moment.clear();
    }

    /// Back-propagate `meta_loss` to `leaves` and update `store`.
    ///
    /// `leaves` must be the graph variables holding the store's canonical
    /// values. When the meta-loss was built through second-order inner-loop
    /// steps, this differentiates through those gradients.
    pub fn step<'g>(
        &mut self,
        graph: &'g Graph,
        meta_loss: Var<'g>,
        leaves: &[Var<'g>],
        store: &mut ParameterStore,
    ) -> Result<()> {
        let grads: Vec<Array2<f64>> = graph
            .grad(meta_loss, leaves, false)?
            .iter()
            .map(Var::value)
            .collect();
        self.apply(&grads, store)
    }

    /// One Adam update from precomputed gradients
    pub fn apply(&mut self, grads: &[Array2<f64>], store: &mut ParameterStore) -> Result<()> {
        let shapes = store.current().shapes();
        let grad_shapes: Vec<_> = grads.iter().map(|g| g.dim()).collect();
        if shapes != grad_shapes {
            return Err(MAMLError::ShapeMismatch(format!(
                "gradients {grad_shapes:?} for parameters {shapes:?}"
            )));
        }

        let moments_fit = self.first_moment.iter().map(|m| m.dim()).eq(shapes.iter().copied());
        if !moments_fit {
            self.first_moment = shapes.iter().map(|&s| Array2::zeros(s)).collect();
            self.second_moment = shapes.iter().map(|&s| Array2::zeros(s)).collect();
            self.steps = 0;
        }

        self.steps += 1;
        let (beta1, beta2, eps) = (self.beta1, self.beta2, self.epsilon);
        let bias1 = 1.0 - beta1.powf(self.steps as f64);
        let bias2 = 1.0 - beta2.powf(self.steps as f64);
        let step_size = self.lr / bias1;

        let first_moment = &mut self.first_moment;
        let second_moment = &mut self.second_moment;
        store.update_each(|index, param| {
            Zip::from(param)
                .and(&mut first_moment[index])
                .and(&mut second_moment[index])
                .and(&grads[index])
                .for_each(|p, m, v, &g| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    *p -= step_size * *m / ((*v / bias2).sqrt() + eps);
                });
        });

        Ok(())
    }
}
