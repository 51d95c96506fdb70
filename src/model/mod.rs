//! Model interface and reference implementation.
//!
//! The meta-learning core treats a model as a pure, differentiable function of
//! its inputs and an explicitly supplied parameter list. It never reads weights
//! stored inside the model, which is what allows the inner loop to evaluate the
//! same model at canonical parameters and at fast weights.

pub mod classifier;
pub mod params;

pub use classifier::{ClassifierConfig, SequenceClassifier};
pub use params::{ParameterStore, Parameters};

use crate::autograd::{Graph, Var};
use crate::{MAMLError, Result};
use ndarray::Array2;

/// A classifier usable by the meta-learner
pub trait DifferentiableModel {
    /// Shapes of the parameter tensors, in the order `predict` consumes them
    fn parameter_shapes(&self) -> Vec<(usize, usize)>;

    /// Width of the logits produced by `predict`
    fn num_classes(&self) -> usize;

    /// Fresh parameters drawn deterministically from `seed`
    fn init_parameters(&self, seed: u64) -> Parameters;

    /// Logits `[batch, num_classes]` for padded token ids `[batch, max_len]`.
    ///
    /// Must work both with gradient tracking on and inside
    /// [`Graph::no_grad`].
    fn predict<'g>(
        &self,
        graph: &'g Graph,
        inputs: &Array2<usize>,
        lengths: &[usize],
        params: &[Var<'g>],
    ) -> Result<Var<'g>>;

    /// Fails with `ShapeMismatch` unless `params` match `parameter_shapes`
    fn check_parameters(&self, params: &[Var<'_>]) -> Result<()> {
        let expected = self.parameter_shapes();
        let found: Vec<_> = params.iter().map(|p| p.shape()).collect();
        if expected != found {
            return Err(MAMLError::ShapeMismatch(format!(
                "model expects parameters {expected:?}, got {found:?}"
            )));
        }
        Ok(())
    }
}
