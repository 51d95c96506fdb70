//! Parameter sets and the canonical parameter store.

use crate::autograd::{Graph, Var};
use crate::{MAMLError, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Ordered list of parameter tensors, one per trainable weight of a model.
///
/// The order is the order in which the model consumes them and is shared by
/// the store, the inner-loop adapter and the optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    tensors: Vec<Array2<f64>>,
}

impl Parameters {
    pub fn new(tensors: Vec<Array2<f64>>) -> Self {
        Self { tensors }
    }

    /// Zero tensors with the same shapes
    pub fn zeros_like(&self) -> Self {
        Self {
            tensors: self.tensors.iter().map(|t| Array2::zeros(t.dim())).collect(),
        }
    }

    /// Read the current values of graph variables
    pub fn from_vars(vars: &[Var<'_>]) -> Self {
        Self {
            tensors: vars.iter().map(|v| v.value()).collect(),
        }
    }

    /// Register every tensor as a trainable leaf of `graph`
    pub fn attach<'g>(&self, graph: &'g Graph) -> Vec<Var<'g>> {
        self.tensors.iter().map(|t| graph.param(t.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Array2<f64>> {
        self.tensors.iter()
    }

    pub fn tensors(&self) -> &[Array2<f64>] {
        &self.tensors
    }

    pub fn shapes(&self) -> Vec<(usize, usize)> {
        self.tensors.iter().map(|t| t.dim()).collect()
    }

    /// Total number of scalar parameters
    pub fn num_elements(&self) -> usize {
        self.tensors.iter().map(|t| t.len()).sum()
    }

    /// Identical shapes in the same order
    pub fn is_compatible(&self, other: &Parameters) -> bool {
        self.shapes() == other.shapes()
    }

    pub fn ensure_compatible(&self, other: &Parameters) -> Result<()> {
        if !self.is_compatible(other) {
            return Err(MAMLError::ShapeMismatch(format!(
                "parameter shapes {:?} vs {:?}",
                self.shapes(),
                other.shapes()
            )));
        }
        Ok(())
    }

    /// Largest absolute elementwise difference; infinite if incompatible
    pub fn max_abs_diff(&self, other: &Parameters) -> f64 {
        if !self.is_compatible(other) {
            return f64::INFINITY;
        }
        self.tensors
            .iter()
            .zip(other.tensors.iter())
            .flat_map(|(a, b)| a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()))
            .fold(0.0, f64::max)
    }
}

/// Owner of the canonical (meta-learned) parameter values.
///
/// Only the outer-loop optimizer and [`ParameterStore::restore`] write to it.
/// Task loops never need a snapshot to undo their work: they borrow the store
/// immutably and attach its values as graph leaves, so fast weights live in
/// the graph and the canonical tensors cannot change under them.
/// [`ParameterStore::snapshot`] and [`ParameterStore::restore`] move values
/// in and out for checkpoints and weight loading.
#[derive(Debug, Clone)]
pub struct ParameterStore {
    canonical: Parameters,
}

impl ParameterStore {
    pub fn new(initial: Parameters) -> Self {
        Self { canonical: initial }
    }

    /// Independent copy of the canonical values
    pub fn snapshot(&self) -> Parameters {
        self.canonical.clone()
    }

    /// Overwrite the canonical values in place
    pub fn restore(&mut self, snapshot: &Parameters) -> Result<()> {
        self.canonical.ensure_compatible(snapshot)?;
        for (dst, src) in self.canonical.tensors.iter_mut().zip(snapshot.tensors.iter()) {
            dst.assign(src);
        }
        Ok(())
    }

    /// Read-only view of the canonical values
    pub fn current(&self) -> &Parameters {
        &self.canonical
    }

    /// Apply `update` to every canonical tensor, in order
    pub(crate) fn update_each(&mut self, mut update: impl FnMut(usize, &mut Array2<f64>)) {
        for (index, tensor) in self.canonical.tensors.iter_mut().enumerate() {
            update(index, tensor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample_params() -> Parameters {
        Parameters::new(vec![array![[1.0, 2.0], [3.0, 4.0]], array![[0.5, -0.5]]])
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut store = ParameterStore::new(sample_params());
        let snapshot = store.snapshot();

        store.update_each(|_, t| t.fill(9.0));
        assert_eq!(snapshot, sample_params());
        assert_ne!(store.current(), &snapshot);
    }

    #[test]
    fn test_restore_is_exact() {
        let original = Parameters::new(vec![array![[0.1 + 0.2, 1e-300]], array![[f64::MIN_POSITIVE]]]);
        let mut store = ParameterStore::new(original.clone());
        let snapshot = store.snapshot();

        store.update_each(|i, t| t.mapv_inplace(|x| x * 3.0 + i as f64));
        store.restore(&snapshot).unwrap();

        for (a, b) in store.current().iter().zip(original.iter()) {
            for (x, y) in a.iter().zip(b.iter()) {
                assert_eq!(x.to_bits(), y.to_bits());
            }
        }
    }

    #[test]
    fn test_restore_rejects_incompatible() {
        let mut store = ParameterStore::new(sample_params());
        let wrong = Parameters::new(vec![array![[1.0, 2.0]], array![[0.5, -0.5]]]);

        assert!(matches!(store.restore(&wrong), Err(MAMLError::ShapeMismatch(_))));
        assert_eq!(store.current(), &sample_params());
    }

    #[test]
    fn test_attach_and_read_back() {
        let params = sample_params();
        let graph = Graph::new();
        let vars = params.attach(&graph);

        assert_eq!(vars.len(), 2);
        assert!(vars.iter().all(|v| v.requires_grad()));
        assert_eq!(Parameters::from_vars(&vars), params);
        assert_eq!(params.num_elements(), 6);
        assert_eq!(params.zeros_like().max_abs_diff(&params), 4.0);
    }
}
