//! Inner-loop adaptation producing fast weights.

use crate::autograd::{cross_entropy, Graph, Var};
use crate::data::Task;
use crate::model::DifferentiableModel;
use crate::Result;

/// One inner-loop gradient step
#[derive(Debug, Clone)]
pub struct AdaptationStep<'g> {
    /// Fast weights `base - update_lr * grad`
    pub weights: Vec<Var<'g>>,
    /// Support loss at the base parameters
    pub support_loss: f64,
}

/// Gradient descent on a task's support set.
///
/// The adapter never writes to stored parameters: each step returns new graph
/// variables computed from the ones it was given. In second-order mode the
/// support gradient is built with `create_graph`, so the fast weights remain a
/// differentiable function of the base parameters through the gradient itself.
#[derive(Debug, Clone, Copy)]
pub struct InnerLoopAdapter {
    update_lr: f64,
    create_graph: bool,
}

impl InnerLoopAdapter {
    pub fn new(update_lr: f64, create_graph: bool) -> Self {
        Self {
            update_lr,
            create_graph,
        }
    }

    /// Full MAML: gradients flow through the inner-loop gradient
    pub fn second_order(update_lr: f64) -> Self {
        Self::new(update_lr, true)
    }

    /// FOMAML: the inner-loop gradient is treated as a constant
    pub fn first_order(update_lr: f64) -> Self {
        Self::new(update_lr, false)
    }

    pub fn update_lr(&self) -> f64 {
        self.update_lr
    }

    pub fn is_second_order(&self) -> bool {
        self.create_graph
    }

    /// Single step from `base`
    pub fn step<'g, M>(
        &self,
        model: &M,
        graph: &'g Graph,
        task: &Task,
        base: &[Var<'g>],
    ) -> Result<AdaptationStep<'g>>
    where
        M: DifferentiableModel + ?Sized,
    {
        model.check_parameters(base)?;
        let _mode = graph.grad_mode(true);

        let logits = model.predict(graph, &task.x_train, &task.lens_train, base)?;
        let loss = cross_entropy(logits, &task.y_train)?;
        let grads = graph.grad(loss, base, self.create_graph)?;

        let weights = base
            .iter()
            .zip(grads)
            .map(|(&param, grad)| param.sub(grad.scale(self.update_lr)))
            .collect::<Result<Vec<_>>>()?;

        Ok(AdaptationStep {
            weights,
            support_loss: loss.item(),
        })
    }

    /// `depth` chained steps, each starting from the previous fast weights
    pub fn adapt<'g, M>(
        &self,
        model: &M,
        graph: &'g Graph,
        task: &Task,
        base: &[Var<'g>],
        depth: usize,
    ) -> Result<Vec<Var<'g>>>
    where
        M: DifferentiableModel + ?Sized,
    {
        let mut weights = base.to_vec();
        for _ in 0..depth {
            weights = self.step(model, graph, task, &weights)?.weights;
        }
        Ok(weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClassifierConfig, Parameters, SequenceClassifier};
    use crate::MAMLError;
    use ndarray::{array, Array2};

    fn fixture() -> (SequenceClassifier, Task, Parameters) {
        let model = SequenceClassifier::new(ClassifierConfig {
            vocab_size: 8,
            embed_dim: 3,
            hidden_dim: 4,
            num_classes: 2,
        });
        let task = Task::new(
            array![[1, 2, 1], [5, 6, 7], [2, 2, 0], [6, 5, 0]],
            vec![0, 1, 0, 1],
            vec![3, 3, 2, 2],
            array![[1, 2, 0], [7, 6, 0]],
            vec![0, 1],
            vec![2, 2],
        )
        .unwrap();
        let params = model.init_parameters(4);
        (model, task, params)
    }

    fn support_loss(model: &SequenceClassifier, task: &Task, params: &Parameters) -> f64 {
        let graph = Graph::new();
        let vars = params.attach(&graph);
        let logits = model.predict(&graph, &task.x_train, &task.lens_train, &vars).unwrap();
        cross_entropy(logits, &task.y_train).unwrap().item()
    }

    #[test]
    fn test_step_is_gradient_descent() {
        let (model, task, params) = fixture();
        let lr = 0.5;

        let graph = Graph::new();
        let base = params.attach(&graph);
        let step = InnerLoopAdapter::first_order(lr).step(&model, &graph, &task, &base).unwrap();

        let logits = model.predict(&graph, &task.x_train, &task.lens_train, &base).unwrap();
        let loss = cross_entropy(logits, &task.y_train).unwrap();
        let grads = graph.grad(loss, &base, false).unwrap();

        for ((fast, p), g) in step.weights.iter().zip(params.iter()).zip(grads.iter()) {
            let expected = p - &(g.value() * lr);
            assert_eq!(fast.value(), expected);
        }
        assert!((step.support_loss - loss.item()).abs() < 1e-15);
    }

    #[test]
    fn test_step_lowers_support_loss() {
        let (model, task, params) = fixture();
        let graph = Graph::new();
        let base = params.attach(&graph);

        let fast = InnerLoopAdapter::second_order(0.5)
            .adapt(&model, &graph, &task, &base, 3)
            .unwrap();
        let adapted = Parameters::from_vars(&fast);

        assert!(support_loss(&model, &task, &adapted) < support_loss(&model, &task, &params));
    }

    #[test]
    fn test_chained_steps_start_from_previous_weights() {
        let (model, task, params) = fixture();
        let adapter = InnerLoopAdapter::first_order(0.3);

        let graph = Graph::new();
        let base = params.attach(&graph);
        let two = adapter.adapt(&model, &graph, &task, &base, 2).unwrap();

        let once = adapter.step(&model, &graph, &task, &base).unwrap().weights;
        let twice = adapter.step(&model, &graph, &task, &once).unwrap().weights;

        assert_eq!(Parameters::from_vars(&two), Parameters::from_vars(&twice));
        assert_ne!(Parameters::from_vars(&once), Parameters::from_vars(&twice));
    }

    #[test]
    fn test_base_parameters_are_untouched() {
        let (model, task, params) = fixture();
        let graph = Graph::new();
        let base = params.attach(&graph);

        InnerLoopAdapter::second_order(1.0)
            .adapt(&model, &graph, &task, &base, 2)
            .unwrap();
        assert_eq!(Parameters::from_vars(&base), params);
    }

    #[test]
    fn test_second_order_weights_stay_differentiable() {
        let (model, task, params) = fixture();
        let graph = Graph::new();
        let base = params.attach(&graph);

        let second = InnerLoopAdapter::second_order(0.1).step(&model, &graph, &task, &base).unwrap();
        let first = InnerLoopAdapter::first_order(0.1).step(&model, &graph, &task, &base).unwrap();

        assert!(second.weights.iter().all(|w| w.requires_grad()));
        assert!(first.weights.iter().all(|w| w.requires_grad()));
        assert_eq!(Parameters::from_vars(&second.weights), Parameters::from_vars(&first.weights));
    }

    #[test]
    fn test_incompatible_base_is_rejected() {
        let (model, task, _) = fixture();
        let graph = Graph::new();
        let base = vec![graph.param(Array2::zeros((2, 2)))];

        let result = InnerLoopAdapter::second_order(0.1).step(&model, &graph, &task, &base);
        assert!(matches!(result, Err(MAMLError::ShapeMismatch(_))));
    }

    #[test]
    fn test_constant_parameters_are_non_differentiable() {
        let (model, task, params) = fixture();
        let graph = Graph::new();
        let frozen: Vec<_> = params.iter().map(|t| graph.constant(t.clone())).collect();

        let result = InnerLoopAdapter::second_order(0.1).step(&model, &graph, &task, &frozen);
        assert!(matches!(result, Err(MAMLError::NonDifferentiable(_))));
    }
}
