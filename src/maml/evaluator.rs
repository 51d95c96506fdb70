//! Query-set evaluation at a given parameter set.

use crate::autograd::{argmax_rows, cross_entropy, softmax_rows, Graph, Var};
use crate::data::Task;
use crate::model::DifferentiableModel;
use crate::Result;

/// Outcome of evaluating one task's query set
#[derive(Debug, Clone, Copy)]
pub struct Evaluation<'g> {
    /// Mean cross-entropy. Differentiable only when evaluated with tracking.
    pub loss: Var<'g>,
    /// Correctly classified query examples
    pub correct: usize,
    /// Query examples evaluated
    pub total: usize,
}

impl Evaluation<'_> {
    pub fn loss_value(&self) -> f64 {
        self.loss.item()
    }

    pub fn accuracy(&self) -> f64 {
        self.correct as f64 / self.total as f64
    }
}

/// Runs the model on a task's query set
#[derive(Debug, Clone, Copy, Default)]
pub struct Evaluator;

impl Evaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate `params` on the query set of `task`.
    ///
    /// With `track = false` the forward pass runs under [`Graph::no_grad`] and
    /// the returned loss is a constant. Only the evaluation whose loss feeds
    /// the meta-update should be tracked.
    pub fn evaluate<'g, M>(
        &self,
        model: &M,
        graph: &'g Graph,
        task: &Task,
        params: &[Var<'g>],
        track: bool,
    ) -> Result<Evaluation<'g>>
    where
        M: DifferentiableModel + ?Sized,
    {
        let forward = || -> Result<(Var<'g>, Var<'g>)> {
            let logits = model.predict(graph, &task.x_test, &task.lens_test, params)?;
            let loss = cross_entropy(logits, &task.y_test)?;
            Ok((logits, loss))
        };

        let (logits, loss) = if track {
            let _mode = graph.grad_mode(true);
            forward()?
        } else {
            graph.no_grad(forward)?
        };

        let predictions = argmax_rows(&softmax_rows(&logits.data()));
        let correct = predictions
            .iter()
            .zip(task.y_test.iter())
            .filter(|(pred, label)| pred == label)
            .count();

        Ok(Evaluation {
            loss,
            correct,
            total: task.query_size(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClassifierConfig, SequenceClassifier};
    use ndarray::array;

    fn fixture() -> (SequenceClassifier, Task) {
        let model = SequenceClassifier::new(ClassifierConfig {
            vocab_size: 8,
            embed_dim: 3,
            hidden_dim: 4,
            num_classes: 2,
        });
        let task = Task::new(
            array![[1, 2, 0], [3, 4, 5]],
            vec![0, 1],
            vec![2, 3],
            array![[1, 1, 2], [4, 5, 0], [2, 0, 0], [5, 3, 4]],
            vec![0, 1, 0, 1],
            vec![3, 2, 1, 3],
        )
        .unwrap();
        (model, task)
    }

    #[test]
    fn test_untracked_evaluation() {
        let (model, task) = fixture();
        let graph = Graph::new();
        let params = model.init_parameters(2).attach(&graph);

        let eval = Evaluator::new().evaluate(&model, &graph, &task, &params, false).unwrap();
        assert!(!eval.loss.requires_grad());
        assert_eq!(eval.total, 4);
        assert!(eval.correct <= 4);
        assert!(eval.loss_value() > 0.0);
        assert!((0.0..=1.0).contains(&eval.accuracy()));
    }

    #[test]
    fn test_tracked_matches_untracked() {
        let (model, task) = fixture();
        let graph = Graph::new();
        let params = model.init_parameters(2).attach(&graph);
        let evaluator = Evaluator::new();

        let tracked = evaluator.evaluate(&model, &graph, &task, &params, true).unwrap();
        let plain = evaluator.evaluate(&model, &graph, &task, &params, false).unwrap();

        assert!(tracked.loss.requires_grad());
        assert_eq!(tracked.loss_value(), plain.loss_value());
        assert_eq!(tracked.correct, plain.correct);
    }

    #[test]
    fn test_tracking_inside_no_grad_scope() {
        let (model, task) = fixture();
        let graph = Graph::new();
        let params = model.init_parameters(2).attach(&graph);

        let eval = graph
            .no_grad(|| Evaluator::new().evaluate(&model, &graph, &task, &params, true))
            .unwrap();
        assert!(eval.loss.requires_grad());
        assert!(graph.is_grad_enabled());
    }
}
