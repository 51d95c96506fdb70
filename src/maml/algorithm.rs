//! MAML meta-learning engine.
//!
//! Model-Agnostic Meta-Learning (MAML) learns an initialization for a model's
//! parameters from which a few gradient steps on a new task's support set
//! generalize to that task's query set.
//!
//! Reference: Finn, C., Abbeel, P., & Levine, S. (2017).
//! "Model-Agnostic Meta-Learning for Fast Adaptation of Deep Networks." ICML.
//!
//! One meta-iteration walks every task of a batch through
//! `evaluate(0) → adapt(1) → evaluate(1) → … → adapt(n) → evaluate(n)`,
//! starting each task from the canonical parameters. Fast weights only live in
//! the iteration's autograd graph, so the canonical parameters are never
//! written during the task loop. The summed final-depth query losses form the
//! meta-loss, which the outer optimizer differentiates through the whole inner
//! loop.

use super::adapter::InnerLoopAdapter;
use super::evaluator::Evaluator;
use super::optimizer::MetaOptimizer;
use super::trace::{AdaptationTrace, MetaMetrics};
use crate::autograd::{argmax_rows, softmax_rows, Graph, Var};
use crate::config::MetaConfig;
use crate::data::{Task, TaskBatch};
use crate::metrics::{self, MetricsSink, TracingSink};
use crate::model::{DifferentiableModel, ParameterStore, Parameters};
use crate::{MAMLError, Result};
use ndarray::Array2;
use tracing::{debug, info, warn};

/// Meta-learner owning the model, its canonical parameters and the outer
/// optimizer.
pub struct MetaLearner<M, S = TracingSink> {
    model: M,
    config: MetaConfig,
    store: ParameterStore,
    optimizer: MetaOptimizer,
    evaluator: Evaluator,
    sink: S,
}

impl<M: DifferentiableModel> MetaLearner<M, TracingSink> {
    /// Create a learner with freshly initialized parameters
    pub fn new(model: M, config: MetaConfig, seed: u64) -> Result<Self> {
        let initial = model.init_parameters(seed);
        Self::from_parameters(model, config, initial, TracingSink)
    }
}

impl<M: DifferentiableModel, S: MetricsSink> MetaLearner<M, S> {
    /// Create a learner reporting metrics to `sink`
    pub fn with_sink(model: M, config: MetaConfig, seed: u64, sink: S) -> Result<Self> {
        let initial = model.init_parameters(seed);
        Self::from_parameters(model, config, initial, sink)
    }

    /// Create a learner starting from existing parameters
    pub fn from_parameters(
        model: M,
        config: MetaConfig,
        initial: Parameters,
        sink: S,
    ) -> Result<Self> {
        config.validate()?;
        if initial.shapes() != model.parameter_shapes() {
            return Err(MAMLError::ShapeMismatch(format!(
                "model expects parameters {:?}, got {:?}",
                model.parameter_shapes(),
                initial.shapes()
            )));
        }
        if config.num_classes != model.num_classes() {
            return Err(MAMLError::Config(format!(
                "config has {} classes but the model predicts {}",
                config.num_classes,
                model.num_classes()
            )));
        }
        if config.use_gpu {
            warn!("use_gpu requested but only CPU execution is available; continuing on CPU");
        }

        info!(
            num_parameters = initial.num_elements(),
            num_updates = config.num_updates,
            update_lr = config.update_lr,
            meta_lr = config.meta_lr,
            first_order = config.first_order,
            "Initialized meta-learner"
        );

        Ok(Self {
            optimizer: MetaOptimizer::from_config(&config),
            store: ParameterStore::new(initial),
            evaluator: Evaluator::new(),
            model,
            config,
            sink,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn config(&self) -> &MetaConfig {
        &self.config
    }

    /// Current canonical parameters
    pub fn parameters(&self) -> &Parameters {
        self.store.current()
    }

    pub fn store(&self) -> &ParameterStore {
        &self.store
    }

    pub fn optimizer(&self) -> &MetaOptimizer {
        &self.optimizer
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Replace the canonical parameters, e.g. from a checkpoint
    pub fn load_weights(&mut self, parameters: &Parameters) -> Result<()> {
        self.store.restore(parameters)
    }

    /// Run one meta-iteration over `batch`.
    ///
    /// Returns per-depth query losses and accuracies, each with
    /// `num_updates + 1` entries. With `evaluate = true` the metrics are
    /// computed identically but no meta-update is applied. The five scalars
    /// are reported to the sink once, at `global_step`.
    pub fn run_meta_iteration(
        &mut self,
        batch: &TaskBatch,
        global_step: u64,
        evaluate: bool,
    ) -> Result<MetaMetrics> {
        let metrics = self.iterate(batch, global_step, evaluate)?;
        self.report(&metrics, global_step);
        Ok(metrics)
    }

    /// Evaluate-only iteration that leaves the sink alone.
    ///
    /// Used for validation passes that aggregate several batches before
    /// reporting anything.
    pub fn evaluate_batch(&mut self, batch: &TaskBatch, global_step: u64) -> Result<MetaMetrics> {
        self.iterate(batch, global_step, true)
    }

    fn iterate(
        &mut self,
        batch: &TaskBatch,
        global_step: u64,
        evaluate: bool,
    ) -> Result<MetaMetrics> {
        if batch.is_empty() {
            return Err(MAMLError::EmptyTaskBatch);
        }

        let graph = Graph::new();
        let canonical = self.store.current().attach(&graph);
        let adapter = InnerLoopAdapter::new(
            self.config.update_lr,
            !evaluate && !self.config.first_order,
        );

        let mut traces = Vec::with_capacity(batch.len());
        let mut final_losses = Vec::with_capacity(batch.len());
        for (index, task) in batch.iter().enumerate() {
            let (trace, final_loss) = self.run_task(&graph, &canonical, task, &adapter, !evaluate)?;
            debug!(
                task = index,
                support_loss = trace.support_loss,
                before = trace.losses[0],
                after = trace.losses[trace.depths() - 1],
                "Task adapted"
            );
            traces.push(trace);
            final_losses.push(final_loss);
        }

        let meta_loss = if evaluate {
            None
        } else {
            let (first, rest) = final_losses
                .split_first()
                .ok_or(MAMLError::EmptyTaskBatch)?;
            let total = rest.iter().try_fold(*first, |acc, &loss| acc.add(loss))?;
            let meta_loss = total.scale(1.0 / batch.len() as f64);
            self.optimizer
                .step(&graph, meta_loss, &canonical, &mut self.store)?;
            Some(meta_loss.item())
        };

        let metrics = MetaMetrics::from_traces(traces, meta_loss)?;

        let (before_loss, before_acc) = metrics.before();
        let (after_loss, after_acc) = metrics.after();
        info!(
            step = global_step,
            evaluate,
            tasks = batch.len(),
            graph_nodes = graph.len(),
            before_loss,
            before_acc,
            after_loss,
            after_acc,
            "Meta-iteration complete"
        );

        Ok(metrics)
    }

    /// Adapt one task from the canonical parameters through every depth.
    ///
    /// Borrows the learner immutably, so canonical parameters cannot change
    /// between task entry and exit.
    fn run_task<'g>(
        &self,
        graph: &'g Graph,
        canonical: &[Var<'g>],
        task: &Task,
        adapter: &InnerLoopAdapter,
        track_final: bool,
    ) -> Result<(AdaptationTrace, Var<'g>)> {
        let depth_count = self.config.num_updates;

        let before = self
            .evaluator
            .evaluate(&self.model, graph, task, canonical, false)?;

        let first = adapter.step(&self.model, graph, task, canonical)?;
        let mut trace = AdaptationTrace::new(task.query_size(), first.support_loss);
        trace.record(before.loss_value(), before.correct);

        let mut weights = first.weights;
        let mut final_loss = before.loss;
        for depth in 1..=depth_count {
            if depth > 1 {
                weights = adapter.step(&self.model, graph, task, &weights)?.weights;
            }
            let track = track_final && depth == depth_count;
            let eval = self
                .evaluator
                .evaluate(&self.model, graph, task, &weights, track)?;
            trace.record(eval.loss_value(), eval.correct);
            final_loss = eval.loss;
        }

        Ok((trace, final_loss))
    }

    fn report(&mut self, metrics: &MetaMetrics, step: u64) {
        let (before_loss, before_acc) = metrics.before();
        let (after_loss, after_acc) = metrics.after();
        self.sink.add_scalar(metrics::TRAIN_LOSS, metrics.support_loss, step);
        self.sink.add_scalar(metrics::BEFORE_LOSS, before_loss, step);
        self.sink.add_scalar(metrics::BEFORE_ACC, before_acc, step);
        self.sink.add_scalar(metrics::AFTER_LOSS, after_loss, step);
        self.sink.add_scalar(metrics::AFTER_ACC, after_acc, step);
    }

    /// Fast weights for `task` after `steps` first-order inner-loop steps.
    ///
    /// The canonical parameters are left untouched.
    pub fn adapt(&self, task: &Task, steps: usize) -> Result<Parameters> {
        let graph = Graph::new();
        let canonical = self.store.current().attach(&graph);
        let adapter = InnerLoopAdapter::first_order(self.config.update_lr);
        let fast = adapter.adapt(&self.model, &graph, task, &canonical, steps)?;
        Ok(Parameters::from_vars(&fast))
    }

    /// Class predictions for padded sequences under `parameters`
    pub fn predict(
        &self,
        parameters: &Parameters,
        inputs: &Array2<usize>,
        lengths: &[usize],
    ) -> Result<Vec<usize>> {
        let graph = Graph::new();
        let vars = parameters.attach(&graph);
        let logits = graph.no_grad(|| self.model.predict(&graph, inputs, lengths, &vars))?;
        Ok(argmax_rows(&softmax_rows(&logits.value())))
    }
}
