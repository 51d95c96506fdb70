//! # Few-Shot MAML
//!
//! This crate implements Model-Agnostic Meta-Learning (MAML) for few-shot
//! sequence classification. MAML learns an initialization of a model's
//! parameters from which a handful of gradient steps on a new task's support
//! set are enough to classify that task's query set well.
//!
//! ## Features
//!
//! - Full second-order MAML: the meta-gradient flows back through the
//!   inner-loop gradient computation
//! - First-order approximation (FOMAML)
//! - A small reverse-mode autograd graph over `ndarray` tensors that supports
//!   gradients of gradients
//! - Per-depth before/after adaptation metrics and pluggable metric sinks
//! - Meta-training driver with validation passes and JSON checkpoints
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use few_shot_maml::prelude::*;
//!
//! let config = MetaConfig::default().with_num_updates(2);
//! let model = SequenceClassifier::new(ClassifierConfig::default());
//! let mut learner = MetaLearner::new(model, config.clone(), 42)?;
//!
//! let mut sampler = SyntheticTaskSampler::new(SamplerConfig::from_meta(&config), 7)?;
//! let batch = sampler.sample_batch(config.batch_size)?;
//! let metrics = learner.run_meta_iteration(&batch, 0, false)?;
//! println!("before: {:.3}, after: {:.3}", metrics.before().1, metrics.after().1);
//! ```

pub mod autograd;
pub mod config;
pub mod data;
pub mod maml;
pub mod metrics;
pub mod model;
pub mod training;

pub use autograd::{cross_entropy, Graph, Var};
pub use config::MetaConfig;
pub use data::synthetic::{SamplerConfig, SyntheticTaskSampler};
pub use data::TaskSource;
pub use data::task::{Task, TaskBatch};
pub use maml::{MetaLearner, MetaMetrics};
pub use metrics::{JsonLinesSink, MemorySink, MetricsSink, TracingSink};
pub use model::classifier::{ClassifierConfig, SequenceClassifier};
pub use model::params::{ParameterStore, Parameters};
pub use model::DifferentiableModel;
pub use training::{Checkpoint, MetaTrainer, TrainerConfig, TrainingRecord};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::autograd::{cross_entropy, Graph, Var};
    pub use crate::config::MetaConfig;
    pub use crate::data::synthetic::{SamplerConfig, SyntheticTaskSampler};
    pub use crate::data::task::{Task, TaskBatch};
    pub use crate::data::TaskSource;
    pub use crate::maml::{
        AdaptationTrace, Evaluation, Evaluator, InnerLoopAdapter, MetaLearner, MetaMetrics,
        MetaOptimizer,
    };
    pub use crate::metrics::{JsonLinesSink, MemorySink, MetricsSink, TracingSink};
    pub use crate::model::classifier::{ClassifierConfig, SequenceClassifier};
    pub use crate::model::params::{ParameterStore, Parameters};
    pub use crate::model::DifferentiableModel;
    pub use crate::training::{Checkpoint, MetaTrainer, TrainerConfig, TrainingRecord};
    pub use crate::{MAMLError, Result};
}

/// Error types for the crate
#[derive(thiserror::Error, Debug)]
pub enum MAMLError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Non-differentiable path: {0}")]
    NonDifferentiable(String),

    #[error("Empty task batch: at least one task is required per meta-iteration")]
    EmptyTaskBatch,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MAMLError>;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
