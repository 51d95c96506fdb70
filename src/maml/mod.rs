//! MAML meta-learning
//!
//! - [`adapter`]: inner-loop gradient steps producing fast weights
//! - [`evaluator`]: query-set loss and accuracy
//! - [`optimizer`]: outer-loop Adam update
//! - [`algorithm`]: the meta-iteration tying them together

pub mod adapter;
pub mod algorithm;
pub mod evaluator;
pub mod optimizer;
pub mod trace;

pub use adapter::{AdaptationStep, InnerLoopAdapter};
pub use algorithm::MetaLearner;
pub use evaluator::{Evaluation, Evaluator};
pub use optimizer::MetaOptimizer;
pub use trace::{AdaptationTrace, MetaMetrics};
