//! Task data structures and a synthetic task source

pub mod synthetic;
pub mod task;

pub use synthetic::{SamplerConfig, SyntheticTaskSampler};
pub use task::{Task, TaskBatch};

use crate::Result;

/// Anything that can hand out batches of few-shot tasks
pub trait TaskSource {
    fn next_batch(&mut self, num_tasks: usize) -> Result<TaskBatch>;
}

impl TaskSource for SyntheticTaskSampler {
    fn next_batch(&mut self, num_tasks: usize) -> Result<TaskBatch> {
        self.sample_batch(num_tasks)
    }
}

impl<T: TaskSource + ?Sized> TaskSource for &mut T {
    fn next_batch(&mut self, num_tasks: usize) -> Result<TaskBatch> {
        (**self).next_batch(num_tasks)
    }
}
