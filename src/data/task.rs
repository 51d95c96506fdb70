//! Few-shot tasks and task batches.

use crate::{MAMLError, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// One few-shot problem: a support (train) split used for adaptation and a
/// query (test) split used for evaluation.
///
/// Inputs are padded token-id matrices `[examples, max_len]`; `lens_*` hold the
/// number of valid tokens per row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub x_train: Array2<usize>,
    pub y_train: Vec<usize>,
    pub lens_train: Vec<usize>,
    pub x_test: Array2<usize>,
    pub y_test: Vec<usize>,
    pub lens_test: Vec<usize>,
}

impl Task {
    /// Create a task, checking that rows, labels and lengths agree per split
    pub fn new(
        x_train: Array2<usize>,
        y_train: Vec<usize>,
        lens_train: Vec<usize>,
        x_test: Array2<usize>,
        y_test: Vec<usize>,
        lens_test: Vec<usize>,
    ) -> Result<Self> {
        check_split("support", &x_train, &y_train, &lens_train)?;
        check_split("query", &x_test, &y_test, &lens_test)?;
        Ok(Self {
            x_train,
            y_train,
            lens_train,
            x_test,
            y_test,
            lens_test,
        })
    }

    /// Number of support examples
    pub fn support_size(&self) -> usize {
        self.y_train.len()
    }

    /// Number of query examples
    pub fn query_size(&self) -> usize {
        self.y_test.len()
    }
}

fn check_split(name: &str, x: &Array2<usize>, y: &[usize], lens: &[usize]) -> Result<()> {
    let rows = x.nrows();
    if rows == 0 {
        return Err(MAMLError::InvalidInput(format!("{name} set is empty")));
    }
    if y.len() != rows || lens.len() != rows {
        return Err(MAMLError::ShapeMismatch(format!(
            "{name} set has {rows} sequences, {} labels and {} lengths",
            y.len(),
            lens.len()
        )));
    }
    Ok(())
}

/// Ordered tasks processed together in one meta-iteration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskBatch {
    tasks: Vec<Task>,
}

impl TaskBatch {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    pub fn push(&mut self, task: Task) {
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Task> {
        self.tasks.iter()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Query examples summed over every task
    pub fn total_query_size(&self) -> usize {
        self.tasks.iter().map(Task::query_size).sum()
    }
}

impl From<Vec<Task>> for TaskBatch {
    fn from(tasks: Vec<Task>) -> Self {
        Self::new(tasks)
    }
}

impl<'a> IntoIterator for &'a TaskBatch {
    type Item = &'a Task;
    type IntoIter = std::slice::Iter<'a, Task>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn tiny_task() -> Task {
        Task::new(
            array![[1, 2], [3, 0]],
            vec![0, 1],
            vec![2, 1],
            array![[4, 5], [6, 7], [1, 0]],
            vec![1, 0, 1],
            vec![2, 2, 1],
        )
        .unwrap()
    }

    #[test]
    fn test_task_sizes() {
        let task = tiny_task();
        assert_eq!(task.support_size(), 2);
        assert_eq!(task.query_size(), 3);
    }

    #[test]
    fn test_task_validation() {
        let mismatched = Task::new(
            array![[1, 2]],
            vec![0, 1],
            vec![2],
            array![[1, 2]],
            vec![0],
            vec![2],
        );
        assert!(matches!(mismatched, Err(MAMLError::ShapeMismatch(_))));

        let empty_query = Task::new(
            array![[1, 2]],
            vec![0],
            vec![2],
            Array2::zeros((0, 2)),
            vec![],
            vec![],
        );
        assert!(matches!(empty_query, Err(MAMLError::InvalidInput(_))));
    }

    #[test]
    fn test_batch() {
        let mut batch = TaskBatch::default();
        assert!(batch.is_empty());

        batch.push(tiny_task());
        batch.push(tiny_task());
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.total_query_size(), 6);
        assert_eq!((&batch).into_iter().count(), 2);
    }
}
