//! Meta-learning configuration

use crate::{MAMLError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Hyperparameters of the meta-learner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    /// Outer-loop (meta) learning rate
    pub meta_lr: f64,

    /// Inner-loop (adaptation) learning rate
    pub update_lr: f64,

    /// Number of inner-loop gradient steps per task
    pub num_updates: usize,

    /// Examples per class (K-shot)
    pub k_shot: usize,

    /// Classes per task (N-way)
    pub num_classes: usize,

    /// Tasks per meta-iteration
    pub batch_size: usize,

    /// Request accelerated execution. Only CPU execution is available, so a
    /// warning is logged and the flag is otherwise ignored.
    pub use_gpu: bool,

    /// Drop second-order terms from the meta-gradient (FOMAML)
    pub first_order: bool,

    // Adam
    /// Exponential decay of the first moment estimate
    pub adam_beta1: f64,

    /// Exponential decay of the second moment estimate
    pub adam_beta2: f64,

    /// Numerical stability term
    pub adam_epsilon: f64,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            meta_lr: 0.001,
            update_lr: 0.4,
            num_updates: 1,
            k_shot: 5,
            num_classes: 2,
            batch_size: 4,
            use_gpu: false,
            first_order: false,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,
        }
    }
}

impl MetaConfig {
    /// Create a new config with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set the outer-loop learning rate
    pub fn with_meta_lr(mut self, lr: f64) -> Self {
        self.meta_lr = lr;
        self
    }

    /// Builder: set the inner-loop learning rate
    pub fn with_update_lr(mut self, lr: f64) -> Self {
        self.update_lr = lr;
        self
    }

    /// Builder: set the adaptation depth
    pub fn with_num_updates(mut self, num_updates: usize) -> Self {
        self.num_updates = num_updates;
        self
    }

    /// Builder: set K and N
    pub fn with_shots(mut self, k_shot: usize, num_classes: usize) -> Self {
        self.k_shot = k_shot;
        self.num_classes = num_classes;
        self
    }

    /// Builder: set tasks per meta-iteration
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Builder: toggle the first-order approximation
    pub fn with_first_order(mut self, first_order: bool) -> Self {
        self.first_order = first_order;
        self
    }

    pub fn with_use_gpu(mut self, use_gpu: bool) -> Self {
        self.use_gpu = use_gpu;
        self
    }

    /// Expected query-set size per task (`k_shot * num_classes`)
    pub fn query_size(&self) -> usize {
        self.k_shot * self.num_classes
    }

    pub fn validate(&self) -> Result<()> {
        for (name, lr) in [("meta_lr", self.meta_lr), ("update_lr", self.update_lr)] {
            if !lr.is_finite() || lr <= 0.0 {
                return Err(MAMLError::Config(format!("{name} must be positive, got {lr}")));
            }
        }
        if self.num_updates == 0 {
            return Err(MAMLError::Config("num_updates must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(MAMLError::Config("batch_size must be at least 1".to_string()));
        }
        if self.k_shot == 0 {
            return Err(MAMLError::Config("k_shot must be at least 1".to_string()));
        }
        if self.num_classes < 2 {
            return Err(MAMLError::Config("num_classes must be at least 2".to_string()));
        }
        for (name, beta) in [("adam_beta1", self.adam_beta1), ("adam_beta2", self.adam_beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(MAMLError::Config(format!("{name} must lie in [0, 1), got {beta}")));
            }
        }
        if !self.adam_epsilon.is_finite() || self.adam_epsilon <= 0.0 {
            return Err(MAMLError::Config("adam_epsilon must be positive".to_string()));
        }
        Ok(())
    }

    /// Load and validate a JSON config. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MetaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.query_size(), 10);
        assert!(!config.first_order);
    }

    #[test]
    fn test_builder() {
        let config = MetaConfig::new()
            .with_meta_lr(0.01)
            .with_update_lr(0.1)
            .with_num_updates(3)
            .with_shots(2, 4)
            .with_batch_size(8)
            .with_first_order(true);

        assert_eq!(config.meta_lr, 0.01);
        assert_eq!(config.num_updates, 3);
        assert_eq!(config.query_size(), 8);
        assert!(config.first_order);
    }

    #[test]
    fn test_validation() {
        assert!(MetaConfig::default().with_num_updates(0).validate().is_err());
        assert!(MetaConfig::default().with_batch_size(0).validate().is_err());
        assert!(MetaConfig::default().with_update_lr(-0.1).validate().is_err());
        assert!(MetaConfig::default().with_meta_lr(f64::NAN).validate().is_err());
        assert!(MetaConfig::default().with_shots(5, 1).validate().is_err());
    }

    #[test]
    fn test_json_round_trip_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{ "num_updates": 3, "update_lr": 0.05 }"#).unwrap();

        let config = MetaConfig::from_json_file(&path).unwrap();
        assert_eq!(config.num_updates, 3);
        assert_eq!(config.update_lr, 0.05);
        assert_eq!(config.batch_size, MetaConfig::default().batch_size);

        let out = dir.path().join("full.json");
        config.to_json_file(&out).unwrap();
        assert_eq!(MetaConfig::from_json_file(&out).unwrap(), config);
    }

    #[test]
    fn test_invalid_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{ "num_updates": 0 }"#).unwrap();
        assert!(matches!(MetaConfig::from_json_file(&path), Err(MAMLError::Config(_))));
    }
}
