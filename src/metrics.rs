//! Scalar metric sinks.
//!
//! The meta-learner reports five scalars per meta-iteration under the tags
//! below, and the trainer adds one averaged record per validation pass under
//! the `validation/` tags. Sinks decide where they go: structured logs,
//! memory, or a JSON lines file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};

pub const TRAIN_LOSS: &str = "train/loss";
pub const BEFORE_LOSS: &str = "test/before_gradient_update/loss";
pub const BEFORE_ACC: &str = "test/before_gradient_update/acc";
pub const AFTER_LOSS: &str = "test/after_gradient_update/loss";
pub const AFTER_ACC: &str = "test/after_gradient_update/acc";

pub const VALIDATION_BEFORE_LOSS: &str = "validation/before_gradient_update/loss";
pub const VALIDATION_BEFORE_ACC: &str = "validation/before_gradient_update/acc";
pub const VALIDATION_AFTER_LOSS: &str = "validation/after_gradient_update/loss";
pub const VALIDATION_AFTER_ACC: &str = "validation/after_gradient_update/acc";

/// Receives `(tag, value, step)` scalars
pub trait MetricsSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64);

    fn flush(&mut self) {}
}

impl<S: MetricsSink + ?Sized> MetricsSink for Box<S> {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) {
        (**self).add_scalar(tag, value, step);
    }

    fn flush(&mut self) {
        (**self).flush();
    }
}

/// One recorded scalar.
///
/// JSON has no NaN or infinity, so non-finite values are written as the
/// strings `"NaN"`, `"inf"` and `"-inf"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub tag: String,
    #[serde(with = "scalar_value")]
    pub value: f64,
    pub step: u64,
    pub wall_time: DateTime<Utc>,
}

impl ScalarRecord {
    pub fn new(tag: &str, value: f64, step: u64) -> Self {
        Self {
            tag: tag.to_string(),
            value,
            step,
            wall_time: Utc::now(),
        }
    }
}

mod scalar_value {
    use serde::de::{self, Deserializer};
    use serde::{Deserialize, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_infinite() {
            serializer.serialize_str(if *value > 0.0 { "inf" } else { "-inf" })
        } else {
            serializer.serialize_f64(*value)
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(de::Error::custom(format!("invalid scalar value {other:?}"))),
            },
        }
    }
}

/// Emits every scalar as a structured `tracing` event
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) {
        info!(target: "few_shot_maml::metrics", tag, value, step, "scalar");
    }
}

/// Keeps every scalar in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Vec<ScalarRecord>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[ScalarRecord] {
        &self.records
    }

    /// Values recorded under `tag`, in insertion order
    pub fn values(&self, tag: &str) -> Vec<f64> {
        self.records
            .iter()
            .filter(|r| r.tag == tag)
            .map(|r| r.value)
            .collect()
    }

    pub fn latest(&self, tag: &str) -> Option<f64> {
        self.records.iter().rev().find(|r| r.tag == tag).map(|r| r.value)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl MetricsSink for MemorySink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) {
        self.records.push(ScalarRecord::new(tag, value, step));
    }
}

/// Writes one JSON object per scalar and line.
///
/// Write failures are logged and otherwise ignored so that a full disk does
/// not abort training.
#[derive(Debug)]
pub struct JsonLinesSink<W: Write> {
    writer: W,
    written: usize,
}

impl JsonLinesSink<BufWriter<File>> {
    /// Create (or truncate) a JSON lines file
    pub fn create(path: impl AsRef<Path>) -> crate::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    /// Lines written successfully
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn into_inner(mut self) -> W {
        MetricsSink::flush(&mut self);
        self.writer
    }

    fn write_record(&mut self, record: &ScalarRecord) -> crate::Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl<W: Write> MetricsSink for JsonLinesSink<W> {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) {
        match self.write_record(&ScalarRecord::new(tag, value, step)) {
            Ok(()) => self.written += 1,
            Err(e) => warn!(tag, step, error = %e, "Failed to write metric"),
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!(error = %e, "Failed to flush metrics");
        }
    }
}
