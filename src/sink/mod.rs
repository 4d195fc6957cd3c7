//! Metric sinks
//!
//! Where the training loop reports scalars. The loop never formats output
//! itself; it hands `(tag, step, scalars)` to a [`MetricsSink`].
//!
//! - [`TracingSink`]: one `tracing` event per record
//! - [`MemorySink`]: shared in-memory buffer, mostly for tests
//! - [`JsonlSink`]: one JSON object per line in a file
//! - [`MultiSink`]: forwards to several sinks

use crate::{FairHnError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Receiver of tagged scalar metrics
pub trait MetricsSink {
    fn record(&mut self, tag: &str, step: usize, scalars: &[(String, f32)]) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One recorded set of scalars
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub tag: String,
    pub step: usize,
    pub timestamp: DateTime<Utc>,
    pub scalars: BTreeMap<String, f32>,
}

impl MetricRecord {
    pub fn new(tag: &str, step: usize, scalars: &[(String, f32)]) -> Self {
        Self {
            tag: tag.to_string(),
            step,
            timestamp: Utc::now(),
            scalars: scalars.iter().cloned().collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        self.scalars.get(name).copied()
    }
}

// =============================================================================
// Tracing
// =============================================================================

/// Logs every record through `tracing`
///
/// Records with many scalars (per-client evaluations) are logged with their
/// headline values only; the rest go to debug level.
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&mut self, tag: &str, step: usize, scalars: &[(String, f32)]) -> Result<()> {
        let headline: Vec<String> = scalars
            .iter()
            .filter(|(name, _)| !name.contains('/'))
            .map(|(name, value)| format!("{}={:.4}", name, value))
            .collect();
        info!("[{}] step {}: {}", tag, step, headline.join(" "));

        for (name, value) in scalars.iter().filter(|(name, _)| name.contains('/')) {
            tracing::debug!("[{}] step {}: {}={:.4}", tag, step, name, value);
        }
        Ok(())
    }
}

// =============================================================================
// Memory
// =============================================================================

/// Cloneable handle to an in-memory record buffer
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<MetricRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record so far
    pub fn records(&self) -> Vec<MetricRecord> {
        self.records.lock().clone()
    }

    /// Records carrying `tag`
    pub fn tagged(&self, tag: &str) -> Vec<MetricRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.tag == tag)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl MetricsSink for MemorySink {
    fn record(&mut self, tag: &str, step: usize, scalars: &[(String, f32)]) -> Result<()> {
        self.records.lock().push(MetricRecord::new(tag, step, scalars));
        Ok(())
    }
}

// =============================================================================
// JSON lines
// =============================================================================

/// Appends records to a file as JSON lines
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    /// Create (or truncate) the file at `path`
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl MetricsSink for JsonlSink {
    fn record(&mut self, tag: &str, step: usize, scalars: &[(String, f32)]) -> Result<()> {
        let record = MetricRecord::new(tag, step, scalars);
        serde_json::to_writer(&mut self.writer, &record)
            .map_err(|e| FairHnError::Serialization(format!("metric record: {}", e)))?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

// =============================================================================
// Fan-out
// =============================================================================

/// Forwards every record to each inner sink in order
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn MetricsSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MetricsSink for MultiSink {
    fn record(&mut self, tag: &str, step: usize, scalars: &[(String, f32)]) -> Result<()> {
        for sink in &mut self.sinks {
            sink.record(tag, step, scalars)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}
