//! Snapshot and dead-letter sinks
//!
//! Sinks are append-only. Implementations:
//! - [`MemorySink`] / [`MemoryDeadLetter`]: in-process collectors
//! - [`channel::ChannelSink`]: bounded queue in front of a slower sink
//! - [`parquet::ParquetSnapshotSink`]: columnar part files
//! - [`file::JsonLinesSink`] / [`file::FileDeadLetter`]: newline-delimited output

pub mod channel;
pub mod file;
pub mod parquet;

pub use channel::{snapshot_channel, ChannelSink, SnapshotWriter};
pub use file::{FileDeadLetter, JsonLinesSink};
pub use parquet::ParquetSnapshotSink;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::aggregation::SnapshotRecord;
use crate::error::{AggregatorError, Result};

/// Destination for snapshot records
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Append one record
    async fn append(&self, record: &SnapshotRecord) -> Result<()>;

    /// Persist anything buffered
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Sink name for logs
    fn name(&self) -> &str {
        "SnapshotSink"
    }
}

/// Destination for records that failed validation
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Forward the original bytes, unmodified
    async fn send(&self, raw: &[u8], reason: &str) -> Result<()>;

    /// Persist anything buffered
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: SnapshotSink + ?Sized> SnapshotSink for Arc<T> {
    async fn append(&self, record: &SnapshotRecord) -> Result<()> {
        (**self).append(record).await
    }

    async fn flush(&self) -> Result<()> {
        (**self).flush().await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

#[async_trait]
impl<T: DeadLetterSink + ?Sized> DeadLetterSink for Arc<T> {
    async fn send(&self, raw: &[u8], reason: &str) -> Result<()> {
        (**self).send(raw, reason).await
    }

    async fn flush(&self) -> Result<()> {
        (**self).flush().await
    }
}

/// Collects snapshot records in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<SnapshotRecord>>,
    failures: AtomicUsize,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` appends
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Copy of everything appended so far
    pub fn records(&self) -> Vec<SnapshotRecord> {
        self.records.lock().clone()
    }

    /// Number of records appended
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether nothing was appended
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl SnapshotSink for MemorySink {
    async fn append(&self, record: &SnapshotRecord) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(AggregatorError::Sink("injected failure".to_string()));
        }
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// A dead-lettered record
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    /// Original bytes
    pub raw: Vec<u8>,
    /// Validation failure
    pub reason: String,
}

/// Collects dead letters in memory
#[derive(Debug, Default)]
pub struct MemoryDeadLetter {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetter {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything received so far
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }

    /// Number of dead letters received
    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    /// Whether nothing was received
    pub fn is_empty(&self) -> bool {
        self.letters.lock().is_empty()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetter {
    async fn send(&self, raw: &[u8], reason: &str) -> Result<()> {
        self.letters.lock().push(DeadLetter {
            raw: raw.to_vec(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}
