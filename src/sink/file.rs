//! Newline-delimited sinks for snapshots and dead letters

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{DeadLetterSink, SnapshotSink};
use crate::aggregation::SnapshotRecord;
use crate::error::{AggregatorError, Result};

/// Writes each snapshot as one JSON object per line
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// Wrap a writer
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Unwrap the writer
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl JsonLinesSink<BufWriter<File>> {
    /// Append to the file at `path`, creating it if needed
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

#[async_trait]
impl<W: Write + Send> SnapshotSink for JsonLinesSink<W> {
    async fn append(&self, record: &SnapshotRecord) -> Result<()> {
        let line = serde_json::to_vec(record)?;
        let mut writer = self.writer.lock();
        writer
            .write_all(&line)
            .and_then(|_| writer.write_all(b"\n"))
            .map_err(|e| AggregatorError::Sink(format!("Failed to write snapshot: {}", e)))
    }

    async fn flush(&self) -> Result<()> {
        self.writer
            .lock()
            .flush()
            .map_err(|e| AggregatorError::Sink(format!("Failed to flush snapshots: {}", e)))
    }

    fn name(&self) -> &str {
        "json-lines"
    }
}

/// Appends dead-lettered records to a file, one per line
///
/// Each line is the original record exactly as received.
pub struct FileDeadLetter {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileDeadLetter {
    /// Append to the file at `path`, creating it if needed
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Dead-letter file location
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeadLetterSink for FileDeadLetter {
    async fn send(&self, raw: &[u8], reason: &str) -> Result<()> {
        debug!("Dead-lettering record to {}: {}", self.path.display(), reason);
        let mut writer = self.writer.lock();
        writer
            .write_all(raw)
            .and_then(|_| writer.write_all(b"\n"))
            .map_err(|e| AggregatorError::DeadLetter(format!("Failed to write dead letter: {}", e)))
    }

    async fn flush(&self) -> Result<()> {
        self.writer
            .lock()
            .flush()
            .map_err(|e| AggregatorError::DeadLetter(format!("Failed to flush dead letters: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::SessionSnapshot;

    #[tokio::test]
    async fn test_json_lines_output() {
        let sink = JsonLinesSink::new(Vec::new());
        sink.append(&SnapshotRecord::Session(SessionSnapshot {
            tenant: "a".to_string(),
            total_duration: 15.0,
            count: 1,
        }))
        .await
        .unwrap();

        let output = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(
            output,
            "{\"kind\":\"session\",\"tenant\":\"a\",\"total_duration\":15.0,\"count\":1}\n"
        );
    }

    #[tokio::test]
    async fn test_dead_letter_file_keeps_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead.jsonl");
        let dlq = FileDeadLetter::open(&path).unwrap();

        dlq.send(br#"{"tenant_id":"a"}"#, "missing field").await.unwrap();
        dlq.send(b"[1,2]", "not an object").await.unwrap();
        dlq.flush().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "{\"tenant_id\":\"a\"}\n[1,2]\n");
    }
}
