//! Parquet snapshot sink
//!
//! Window and session snapshots are buffered separately and written as part
//! files under `window_snapshots/` and `session_snapshots/` of the output
//! directory. Each part is written to a temporary name and renamed into place,
//! so readers never observe a partial file.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tracing::{debug, info, warn};

use super::SnapshotSink;
use crate::aggregation::{SessionSnapshot, SnapshotRecord, WindowSnapshot};
use crate::error::{AggregatorError, Result};

/// Subdirectory for window snapshots
pub const WINDOW_DIR: &str = "window_snapshots";
/// Subdirectory for session snapshots
pub const SESSION_DIR: &str = "session_snapshots";

/// Batches held in memory while part writes keep failing
const MAX_BUFFERED_BATCHES: usize = 4;

/// Arrow schema of window snapshot files
pub fn window_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("tenant", DataType::Utf8, false),
        Field::new("event_type", DataType::Utf8, false),
        Field::new("occurrences", DataType::UInt64, false),
        Field::new("window_size", DataType::Float64, false),
    ]))
}

/// Arrow schema of session snapshot files
pub fn session_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("tenant", DataType::Utf8, false),
        Field::new("total_duration", DataType::Float64, false),
        Field::new("count", DataType::UInt64, false),
    ]))
}

fn window_batch(rows: &[WindowSnapshot]) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.tenant.as_str()))),
        Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.event_type.as_str()),
        )),
        Arc::new(UInt64Array::from_iter_values(rows.iter().map(|r| r.occurrences))),
        Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.window_size))),
    ];
    Ok(RecordBatch::try_new(window_schema(), columns)?)
}

fn session_batch(rows: &[SessionSnapshot]) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.tenant.as_str()))),
        Arc::new(Float64Array::from_iter_values(
            rows.iter().map(|r| r.total_duration),
        )),
        Arc::new(UInt64Array::from_iter_values(rows.iter().map(|r| r.count))),
    ];
    Ok(RecordBatch::try_new(session_schema(), columns)?)
}

#[derive(Debug, Default)]
struct Buffers {
    windows: Vec<WindowSnapshot>,
    sessions: Vec<SessionSnapshot>,
    next_part: u64,
}

/// Writes snapshots as Parquet part files
#[derive(Debug)]
pub struct ParquetSnapshotSink {
    root: PathBuf,
    batch_size: usize,
    run_id: String,
    buffers: Mutex<Buffers>,
}

impl ParquetSnapshotSink {
    /// Create the output directories under `root`
    pub fn create(root: impl Into<PathBuf>, batch_size: usize) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(WINDOW_DIR))?;
        fs::create_dir_all(root.join(SESSION_DIR))?;
        info!("Writing Parquet snapshots under {}", root.display());

        Ok(Self {
            root,
            batch_size: batch_size.max(1),
            run_id: Utc::now().format("%Y%m%dT%H%M%S%3f").to_string(),
            buffers: Mutex::new(Buffers::default()),
        })
    }

    /// Output directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Records buffered and not yet written
    pub fn pending(&self) -> usize {
        let buffers = self.buffers.lock();
        buffers.windows.len() + buffers.sessions.len()
    }

    fn part_path(&self, dir: &str, part: u64) -> PathBuf {
        self.root
            .join(dir)
            .join(format!("part-{}-{:05}.parquet", self.run_id, part))
    }

    /// Write buffered rows; rows stay buffered if the write fails
    fn write_buffers(&self, buffers: &mut Buffers, force: bool) -> Result<()> {
        if !buffers.windows.is_empty() && (force || buffers.windows.len() >= self.batch_size) {
            let batch = window_batch(&buffers.windows)?;
            let path = self.part_path(WINDOW_DIR, buffers.next_part);
            write_part(&path, &batch)?;
            buffers.next_part += 1;
            debug!("Wrote {} window snapshots to {}", batch.num_rows(), path.display());
            buffers.windows.clear();
        }
        if !buffers.sessions.is_empty() && (force || buffers.sessions.len() >= self.batch_size) {
            let batch = session_batch(&buffers.sessions)?;
            let path = self.part_path(SESSION_DIR, buffers.next_part);
            write_part(&path, &batch)?;
            buffers.next_part += 1;
            debug!("Wrote {} session snapshots to {}", batch.num_rows(), path.display());
            buffers.sessions.clear();
        }
        Ok(())
    }
}

fn write_part(path: &Path, batch: &RecordBatch) -> Result<()> {
    let staging = path.with_extension("parquet.tmp");
    let file = File::create(&staging)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;

    fs::rename(&staging, path)?;
    Ok(())
}

#[async_trait]
impl SnapshotSink for ParquetSnapshotSink {
    async fn append(&self, record: &SnapshotRecord) -> Result<()> {
        let mut buffers = self.buffers.lock();
        match record {
            SnapshotRecord::Window(w) => buffers.windows.push(w.clone()),
            SnapshotRecord::Session(s) => buffers.sessions.push(s.clone()),
        }

        // A failed part write is retried by the next append or flush until the
        // table holds MAX_BUFFERED_BATCHES batches; past that the record is
        // taken back and the failure returned
        let Err(e) = self.write_buffers(&mut buffers, false) else {
            return Ok(());
        };
        let limit = self.batch_size.saturating_mul(MAX_BUFFERED_BATCHES);
        let over_limit = match record {
            SnapshotRecord::Window(_) => buffers.windows.len() > limit,
            SnapshotRecord::Session(_) => buffers.sessions.len() > limit,
        };
        if !over_limit {
            warn!("Parquet part write failed, keeping rows buffered: {}", e);
            return Ok(());
        }

        match record {
            SnapshotRecord::Window(_) => {
                buffers.windows.pop();
            }
            SnapshotRecord::Session(_) => {
                buffers.sessions.pop();
            }
        }
        Err(AggregatorError::Sink(format!(
            "Parquet part write failed with {} rows buffered: {}",
            limit, e
        )))
    }

    async fn flush(&self) -> Result<()> {
        let mut buffers = self.buffers.lock();
        self.write_buffers(&mut buffers, true)
            .map_err(|e| AggregatorError::Sink(format!("Parquet flush failed: {}", e)))
    }

    fn name(&self) -> &str {
        "parquet"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    fn parts(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "parquet"))
            .collect();
        files.sort();
        files
    }

    fn row_count(path: &Path) -> usize {
        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path).unwrap())
            .unwrap()
            .build()
            .unwrap();
        reader.map(|batch| batch.unwrap().num_rows()).sum()
    }

    fn window(n: u64) -> SnapshotRecord {
        SnapshotRecord::Window(WindowSnapshot {
            tenant: "t1".to_string(),
            event_type: "click".to_string(),
            occurrences: n,
            window_size: 60.0,
        })
    }

    #[tokio::test]
    async fn test_batches_by_size_and_flush() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ParquetSnapshotSink::create(dir.path(), 2).unwrap();

        for n in 1..=3 {
            sink.append(&window(n)).await.unwrap();
        }
        assert_eq!(parts(&dir.path().join(WINDOW_DIR)).len(), 1);
        assert_eq!(sink.pending(), 1);

        sink.append(&SnapshotRecord::Session(SessionSnapshot {
            tenant: "t1".to_string(),
            total_duration: 12.5,
            count: 2,
        }))
        .await
        .unwrap();
        sink.flush().await.unwrap();
        assert_eq!(sink.pending(), 0);

        let windows = parts(&dir.path().join(WINDOW_DIR));
        assert_eq!(windows.len(), 2);
        assert_eq!(row_count(&windows[0]), 2);
        assert_eq!(row_count(&windows[1]), 1);

        let sessions = parts(&dir.path().join(SESSION_DIR));
        assert_eq!(sessions.len(), 1);
        assert_eq!(row_count(&sessions[0]), 1);
    }

    #[tokio::test]
    async fn test_failing_writes_surface_once_buffer_is_full() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ParquetSnapshotSink::create(dir.path(), 1).unwrap();
        fs::remove_dir_all(dir.path().join(WINDOW_DIR)).unwrap();

        for n in 1..=4 {
            sink.append(&window(n)).await.unwrap();
        }
        assert_eq!(sink.pending(), 4);

        let result = sink.append(&window(5)).await;
        assert!(matches!(result, Err(AggregatorError::Sink(_))));
        assert_eq!(sink.pending(), 4);

        fs::create_dir_all(dir.path().join(WINDOW_DIR)).unwrap();
        sink.append(&window(5)).await.unwrap();
        assert_eq!(sink.pending(), 0);

        let windows = parts(&dir.path().join(WINDOW_DIR));
        assert_eq!(windows.len(), 1);
        assert_eq!(row_count(&windows[0]), 5);
    }

    #[tokio::test]
    async fn test_flush_without_records_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ParquetSnapshotSink::create(dir.path(), 10).unwrap();
        sink.flush().await.unwrap();
        assert!(parts(&dir.path().join(WINDOW_DIR)).is_empty());
        assert!(parts(&dir.path().join(SESSION_DIR)).is_empty());
    }

    #[test]
    fn test_window_batch_columns() {
        let rows = vec![WindowSnapshot {
            tenant: "a".to_string(),
            event_type: "view".to_string(),
            occurrences: 7,
            window_size: 30.0,
        }];
        let batch = window_batch(&rows).unwrap();
        assert_eq!(batch.num_columns(), 4);
        let occurrences = batch
            .column(2)
            .as_any()
            .downcast_ref::<UInt64Array>()
            .unwrap();
        assert_eq!(occurrences.value(0), 7);
    }
}
