//! Bounded queue in front of a slower snapshot sink
//!
//! [`ChannelSink::append`] waits while the queue is full, so a slow downstream
//! sink slows the router instead of losing records. A [`SnapshotWriter`] task
//! drains the queue into the inner sink and flushes it by size and by interval.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::SnapshotSink;
use crate::aggregation::SnapshotRecord;
use crate::error::{AggregatorError, Result};
use crate::retry::{RetryExecutor, RetryPolicy};

/// Sender half of a snapshot queue
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<SnapshotRecord>,
}

#[async_trait]
impl SnapshotSink for ChannelSink {
    async fn append(&self, record: &SnapshotRecord) -> Result<()> {
        self.sender
            .send(record.clone())
            .await
            .map_err(|_| AggregatorError::Channel("snapshot writer has stopped".to_string()))
    }

    fn name(&self) -> &str {
        "channel"
    }
}

/// Drains a snapshot queue into an inner sink
pub struct SnapshotWriter {
    receiver: mpsc::Receiver<SnapshotRecord>,
    inner: Arc<dyn SnapshotSink>,
    flush_every: usize,
    flush_interval: Duration,
    retry: RetryExecutor,
}

/// Create a queue of `capacity` records in front of `inner`
pub fn snapshot_channel(
    capacity: usize,
    inner: Arc<dyn SnapshotSink>,
) -> (ChannelSink, SnapshotWriter) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let writer = SnapshotWriter {
        receiver,
        inner,
        flush_every: 1_000,
        flush_interval: Duration::from_secs(5),
        retry: RetryExecutor::new(RetryPolicy::default()),
    };
    (ChannelSink { sender }, writer)
}

impl SnapshotWriter {
    /// Flush after this many records
    pub fn with_flush_every(mut self, records: usize) -> Self {
        self.flush_every = records.max(1);
        self
    }

    /// Flush at least this often while records are pending
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Retry policy for inner sink writes
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = RetryExecutor::new(policy);
        self
    }

    /// Run on the current task until every sender is dropped
    ///
    /// Returns the number of records written. An inner sink error that
    /// survives the retry policy stops the writer, which closes the queue and
    /// surfaces as a channel error on the next append.
    pub async fn run(mut self) -> Result<u64> {
        info!(
            "Snapshot writer started (sink: {}, flush every {} records or {:?})",
            self.inner.name(),
            self.flush_every,
            self.flush_interval
        );

        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut written = 0u64;
        let mut unflushed = 0usize;

        loop {
            tokio::select! {
                next = self.receiver.recv() => {
                    let Some(record) = next else { break };
                    if let Err(e) = self.write(&record).await {
                        error!("Snapshot writer giving up: {}", e);
                        self.receiver.close();
                        return Err(e);
                    }
                    written += 1;
                    unflushed += 1;
                    if unflushed >= self.flush_every {
                        self.flush().await?;
                        unflushed = 0;
                    }
                }
                _ = ticker.tick() => {
                    if unflushed > 0 {
                        self.flush().await?;
                        unflushed = 0;
                    }
                }
            }
        }

        self.flush().await?;
        info!("Snapshot writer stopped after {} records", written);
        Ok(written)
    }

    /// Run on a spawned task
    pub fn spawn(self) -> JoinHandle<Result<u64>> {
        tokio::spawn(self.run())
    }

    async fn write(&self, record: &SnapshotRecord) -> Result<()> {
        let inner = &self.inner;
        self.retry
            .execute_with_predicate(move || inner.append(record), AggregatorError::is_retryable)
            .await
            .into_result()
    }

    async fn flush(&self) -> Result<()> {
        debug!("Flushing {}", self.inner.name());
        let inner = &self.inner;
        self.retry
            .execute_with_predicate(move || inner.flush(), AggregatorError::is_retryable)
            .await
            .into_result()
    }
}
