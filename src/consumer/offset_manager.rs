//! Manual offset management
//!
//! Workers finish messages of one partition out of order when the partition's
//! tenants hash to different workers. Only the contiguous prefix of processed
//! offsets is ever committed, so a restart never skips an unprocessed message.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use rdkafka::consumer::{CommitMode, Consumer};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, warn};

use super::error::{ConsumerError, ConsumerResult};

#[derive(Debug, Default)]
struct PartitionOffsets {
    /// Offsets read and not yet below the commit point; `true` once processed
    inflight: BTreeMap<i64, bool>,
    /// Next offset to commit, i.e. one past the last contiguous processed offset
    committable: Option<i64>,
    /// Last offset handed to the broker
    committed: Option<i64>,
}

impl PartitionOffsets {
    fn advance(&mut self) {
        while let Some(entry) = self.inflight.first_entry() {
            if !*entry.get() {
                break;
            }
            let (offset, _) = entry.remove_entry();
            self.committable = Some(offset + 1);
        }
    }
}

/// Tracks read and processed offsets per partition
#[derive(Debug, Default)]
pub struct OffsetManager {
    partitions: Mutex<HashMap<(String, i32), PartitionOffsets>>,
}

impl OffsetManager {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message as read, before it is handed to a worker
    pub fn track(&self, topic: &str, partition: i32, offset: i64) {
        let mut partitions = self.partitions.lock();
        partitions
            .entry((topic.to_string(), partition))
            .or_default()
            .inflight
            .insert(offset, false);
    }

    /// Mark a tracked message as processed
    pub fn complete(&self, topic: &str, partition: i32, offset: i64) {
        let mut partitions = self.partitions.lock();
        let Some(state) = partitions.get_mut(&(topic.to_string(), partition)) else {
            warn!("Completed offset {} for untracked partition {}/{}", offset, topic, partition);
            return;
        };
        match state.inflight.get_mut(&offset) {
            Some(done) => *done = true,
            None => {
                warn!("Completed untracked offset {} on {}/{}", offset, topic, partition);
                return;
            }
        }
        state.advance();
    }

    /// Next offset to commit per partition, for partitions that moved
    pub fn committable(&self) -> Vec<(String, i32, i64)> {
        let partitions = self.partitions.lock();
        let mut offsets: Vec<(String, i32, i64)> = partitions
            .iter()
            .filter_map(|((topic, partition), state)| match state.committable {
                Some(next) if state.committed != Some(next) => {
                    Some((topic.clone(), *partition, next))
                }
                _ => None,
            })
            .collect();
        offsets.sort();
        offsets
    }

    /// Record offsets as committed
    pub fn mark_committed(&self, offsets: &[(String, i32, i64)]) {
        let mut partitions = self.partitions.lock();
        for (topic, partition, next) in offsets {
            if let Some(state) = partitions.get_mut(&(topic.clone(), *partition)) {
                state.committed = Some(*next);
            }
        }
    }

    /// Messages read but not yet below the commit point
    pub fn pending_count(&self) -> usize {
        self.partitions
            .lock()
            .values()
            .map(|state| state.inflight.len())
            .sum()
    }

    /// Commit every partition whose processed prefix advanced
    pub fn commit<C: Consumer>(&self, consumer: &C) -> ConsumerResult<usize> {
        let offsets = self.committable();
        if offsets.is_empty() {
            return Ok(0);
        }

        let mut tpl = TopicPartitionList::new();
        for (topic, partition, next) in &offsets {
            tpl.add_partition_offset(topic, *partition, Offset::Offset(*next))
                .map_err(|e| ConsumerError::Offset(format!("{}/{}: {}", topic, partition, e)))?;
        }

        consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| ConsumerError::Offset(format!("Commit failed: {}", e)))?;
        self.mark_committed(&offsets);
        debug!("Committed offsets for {} partitions", offsets.len());
        Ok(offsets.len())
    }
}
