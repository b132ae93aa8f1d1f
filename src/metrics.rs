//! Pipeline counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Counters shared by every worker of a pipeline
#[derive(Debug)]
pub struct PipelineMetrics {
    records_received: AtomicU64,
    events_aggregated: AtomicU64,
    records_dead_lettered: AtomicU64,
    records_undecodable: AtomicU64,
    late_events: AtomicU64,
    sessions_completed: AtomicU64,
    unmatched_session_ends: AtomicU64,
    clock_anomalies: AtomicU64,
    snapshots_emitted: AtomicU64,
    windows_evicted: AtomicU64,
    sink_failures: AtomicU64,
    processing_nanos: AtomicU64,
    started: Instant,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self {
            records_received: AtomicU64::new(0),
            events_aggregated: AtomicU64::new(0),
            records_dead_lettered: AtomicU64::new(0),
            records_undecodable: AtomicU64::new(0),
            late_events: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            unmatched_session_ends: AtomicU64::new(0),
            clock_anomalies: AtomicU64::new(0),
            snapshots_emitted: AtomicU64::new(0),
            windows_evicted: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            processing_nanos: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Record a raw record arriving
    pub fn record_received(&self) {
        self.records_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a validated event applied to state
    pub fn record_aggregated(&self, elapsed: Duration) {
        self.events_aggregated.fetch_add(1, Ordering::Relaxed);
        self.processing_nanos
            .fetch_add(elapsed.as_nanos().min(u64::MAX as u128) as u64, Ordering::Relaxed);
    }

    /// Record a schema-invalid record forwarded to the dead-letter sink
    pub fn record_dead_lettered(&self) {
        self.records_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes that could not be decoded
    pub fn record_undecodable(&self) {
        self.records_undecodable.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event whose windows had all expired
    pub fn record_late(&self) {
        self.late_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a matched session
    pub fn record_session_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session end with no pending start
    pub fn record_unmatched_end(&self) {
        self.unmatched_session_ends.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session end earlier than its start
    pub fn record_clock_anomaly(&self) {
        self.clock_anomalies.fetch_add(1, Ordering::Relaxed);
    }

    /// Record snapshots handed to the sink
    pub fn record_snapshots(&self, count: usize) {
        self.snapshots_emitted
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record evicted windows
    pub fn record_evicted(&self, count: usize) {
        self.windows_evicted.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record a sink write that failed after retries
    pub fn record_sink_failure(&self) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let aggregated = self.events_aggregated.load(Ordering::Relaxed);
        let nanos = self.processing_nanos.load(Ordering::Relaxed);
        let uptime = self.started.elapsed().as_secs_f64();

        MetricsSnapshot {
            records_received: self.records_received.load(Ordering::Relaxed),
            events_aggregated: aggregated,
            records_dead_lettered: self.records_dead_lettered.load(Ordering::Relaxed),
            records_undecodable: self.records_undecodable.load(Ordering::Relaxed),
            late_events: self.late_events.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            unmatched_session_ends: self.unmatched_session_ends.load(Ordering::Relaxed),
            clock_anomalies: self.clock_anomalies.load(Ordering::Relaxed),
            snapshots_emitted: self.snapshots_emitted.load(Ordering::Relaxed),
            windows_evicted: self.windows_evicted.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            avg_processing_micros: if aggregated > 0 {
                nanos as f64 / aggregated as f64 / 1_000.0
            } else {
                0.0
            },
            events_per_second: if uptime > 0.0 {
                aggregated as f64 / uptime
            } else {
                0.0
            },
            uptime_seconds: uptime,
        }
    }
}

/// Serializable view of [`PipelineMetrics`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Raw records seen
    pub records_received: u64,
    /// Valid events applied to aggregation state
    pub events_aggregated: u64,
    /// Schema-invalid records forwarded to the dead-letter sink
    pub records_dead_lettered: u64,
    /// Records that were not valid JSON
    pub records_undecodable: u64,
    /// Events whose windows had all expired
    pub late_events: u64,
    /// Sessions closed with a non-negative duration
    pub sessions_completed: u64,
    /// Session ends with no pending start
    pub unmatched_session_ends: u64,
    /// Session ends earlier than their start
    pub clock_anomalies: u64,
    /// Snapshot records appended to the sink
    pub snapshots_emitted: u64,
    /// Windows reclaimed by sweeps
    pub windows_evicted: u64,
    /// Sink writes that failed after retries
    pub sink_failures: u64,
    /// Mean time spent routing one event
    pub avg_processing_micros: f64,
    /// Aggregated events per second since start
    pub events_per_second: f64,
    /// Seconds since the counters were created
    pub uptime_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = PipelineMetrics::new();
        metrics.record_received();
        metrics.record_received();
        metrics.record_aggregated(Duration::from_micros(10));
        metrics.record_dead_lettered();
        metrics.record_snapshots(2);
        metrics.record_evicted(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_received, 2);
        assert_eq!(snapshot.events_aggregated, 1);
        assert_eq!(snapshot.records_dead_lettered, 1);
        assert_eq!(snapshot.snapshots_emitted, 2);
        assert_eq!(snapshot.windows_evicted, 3);
        assert!((snapshot.avg_processing_micros - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(PipelineMetrics::new().snapshot()).unwrap();
        assert_eq!(json["records_received"], 0);
    }
}
