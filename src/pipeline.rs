//! Record pipeline: decode, validate, route, emit
//!
//! One [`EventPipeline`] owns one aggregation partition. Records are handled
//! strictly in arrival order:
//!
//! - bytes that are not JSON are logged and dropped
//! - documents that fail validation are forwarded unmodified to the
//!   dead-letter sink
//! - valid events update window and session state, then their snapshots are
//!   appended to the snapshot sink
//!
//! A sink error is retried per record under the pipeline's [`RetryPolicy`].
//! If it persists the error is returned and the snapshots the sink did not
//! accept are held back. State is not rolled back: feeding the same record
//! again delivers the held snapshots without applying the event twice, and
//! any other record or [`flush`](EventPipeline::flush) delivers them first.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::aggregation::{SessionOutcome, SnapshotRecord, WindowConfig};
use crate::error::{AggregatorError, Result};
use crate::event::{self, InvalidReason, Validation};
use crate::metrics::PipelineMetrics;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::router::{AggregationRouter, RouteOutcome};
use crate::sink::{DeadLetterSink, SnapshotSink};

/// What happened to one raw record
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// Applied to aggregation state
    Aggregated(RouteOutcome),
    /// Failed validation and was forwarded to the dead-letter sink
    DeadLettered(InvalidReason),
    /// Not decodable; dropped
    Undecodable,
}

/// An applied event whose snapshots were not all accepted by the sink
#[derive(Debug)]
struct PendingEmission {
    raw: Vec<u8>,
    outcome: RouteOutcome,
    emitted: usize,
}

/// Decode-validate-route loop for one partition
pub struct EventPipeline<S, D> {
    router: AggregationRouter,
    sink: S,
    dead_letter: D,
    retry: RetryExecutor,
    metrics: Arc<PipelineMetrics>,
    pending: Option<PendingEmission>,
}

impl<S, D> EventPipeline<S, D>
where
    S: SnapshotSink,
    D: DeadLetterSink,
{
    /// Create a pipeline with empty aggregation state
    pub fn new(config: WindowConfig, sink: S, dead_letter: D) -> Self {
        Self {
            router: AggregationRouter::new(config),
            sink,
            dead_letter,
            retry: RetryExecutor::new(RetryPolicy::default()),
            metrics: Arc::new(PipelineMetrics::new()),
            pending: None,
        }
    }

    /// Retry policy for sink and dead-letter writes
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = RetryExecutor::new(policy);
        self
    }

    /// Share counters with other pipelines
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Only reclaim windows on [`sweep`](Self::sweep)
    pub fn without_incremental_sweep(mut self) -> Self {
        self.router = self.router.without_incremental_sweep();
        self
    }

    /// Router and its aggregation state
    pub fn router(&self) -> &AggregationRouter {
        &self.router
    }

    /// Counters
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Snapshot sink
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Dead-letter sink
    pub fn dead_letter(&self) -> &D {
        &self.dead_letter
    }

    /// Snapshots held back by a failed emission
    pub fn pending_snapshots(&self) -> usize {
        self.pending
            .as_ref()
            .map_or(0, |pending| pending.outcome.records.len() - pending.emitted)
    }

    /// Handle one raw record
    pub async fn process(&mut self, raw: &[u8]) -> Result<RecordOutcome> {
        self.metrics.record_received();

        if let Some(delivered) = self.drain_pending().await? {
            if delivered.raw == raw {
                debug!("Redelivered record was already applied, emitted its held snapshots");
                return Ok(RecordOutcome::Aggregated(delivered.outcome));
            }
        }

        let document = match event::decode(raw) {
            Ok(document) => document,
            Err(e) => {
                error!("Dropping undecodable record ({} bytes): {}", raw.len(), e);
                self.metrics.record_undecodable();
                return Ok(RecordOutcome::Undecodable);
            }
        };

        debug!("Decoded record ({} bytes)", raw.len());

        let event = match event::validate(document) {
            Validation::Valid(event) => event,
            Validation::Invalid(reason) => {
                warn!("Invalid event, forwarding to dead letter: {}", reason);
                self.forward_dead_letter(raw, &reason).await?;
                self.metrics.record_dead_lettered();
                return Ok(RecordOutcome::DeadLettered(reason));
            }
        };

        let started = Instant::now();
        let outcome = self.router.route(&event);
        self.metrics.record_aggregated(started.elapsed());
        self.observe(&outcome);

        let emitted = self.emit_from(&outcome.records, 0).await;
        if let Err((emitted, e)) = emitted {
            self.pending = Some(PendingEmission {
                raw: raw.to_vec(),
                outcome,
                emitted,
            });
            return Err(e);
        }
        self.metrics.record_snapshots(outcome.records.len());

        Ok(RecordOutcome::Aggregated(outcome))
    }

    /// Evict windows expired as of the highest timestamp seen
    pub fn sweep(&mut self) -> usize {
        let evicted = self.router.sweep_to_stream_time();
        if evicted > 0 {
            debug!("Sweep evicted {} windows", evicted);
            self.metrics.record_evicted(evicted);
        }
        evicted
    }

    /// Deliver held snapshots, then flush both sinks
    pub async fn flush(&mut self) -> Result<()> {
        self.drain_pending().await?;
        self.sink.flush().await?;
        self.dead_letter.flush().await
    }

    /// Emit the snapshots held back by an earlier failure
    async fn drain_pending(&mut self) -> Result<Option<PendingEmission>> {
        let Some(mut pending) = self.pending.take() else {
            return Ok(None);
        };
        let result = self.emit_from(&pending.outcome.records, pending.emitted).await;
        if let Err((emitted, e)) = result {
            pending.emitted = emitted;
            self.pending = Some(pending);
            return Err(e);
        }
        self.metrics.record_snapshots(pending.outcome.records.len());
        Ok(Some(pending))
    }

    /// Emit `records[from..]` in order; on failure returns the index of the
    /// first record not accepted
    async fn emit_from(
        &self,
        records: &[SnapshotRecord],
        from: usize,
    ) -> std::result::Result<(), (usize, AggregatorError)> {
        for (index, record) in records.iter().enumerate().skip(from) {
            self.emit(record).await.map_err(|e| (index, e))?;
        }
        Ok(())
    }

    fn observe(&self, outcome: &RouteOutcome) {
        if outcome.increment.is_late() {
            self.metrics.record_late();
        }
        if outcome.evicted > 0 {
            self.metrics.record_evicted(outcome.evicted);
        }
        match outcome.session {
            SessionOutcome::Completed { .. } => self.metrics.record_session_completed(),
            SessionOutcome::Unmatched => self.metrics.record_unmatched_end(),
            SessionOutcome::ClockAnomaly { .. } => self.metrics.record_clock_anomaly(),
            SessionOutcome::Started { .. } | SessionOutcome::Ignored => {}
        }
    }

    async fn emit(&self, record: &SnapshotRecord) -> Result<()> {
        let sink = &self.sink;
        let result = self
            .retry
            .execute_with_predicate(move || sink.append(record), AggregatorError::is_retryable)
            .await
            .into_result();
        if result.is_err() {
            self.metrics.record_sink_failure();
        }
        result
    }

    async fn forward_dead_letter(&self, raw: &[u8], reason: &InvalidReason) -> Result<()> {
        let reason = reason.to_string();
        let dead_letter = &self.dead_letter;
        let reason_ref = reason.as_str();
        self.retry
            .execute_with_predicate(
                move || dead_letter.send(raw, reason_ref),
                AggregatorError::is_retryable,
            )
            .await
            .into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{SessionSnapshot, WindowSnapshot};
    use crate::sink::{MemoryDeadLetter, MemorySink};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    type TestPipeline = EventPipeline<Arc<MemorySink>, Arc<MemoryDeadLetter>>;

    fn pipeline() -> (TestPipeline, Arc<MemorySink>, Arc<MemoryDeadLetter>) {
        let sink = Arc::new(MemorySink::new());
        let dlq = Arc::new(MemoryDeadLetter::new());
        let pipeline = EventPipeline::new(
            WindowConfig::from_secs(60.0, 20.0, 40.0).unwrap(),
            sink.clone(),
            dlq.clone(),
        )
        .with_retry(RetryPolicy::fixed(2, Duration::from_millis(1)));
        (pipeline, sink, dlq)
    }

    #[tokio::test]
    async fn test_valid_event_is_aggregated() {
        let (mut pipeline, sink, dlq) = pipeline();
        let outcome = pipeline
            .process(br#"{"tenant_id":"t1","event_type":"click","timestamp":100}"#)
            .await
            .unwrap();

        assert!(matches!(outcome, RecordOutcome::Aggregated(_)));
        assert_eq!(
            sink.records(),
            vec![SnapshotRecord::Window(WindowSnapshot {
                tenant: "t1".to_string(),
                event_type: "click".to_string(),
                occurrences: 1,
                window_size: 60.0,
            })]
        );
        assert!(dlq.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_event_is_dead_lettered_raw() {
        let (mut pipeline, sink, dlq) = pipeline();
        let raw = br#"{"event_type":"click","timestamp":100}"#;
        let outcome = pipeline.process(raw).await.unwrap();

        assert_eq!(
            outcome,
            RecordOutcome::DeadLettered(InvalidReason::MissingField("tenant_id"))
        );
        assert_eq!(dlq.letters()[0].raw, raw.to_vec());
        assert!(sink.is_empty());
        assert_eq!(pipeline.router().engine().counter().key_count(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_record_is_dropped() {
        let (mut pipeline, sink, dlq) = pipeline();
        let outcome = pipeline.process(b"not json").await.unwrap();

        assert_eq!(outcome, RecordOutcome::Undecodable);
        assert!(sink.is_empty());
        assert!(dlq.is_empty());
        assert_eq!(pipeline.metrics().snapshot().records_undecodable, 1);
    }

    #[tokio::test]
    async fn test_session_pair_emits_session_snapshot() {
        let (mut pipeline, sink, _) = pipeline();
        pipeline
            .process(br#"{"tenant_id":"a","event_type":"session_start","timestamp":10,"payload":{"session_id":"s1"}}"#)
            .await
            .unwrap();
        pipeline
            .process(br#"{"tenant_id":"a","event_type":"session_end","timestamp":25,"payload":{"session_id":"s1"}}"#)
            .await
            .unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records[2],
            SnapshotRecord::Session(SessionSnapshot {
                tenant: "a".to_string(),
                total_duration: 15.0,
                count: 1,
            })
        );
        assert_eq!(pipeline.metrics().snapshot().sessions_completed, 1);
    }

    #[tokio::test]
    async fn test_transient_sink_failure_is_retried() {
        let (mut pipeline, sink, _) = pipeline();
        sink.fail_next(2);
        pipeline
            .process(br#"{"tenant_id":"t1","event_type":"click","timestamp":1}"#)
            .await
            .unwrap();
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_sink_failure_is_returned() {
        let (mut pipeline, sink, _) = pipeline();
        sink.fail_next(10);
        let result = pipeline
            .process(br#"{"tenant_id":"t1","event_type":"click","timestamp":1}"#)
            .await;

        assert!(matches!(result, Err(AggregatorError::Sink(_))));
        assert_eq!(pipeline.metrics().snapshot().sink_failures, 1);
        assert_eq!(pipeline.pending_snapshots(), 1);
        assert_eq!(
            pipeline
                .router()
                .engine()
                .counter()
                .current(&crate::aggregation::WindowKey::new("t1", "click"), 1.0),
            1
        );
    }

    #[tokio::test]
    async fn test_redelivered_record_is_not_applied_twice() {
        let (mut pipeline, sink, _) = pipeline();
        let raw = br#"{"tenant_id":"t1","event_type":"click","timestamp":100}"#;

        sink.fail_next(100);
        assert!(pipeline.process(raw).await.is_err());
        sink.fail_next(0);

        let outcome = pipeline.process(raw).await.unwrap();
        assert!(matches!(outcome, RecordOutcome::Aggregated(_)));
        assert_eq!(
            sink.records(),
            vec![SnapshotRecord::Window(WindowSnapshot {
                tenant: "t1".to_string(),
                event_type: "click".to_string(),
                occurrences: 1,
                window_size: 60.0,
            })]
        );
        assert_eq!(pipeline.pending_snapshots(), 0);
        assert_eq!(
            pipeline
                .router()
                .engine()
                .counter()
                .current(&crate::aggregation::WindowKey::new("t1", "click"), 100.0),
            1
        );
    }

    #[tokio::test]
    async fn test_held_snapshots_are_emitted_before_next_record() {
        let (mut pipeline, sink, _) = pipeline();
        sink.fail_next(100);
        assert!(pipeline
            .process(br#"{"tenant_id":"t1","event_type":"click","timestamp":100}"#)
            .await
            .is_err());
        sink.fail_next(0);

        pipeline
            .process(br#"{"tenant_id":"t1","event_type":"click","timestamp":101}"#)
            .await
            .unwrap();

        let occurrences: Vec<u64> = sink
            .records()
            .into_iter()
            .filter_map(|record| match record {
                SnapshotRecord::Window(w) => Some(w.occurrences),
                SnapshotRecord::Session(_) => None,
            })
            .collect();
        assert_eq!(occurrences, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_flush_delivers_held_snapshots() {
        let (mut pipeline, sink, _) = pipeline();
        sink.fail_next(100);
        assert!(pipeline
            .process(br#"{"tenant_id":"t1","event_type":"click","timestamp":100}"#)
            .await
            .is_err());
        sink.fail_next(0);

        pipeline.flush().await.unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(pipeline.pending_snapshots(), 0);
    }

    #[tokio::test]
    async fn test_sweep_reports_evictions() {
        let (pipeline, _, _) = pipeline();
        let mut pipeline = pipeline.without_incremental_sweep();
        pipeline
            .process(br#"{"tenant_id":"t1","event_type":"click","timestamp":100}"#)
            .await
            .unwrap();
        pipeline
            .process(br#"{"tenant_id":"t2","event_type":"click","timestamp":1000}"#)
            .await
            .unwrap();

        assert_eq!(pipeline.sweep(), 3);
        assert_eq!(pipeline.metrics().snapshot().windows_evicted, 3);
    }
}
