//! Routing of validated events into the aggregation engine
//!
//! [`AggregationRouter::route`] applies an event to the window table and the
//! session tracker and returns the snapshot records it produced. Emission to a
//! sink is a separate step so that a failing sink can be retried without
//! applying the event twice.

use std::borrow::Cow;
use std::hash::Hasher;

use serde::Deserialize;
use siphasher::sip::SipHasher13;
use tracing::debug;

use crate::aggregation::{
    AggregationEngine, IncrementOutcome, SessionOutcome, SessionSnapshot, SnapshotRecord,
    WindowConfig, WindowKey, WindowSnapshot,
};
use crate::error::Result;
use crate::event::Event;
use crate::sink::SnapshotSink;

/// Everything one event changed
#[derive(Debug, Clone, PartialEq)]
pub struct RouteOutcome {
    /// Records to emit, window snapshot first
    pub records: Vec<SnapshotRecord>,
    /// Window table update
    pub increment: IncrementOutcome,
    /// Session tracker update
    pub session: SessionOutcome,
    /// Windows evicted from the event's key after the update
    pub evicted: usize,
}

/// Drives the window table and session tracker for one key partition
#[derive(Debug)]
pub struct AggregationRouter {
    engine: AggregationEngine,
    sweep_on_increment: bool,
}

impl AggregationRouter {
    /// Create a router over a fresh engine
    pub fn new(config: WindowConfig) -> Self {
        Self {
            engine: AggregationEngine::new(config),
            sweep_on_increment: true,
        }
    }

    /// Disable the per-key sweep after each increment
    ///
    /// Expired windows are then only reclaimed by [`sweep`](Self::sweep).
    pub fn without_incremental_sweep(mut self) -> Self {
        self.sweep_on_increment = false;
        self
    }

    /// Aggregation state
    pub fn engine(&self) -> &AggregationEngine {
        &self.engine
    }

    /// Apply a validated event and build the resulting snapshots
    pub fn route(&mut self, event: &Event) -> RouteOutcome {
        let key = WindowKey::from(event);
        let counter = self.engine.counter_mut();

        let increment = counter.increment(&key, event.timestamp);
        let occurrences = counter.current(&key, event.timestamp);
        let window_size = counter.config().size_secs();
        let evicted = if self.sweep_on_increment {
            counter.sweep_key(&key)
        } else {
            0
        };

        let mut records = Vec::with_capacity(2);
        records.push(SnapshotRecord::Window(WindowSnapshot {
            tenant: key.tenant_id,
            event_type: key.event_type,
            occurrences,
            window_size,
        }));

        let session = self.engine.sessions_mut().on_event(event);
        if let SessionOutcome::Completed { stats, .. } = &session {
            records.push(SnapshotRecord::Session(SessionSnapshot {
                tenant: event.tenant_id.clone(),
                total_duration: stats.total_duration,
                count: stats.count,
            }));
        }

        debug!(
            tenant = %event.tenant_id,
            event_type = %event.event_type,
            ts = event.timestamp,
            occurrences,
            records = records.len(),
            "Routed event"
        );

        RouteOutcome {
            records,
            increment,
            session,
            evicted,
        }
    }

    /// Route an event and append its snapshots to `sink`
    ///
    /// State is updated before emission; a sink error is returned as is and the
    /// caller decides whether to retry [`emit`] or fail.
    pub async fn process<S>(&mut self, event: &Event, sink: &S) -> Result<RouteOutcome>
    where
        S: SnapshotSink + ?Sized,
    {
        let outcome = self.route(event);
        emit(sink, &outcome.records).await?;
        Ok(outcome)
    }

    /// Evict windows expired as of `now`
    pub fn sweep(&mut self, now: f64) -> usize {
        self.engine.counter_mut().sweep(now)
    }

    /// Evict windows expired as of the highest timestamp seen
    pub fn sweep_to_stream_time(&mut self) -> usize {
        self.engine.sweep_to_stream_time()
    }
}

/// Append records to a sink in order
pub async fn emit<S>(sink: &S, records: &[SnapshotRecord]) -> Result<()>
where
    S: SnapshotSink + ?Sized,
{
    for record in records {
        sink.append(record).await?;
    }
    Ok(())
}

#[derive(Deserialize)]
struct TenantProbe<'a> {
    #[serde(borrow)]
    tenant_id: Option<Cow<'a, str>>,
}

/// Worker index owning a tenant
///
/// Uses SipHash-1-3 with fixed keys so the assignment is stable across runs.
pub fn partition_for_tenant(tenant_id: &str, workers: usize) -> usize {
    if workers <= 1 {
        return 0;
    }
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write(tenant_id.as_bytes());
    (hasher.finish() % workers as u64) as usize
}

/// Worker index for a raw record
///
/// Only `tenant_id` is read. Records without a readable tenant cannot touch
/// aggregation state and go to worker 0.
pub fn partition_for(raw: &[u8], workers: usize) -> usize {
    match serde_json::from_slice::<TenantProbe<'_>>(raw) {
        Ok(TenantProbe {
            tenant_id: Some(tenant),
        }) => partition_for_tenant(&tenant, workers),
        _ => 0,
    }
}
