//! Stateful aggregation over tenant-scoped event streams
//!
//! Raw records are decoded, validated and applied to two pieces of state:
//! hopping-window occurrence counts per (tenant, event type), and session
//! duration statistics per tenant. Every accepted event produces snapshot
//! records for a downstream sink; schema-invalid records are forwarded
//! unchanged to a dead-letter sink.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tenant_aggregator::sink::{MemoryDeadLetter, MemorySink};
//! use tenant_aggregator::{EventPipeline, RecordOutcome, WindowConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = WindowConfig::from_secs(60.0, 20.0, 40.0)?;
//! let sink = Arc::new(MemorySink::new());
//! let mut pipeline = EventPipeline::new(config, sink.clone(), Arc::new(MemoryDeadLetter::new()));
//!
//! let outcome = pipeline
//!     .process(br#"{"tenant_id":"acme","event_type":"click","timestamp":100}"#)
//!     .await?;
//! assert!(matches!(outcome, RecordOutcome::Aggregated(_)));
//! tracing::info!("Snapshots: {:?}", sink.records());
//! # Ok(())
//! # }
//! ```
//!
//! # Redpanda Integration
//!
//! With the `kafka` feature, [`consumer::AggregatorConsumer`] reads from
//! Redpanda/Kafka, fans records out to per-worker pipelines by tenant hash and
//! commits offsets only after processing.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_inception)]

pub use aggregation::{
    AggregationEngine, SessionSnapshot, SessionStats, SessionTracker, SnapshotRecord,
    WindowConfig, WindowKey, WindowSnapshot, WindowedCounter,
};
pub use config::{AggregatorConfig, SinkConfig};
pub use error::{AggregatorError, Result};
pub use event::{Event, InvalidReason, Validation};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use pipeline::{EventPipeline, RecordOutcome};
pub use retry::{RetryExecutor, RetryPolicy};
pub use router::{AggregationRouter, RouteOutcome};

/// Hopping windows and session statistics
pub mod aggregation;

/// Service configuration
pub mod config;

/// Error types
pub mod error;

/// Event model and validation
pub mod event;

/// Pipeline counters
pub mod metrics;

/// Decode-validate-route loop
pub mod pipeline;

/// Retry policy for sink writes
pub mod retry;

/// Event routing and worker partitioning
pub mod router;

/// Snapshot and dead-letter sinks
pub mod sink;

/// Consumer implementation for Redpanda/Kafka
#[cfg(feature = "kafka")]
pub mod consumer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the tracing subscriber with default settings
///
/// JSON output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
