//! Redpanda/Kafka consumer for the aggregation pipeline
//!
//! Messages are fanned out to a fixed set of aggregation workers by tenant
//! hash. The consumer provides:
//! - Manual offset management (only fully processed prefixes are committed)
//! - Dead letter topic forwarding for schema-invalid records
//! - Pause/resume backpressure
//! - Graceful shutdown
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tenant_aggregator::consumer::{AggregatorConsumer, ConsumerConfig};
//! use tenant_aggregator::sink::{MemoryDeadLetter, MemorySink};
//! use tenant_aggregator::{EventPipeline, WindowConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ConsumerConfig::builder()
//!     .brokers("localhost:9092".to_string())
//!     .topics(vec!["events".to_string()])
//!     .build();
//!
//! let sink = Arc::new(MemorySink::new());
//! let dead_letter = Arc::new(MemoryDeadLetter::new());
//! let consumer = AggregatorConsumer::new(config, Duration::from_secs(5), |_| {
//!     EventPipeline::new(WindowConfig::default(), sink.clone(), dead_letter.clone())
//! })?;
//! consumer.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod backpressure;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod error;
pub mod offset_manager;
pub mod shutdown;

pub use backpressure::BackpressureController;
pub use config::{ConsumerConfig, ConsumerConfigBuilder};
pub use consumer::AggregatorConsumer;
pub use dlq::DlqProducer;
pub use error::{ConsumerError, ConsumerResult, ErrorSeverity};
pub use offset_manager::OffsetManager;
pub use shutdown::{ShutdownCoordinator, ShutdownState};
