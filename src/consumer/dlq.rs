//! Dead letter topic producer for schema-invalid records

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tracing::{debug, error, info};

use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::error::{AggregatorError, Result};
use crate::sink::DeadLetterSink;

/// Header carrying the validation failure
pub const REASON_HEADER: &str = "dlq.error.message";
/// Header carrying the dead-letter time, RFC 3339
pub const TIMESTAMP_HEADER: &str = "dlq.timestamp";

/// Forwards raw records to a dead letter topic
///
/// The payload is the original record, byte for byte. The failure reason
/// travels in headers only.
#[derive(Clone)]
pub struct DlqProducer {
    producer: Arc<FutureProducer>,
    topic: String,
    timeout: Duration,
}

impl DlqProducer {
    /// Wrap an existing producer
    pub fn new(producer: FutureProducer, topic: impl Into<String>) -> Self {
        Self {
            producer: Arc::new(producer),
            topic: topic.into(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Create a producer against `brokers`
    pub fn connect(brokers: &str, topic: impl Into<String>) -> ConsumerResult<Self> {
        let topic = topic.into();
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| ConsumerError::Connection(format!("Failed to create DLQ producer: {}", e)))?;
        info!("Created DLQ producer for topic: {}", topic);
        Ok(Self::new(producer, topic))
    }

    /// Set the send timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Target topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn headers(reason: &str) -> OwnedHeaders {
        let timestamp = Utc::now().to_rfc3339();
        OwnedHeaders::new()
            .insert(Header {
                key: REASON_HEADER,
                value: Some(reason.as_bytes()),
            })
            .insert(Header {
                key: TIMESTAMP_HEADER,
                value: Some(timestamp.as_bytes()),
            })
    }
}

#[async_trait]
impl DeadLetterSink for DlqProducer {
    async fn send(&self, raw: &[u8], reason: &str) -> Result<()> {
        let record: FutureRecord<'_, (), [u8]> = FutureRecord::to(&self.topic)
            .payload(raw)
            .headers(Self::headers(reason));

        match self.producer.send(record, self.timeout).await {
            Ok((partition, offset)) => {
                debug!(
                    "Record sent to DLQ topic: {}, partition: {}, offset: {}",
                    self.topic, partition, offset
                );
                Ok(())
            }
            Err((e, _)) => {
                error!("Failed to send record to DLQ: {}", e);
                Err(AggregatorError::DeadLetter(format!("DLQ send failed: {}", e)))
            }
        }
    }
}
