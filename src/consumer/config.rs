//! Consumer configuration structures

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::aggregation::config::seconds;

/// Redpanda/Kafka consumer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Kafka broker addresses (comma-separated)
    pub brokers: String,

    /// Consumer group ID
    pub group_id: String,

    /// Topics to consume from
    pub topics: Vec<String>,

    /// Session timeout in milliseconds
    pub session_timeout_ms: u32,

    /// Maximum poll interval in milliseconds
    pub max_poll_interval_ms: u32,

    /// Offset reset policy (earliest, latest, none)
    pub auto_offset_reset: String,

    /// Aggregation workers; each owns the tenants that hash to it
    pub num_workers: usize,

    /// Queue depth in front of each worker
    pub worker_queue_size: usize,

    /// Messages read but not yet processed before the assignment is paused
    pub max_inflight_messages: usize,
    /// Pause when inflight reaches this fraction of the maximum
    pub pause_threshold: f64,
    /// Resume when inflight drops to this fraction of the maximum
    pub resume_threshold: f64,

    /// How often processed offsets are committed
    #[serde(with = "seconds")]
    pub commit_interval: Duration,

    /// How often pipeline counters are logged
    #[serde(with = "seconds")]
    pub metrics_interval: Duration,

    /// How long shutdown waits for workers to drain
    #[serde(with = "seconds")]
    pub shutdown_timeout: Duration,

    /// Dead-letter topic for schema-invalid records
    pub dlq_topic: Option<String>,

    /// Delivery timeout for dead-letter writes
    #[serde(with = "seconds")]
    pub dlq_timeout: Duration,

    /// Additional Kafka properties
    pub kafka_properties: HashMap<String, String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            group_id: "tenant-aggregator".to_string(),
            topics: vec!["events".to_string()],
            session_timeout_ms: 30000,
            max_poll_interval_ms: 300000,
            auto_offset_reset: "earliest".to_string(),
            num_workers: num_cpus::get(),
            worker_queue_size: 256,
            max_inflight_messages: 1000,
            pause_threshold: 0.8,
            resume_threshold: 0.5,
            commit_interval: Duration::from_secs(5),
            metrics_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            dlq_topic: None,
            dlq_timeout: Duration::from_secs(30),
            kafka_properties: HashMap::new(),
        }
    }
}

/// Builder for ConsumerConfig
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    /// Create a new consumer config builder
    pub fn new() -> Self {
        Self {
            config: ConsumerConfig::default(),
        }
    }

    /// Set the broker addresses
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.config.brokers = brokers.into();
        self
    }

    /// Set the consumer group ID
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.config.group_id = group_id.into();
        self
    }

    /// Set the topics to consume
    pub fn topics(mut self, topics: Vec<String>) -> Self {
        self.config.topics = topics;
        self
    }

    /// Set the number of aggregation workers
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.config.num_workers = num_workers;
        self
    }

    /// Set the per-worker queue depth
    pub fn worker_queue_size(mut self, size: usize) -> Self {
        self.config.worker_queue_size = size;
        self
    }

    /// Set the maximum number of inflight messages
    pub fn max_inflight_messages(mut self, max: usize) -> Self {
        self.config.max_inflight_messages = max;
        self
    }

    /// Set the offset commit interval
    pub fn commit_interval(mut self, interval: Duration) -> Self {
        self.config.commit_interval = interval;
        self
    }

    /// Set the metrics reporting interval
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.config.metrics_interval = interval;
        self
    }

    /// Set the dead letter queue topic
    pub fn dlq_topic(mut self, topic: impl Into<String>) -> Self {
        self.config.dlq_topic = Some(topic.into());
        self
    }

    /// Add a custom Kafka property
    pub fn kafka_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.kafka_properties.insert(key.into(), value.into());
        self
    }

    /// Build the consumer configuration
    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}

impl Default for ConsumerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerConfig {
    /// Create a new consumer config builder
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.brokers.is_empty() {
            return Err("Brokers cannot be empty".to_string());
        }

        if self.group_id.is_empty() {
            return Err("Group ID cannot be empty".to_string());
        }

        if self.topics.is_empty() || self.topics.iter().any(|t| t.is_empty()) {
            return Err("Topics cannot be empty".to_string());
        }

        if self.num_workers == 0 {
            return Err("Number of workers must be greater than 0".to_string());
        }

        if self.worker_queue_size == 0 || self.max_inflight_messages == 0 {
            return Err("Queue sizes must be greater than 0".to_string());
        }

        if self.pause_threshold <= self.resume_threshold {
            return Err("Pause threshold must be greater than resume threshold".to_string());
        }

        if self.pause_threshold > 1.0 || self.resume_threshold < 0.0 {
            return Err("Thresholds must be between 0 and 1".to_string());
        }

        if self.commit_interval.is_zero() || self.metrics_interval.is_zero() {
            return Err("Intervals must be greater than 0".to_string());
        }

        if matches!(&self.dlq_topic, Some(topic) if topic.is_empty()) {
            return Err("DLQ topic cannot be empty when set".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ConsumerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ConsumerConfig::builder()
            .brokers("broker:9092")
            .group_id("agg")
            .topics(vec!["tenant-events".to_string()])
            .num_workers(4)
            .dlq_topic("tenant-events-dlq")
            .build();

        assert_eq!(config.num_workers, 4);
        assert_eq!(config.dlq_topic.as_deref(), Some("tenant-events-dlq"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_thresholds() {
        let config = ConsumerConfig {
            pause_threshold: 0.4,
            resume_threshold: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_durations_are_seconds() {
        let config: ConsumerConfig =
            serde_yaml::from_str("topics: [a, b]\ncommit_interval: 2.5\n").unwrap();
        assert_eq!(config.topics, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(config.commit_interval, Duration::from_millis(2500));
        assert_eq!(config.group_id, "tenant-aggregator");
    }
}
