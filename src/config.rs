//! Service configuration
//!
//! Configuration is read from YAML and then overridden from the environment.
//! Durations are given in seconds.
//!
//! ```yaml
//! window:
//!   size: 60
//!   step: 10
//!   expiry: 60
//! sweep_interval: 5
//! sink:
//!   output_dir: /var/lib/aggregator
//!   batch_size: 1000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::aggregation::config::seconds;
use crate::aggregation::WindowConfig;
use crate::error::{AggregatorError, Result};
use crate::retry::RetryPolicy;

#[cfg(feature = "kafka")]
use crate::consumer::ConsumerConfig;

/// Snapshot and dead-letter output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Directory for Parquet snapshot parts; JSON lines on stdout when unset
    pub output_dir: Option<PathBuf>,
    /// Rows buffered per table before a part file is written
    pub batch_size: usize,
    /// Capacity of the queue in front of the snapshot writer
    pub channel_capacity: usize,
    /// Longest time a buffered record waits for a flush
    #[serde(with = "seconds")]
    pub flush_interval: Duration,
    /// File receiving schema-invalid records when no dead-letter topic is used
    pub dead_letter_path: Option<PathBuf>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            batch_size: 1000,
            channel_capacity: 1024,
            flush_interval: Duration::from_secs(5),
            dead_letter_path: None,
        }
    }
}

/// Top-level aggregator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Hopping window geometry
    pub window: WindowConfig,
    /// How often expired windows are swept
    #[serde(with = "seconds")]
    pub sweep_interval: Duration,
    /// How often pipeline counters are logged by the CLI
    #[serde(with = "seconds")]
    pub stats_interval: Duration,
    /// Output settings
    pub sink: SinkConfig,
    /// Retry policy for snapshot and dead-letter writes
    pub retry: RetryPolicy,
    /// Kafka consumer settings
    #[cfg(feature = "kafka")]
    pub kafka: ConsumerConfig,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            sweep_interval: Duration::from_secs(5),
            stats_interval: Duration::from_secs(60),
            sink: SinkConfig::default(),
            retry: RetryPolicy::default(),
            #[cfg(feature = "kafka")]
            kafka: ConsumerConfig::default(),
        }
    }
}

impl AggregatorConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AggregatorError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        debug!("Loaded configuration from {}", path.display());
        Self::from_yaml_str(&contents)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, keyed by environment variable name
    ///
    /// Recognized variables: `AGGREGATOR_WINDOW_SIZE`, `AGGREGATOR_WINDOW_STEP`,
    /// `AGGREGATOR_WINDOW_EXPIRY`, `AGGREGATOR_SWEEP_INTERVAL` (seconds),
    /// `AGGREGATOR_OUTPUT_DIR`, `AGGREGATOR_DEAD_LETTER_PATH`,
    /// `AGGREGATOR_BATCH_SIZE` and, with the `kafka` feature, `KAFKA_BROKERS`,
    /// `KAFKA_TOPICS` (comma-separated), `KAFKA_GROUP_ID`, `KAFKA_DLQ_TOPIC`,
    /// `KAFKA_WORKERS`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("AGGREGATOR_WINDOW_SIZE") {
            self.window.size = parse_seconds("AGGREGATOR_WINDOW_SIZE", &value)?;
        }
        if let Some(value) = lookup("AGGREGATOR_WINDOW_STEP") {
            self.window.step = parse_seconds("AGGREGATOR_WINDOW_STEP", &value)?;
        }
        if let Some(value) = lookup("AGGREGATOR_WINDOW_EXPIRY") {
            self.window.expiry = parse_seconds("AGGREGATOR_WINDOW_EXPIRY", &value)?;
        }
        if let Some(value) = lookup("AGGREGATOR_SWEEP_INTERVAL") {
            self.sweep_interval = parse_seconds("AGGREGATOR_SWEEP_INTERVAL", &value)?;
        }
        if let Some(value) = lookup("AGGREGATOR_OUTPUT_DIR") {
            self.sink.output_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("AGGREGATOR_DEAD_LETTER_PATH") {
            self.sink.dead_letter_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("AGGREGATOR_BATCH_SIZE") {
            self.sink.batch_size = parse_value("AGGREGATOR_BATCH_SIZE", &value)?;
        }

        #[cfg(feature = "kafka")]
        {
            if let Some(brokers) = lookup("KAFKA_BROKERS") {
                self.kafka.brokers = brokers;
            }
            if let Some(topics) = lookup("KAFKA_TOPICS") {
                self.kafka.topics = topics
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            if let Some(group_id) = lookup("KAFKA_GROUP_ID") {
                self.kafka.group_id = group_id;
            }
            if let Some(topic) = lookup("KAFKA_DLQ_TOPIC") {
                self.kafka.dlq_topic = Some(topic).filter(|t| !t.is_empty());
            }
            if let Some(value) = lookup("KAFKA_WORKERS") {
                self.kafka.num_workers = parse_value("KAFKA_WORKERS", &value)?;
            }
        }

        Ok(())
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.window.validate()?;
        if self.sweep_interval.is_zero() {
            return Err(AggregatorError::Config("sweep_interval must be greater than 0".to_string()));
        }
        if self.stats_interval.is_zero() {
            return Err(AggregatorError::Config("stats_interval must be greater than 0".to_string()));
        }
        if self.sink.batch_size == 0 {
            return Err(AggregatorError::Config("sink.batch_size must be greater than 0".to_string()));
        }
        if self.sink.channel_capacity == 0 {
            return Err(AggregatorError::Config(
                "sink.channel_capacity must be greater than 0".to_string(),
            ));
        }
        if self.sink.flush_interval.is_zero() {
            return Err(AggregatorError::Config(
                "sink.flush_interval must be greater than 0".to_string(),
            ));
        }
        self.retry.validate().map_err(AggregatorError::Config)?;

        #[cfg(feature = "kafka")]
        self.kafka.validate().map_err(AggregatorError::Config)?;

        Ok(())
    }
}

fn parse_seconds(name: &str, value: &str) -> Result<Duration> {
    let secs: f64 = parse_value(name, value)?;
    Duration::try_from_secs_f64(secs)
        .map_err(|e| AggregatorError::Config(format!("{} is not a valid duration: {}", name, e)))
}

fn parse_value<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| AggregatorError::Config(format!("Invalid {} '{}': {}", name, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AggregatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.sink.batch_size, 1000);
        assert!(config.sink.output_dir.is_none());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = AggregatorConfig::from_yaml_str(
            "window:\n  size: 60\n  step: 20\n  expiry: 40\nsink:\n  output_dir: /tmp/out\n",
        )
        .unwrap();

        assert_eq!(config.window, WindowConfig::from_secs(60.0, 20.0, 40.0).unwrap());
        assert_eq!(config.sink.output_dir, Some(PathBuf::from("/tmp/out")));
        assert_eq!(config.sink.batch_size, 1000);
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_invalid_window_is_rejected() {
        let config =
            AggregatorConfig::from_yaml_str("window:\n  size: 60\n  step: 25\n  expiry: 0\n")
                .unwrap();
        assert!(matches!(config.validate(), Err(AggregatorError::Config(_))));
    }

    #[test]
    fn test_malformed_yaml_is_an_error() {
        assert!(matches!(
            AggregatorConfig::from_yaml_str("window: [1, 2"),
            Err(AggregatorError::Yaml(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AggregatorConfig::default();
        config
            .apply_overrides(env(&[
                ("AGGREGATOR_WINDOW_SIZE", "30"),
                ("AGGREGATOR_WINDOW_STEP", "7.5"),
                ("AGGREGATOR_SWEEP_INTERVAL", "0.5"),
                ("AGGREGATOR_BATCH_SIZE", " 50 "),
                ("AGGREGATOR_DEAD_LETTER_PATH", "/tmp/dlq.jsonl"),
            ]))
            .unwrap();

        assert_eq!(config.window.size, Duration::from_secs(30));
        assert_eq!(config.window.step, Duration::from_millis(7_500));
        assert_eq!(config.sweep_interval, Duration::from_millis(500));
        assert_eq!(config.sink.batch_size, 50);
        assert_eq!(config.sink.dead_letter_path, Some(PathBuf::from("/tmp/dlq.jsonl")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_env_values() {
        let mut config = AggregatorConfig::default();
        assert!(config
            .apply_overrides(env(&[("AGGREGATOR_BATCH_SIZE", "lots")]))
            .is_err());
        assert!(config
            .apply_overrides(env(&[("AGGREGATOR_WINDOW_SIZE", "-5")]))
            .is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aggregator.yaml");
        let config = AggregatorConfig::default();
        std::fs::write(&path, serde_yaml::to_string(&config).unwrap()).unwrap();

        assert_eq!(AggregatorConfig::from_file(&path).unwrap(), config);
        assert!(AggregatorConfig::from_file(dir.path().join("missing.yaml")).is_err());
    }

    #[cfg(feature = "kafka")]
    #[test]
    fn test_kafka_env_overrides() {
        let mut config = AggregatorConfig::default();
        config
            .apply_overrides(env(&[
                ("KAFKA_BROKERS", "redpanda:9092"),
                ("KAFKA_TOPICS", "events, clicks,"),
                ("KAFKA_DLQ_TOPIC", "events-dlq"),
                ("KAFKA_WORKERS", "3"),
            ]))
            .unwrap();

        assert_eq!(config.kafka.brokers, "redpanda:9092");
        assert_eq!(config.kafka.topics, vec!["events".to_string(), "clicks".to_string()]);
        assert_eq!(config.kafka.dlq_topic.as_deref(), Some("events-dlq"));
        assert_eq!(config.kafka.num_workers, 3);
    }
}
