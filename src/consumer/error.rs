//! Consumer error types

use thiserror::Error;

use crate::error::AggregatorError;

/// Result type for consumer operations
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Consumer error types
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Kafka client errors
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Aggregation pipeline errors
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] AggregatorError),

    /// Offset management errors
    #[error("Offset error: {0}")]
    Offset(String),

    /// Channel errors
    #[error("Channel error: {0}")]
    Channel(String),

    /// Shutdown errors
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

impl ConsumerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            ConsumerError::Kafka(e) => {
                !matches!(e, rdkafka::error::KafkaError::MessageConsumption(_))
            }
            ConsumerError::Connection(_) => true,
            ConsumerError::Pipeline(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Get error severity
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ConsumerError::Config(_) => ErrorSeverity::Fatal,
            ConsumerError::Pipeline(AggregatorError::Sink(_)) => ErrorSeverity::Fatal,
            ConsumerError::Offset(_) => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Warnings that don't stop processing
    Warning,
    /// Errors that may be retried
    Error,
    /// Fatal errors that stop the consumer
    Fatal,
}

/// Convert from channel send errors
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ConsumerError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ConsumerError::Channel(format!("Failed to send: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_failure_is_fatal() {
        let err = ConsumerError::from(AggregatorError::Sink("disk full".to_string()));
        assert_eq!(err.severity(), ErrorSeverity::Fatal);
        assert!(err.is_retryable());
        assert!(!ConsumerError::Config("x".to_string()).is_retryable());
    }

    #[test]
    fn test_commit_failure_is_a_warning() {
        let err = ConsumerError::Offset("Commit failed: broker unavailable".to_string());
        assert_eq!(err.severity(), ErrorSeverity::Warning);
        let err = ConsumerError::from(AggregatorError::DeadLetter("timeout".to_string()));
        assert_eq!(err.severity(), ErrorSeverity::Error);
    }
}
