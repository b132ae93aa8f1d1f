//! Error types for the aggregation engine and its adapters
use thiserror::Error;

/// Main error type for aggregation operations
#[derive(Error, Debug)]
pub enum AggregatorError {
    /// Configuration is invalid or incomplete
    #[error("Configuration error: {0}")]
    Config(String),

    /// Raw bytes could not be decoded into a document
    #[error("Decode error: {0}")]
    Decode(String),

    /// Snapshot sink rejected a record
    #[error("Sink error: {0}")]
    Sink(String),

    /// Dead-letter sink rejected a record
    #[error("Dead-letter error: {0}")]
    DeadLetter(String),

    /// Internal channel was closed
    #[error("Channel error: {0}")]
    Channel(String),

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML config parsing failed
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Arrow batch construction failed
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet write failed
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
}

impl AggregatorError {
    /// Whether retrying the failed operation could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AggregatorError::Sink(_) | AggregatorError::DeadLetter(_) | AggregatorError::Io(_)
        )
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for AggregatorError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        AggregatorError::Channel(format!("Failed to send: {}", err))
    }
}

/// Result type alias for aggregation operations
pub type Result<T> = std::result::Result<T, AggregatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(AggregatorError::Sink("disk full".into()).is_retryable());
        assert!(AggregatorError::DeadLetter("broker down".into()).is_retryable());
        assert!(!AggregatorError::Config("bad step".into()).is_retryable());
        assert!(!AggregatorError::Decode("bad json".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = AggregatorError::Config("step must divide size".to_string());
        assert_eq!(err.to_string(), "Configuration error: step must divide size");
    }
}
