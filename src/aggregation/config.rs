use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AggregatorError, Result};

/// Configuration for a hopping window table
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Duration of each window
    #[serde(with = "seconds")]
    pub size: Duration,
    /// Distance between consecutive window starts
    #[serde(with = "seconds")]
    pub step: Duration,
    /// Grace period after a window ends before it may be evicted
    #[serde(with = "seconds")]
    pub expiry: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size: Duration::from_secs(60),
            step: Duration::from_secs(10),
            expiry: Duration::from_secs(60),
        }
    }
}

impl WindowConfig {
    /// Create a validated window configuration
    pub fn new(size: Duration, step: Duration, expiry: Duration) -> Result<Self> {
        let config = Self { size, step, expiry };
        config.validate()?;
        Ok(config)
    }

    /// Create a validated configuration from second values
    pub fn from_secs(size: f64, step: f64, expiry: f64) -> Result<Self> {
        let to_duration = |name: &str, value: f64| {
            Duration::try_from_secs_f64(value).map_err(|e| {
                AggregatorError::Config(format!("{} must be a non-negative number of seconds: {}", name, e))
            })
        };
        Self::new(
            to_duration("window size", size)?,
            to_duration("window step", step)?,
            to_duration("window expiry", expiry)?,
        )
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.size.is_zero() {
            return Err(AggregatorError::Config("Window size must be greater than 0".to_string()));
        }
        if self.step.is_zero() {
            return Err(AggregatorError::Config("Window step must be greater than 0".to_string()));
        }
        if self.step > self.size {
            return Err(AggregatorError::Config(format!(
                "Window step {:?} cannot exceed window size {:?}",
                self.step, self.size
            )));
        }
        if self.size.as_nanos() % self.step.as_nanos() != 0 {
            return Err(AggregatorError::Config(format!(
                "Window step {:?} must evenly divide window size {:?}",
                self.step, self.size
            )));
        }
        Ok(())
    }

    /// Number of windows simultaneously covering any instant
    pub fn windows_per_instant(&self) -> u64 {
        (self.size.as_nanos() / self.step.as_nanos()) as u64
    }

    /// Window size in seconds
    pub fn size_secs(&self) -> f64 {
        self.size.as_secs_f64()
    }

    /// Window step in seconds
    pub fn step_secs(&self) -> f64 {
        self.step.as_secs_f64()
    }

    /// Expiry grace period in seconds
    pub fn expiry_secs(&self) -> f64 {
        self.expiry.as_secs_f64()
    }
}

/// (De)serialize a `Duration` as floating point seconds
pub(crate) mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(value).map_err(|e| {
            serde::de::Error::custom(format!("invalid duration {} seconds: {}", value, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = WindowConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.windows_per_instant(), 6);
    }

    #[test]
    fn test_step_must_divide_size() {
        assert!(WindowConfig::from_secs(60.0, 20.0, 40.0).is_ok());
        assert!(WindowConfig::from_secs(60.0, 25.0, 40.0).is_err());
        assert!(WindowConfig::from_secs(60.0, 0.0, 40.0).is_err());
        assert!(WindowConfig::from_secs(0.0, 10.0, 40.0).is_err());
        assert!(WindowConfig::from_secs(10.0, 20.0, 40.0).is_err());
        assert!(WindowConfig::from_secs(60.0, -1.0, 40.0).is_err());
    }

    #[test]
    fn test_fractional_step() {
        let config = WindowConfig::from_secs(1.0, 0.25, 0.0).unwrap();
        assert_eq!(config.windows_per_instant(), 4);
    }

    #[test]
    fn test_yaml_seconds() {
        let config: WindowConfig = serde_yaml::from_str("size: 60\nstep: 20\nexpiry: 40.5\n").unwrap();
        assert_eq!(config.size, Duration::from_secs(60));
        assert_eq!(config.step, Duration::from_secs(20));
        assert_eq!(config.expiry, Duration::from_millis(40_500));
    }
}
