//! Retry policy for sink writes

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::aggregation::config::seconds;

/// Upper bound on configured retries
const MAX_RETRY_ATTEMPTS: u32 = 100;
/// Upper bound on any single backoff, in seconds
const MAX_BACKOFF_SECONDS: f64 = 300.0;
/// Upper bound on the backoff multiplier
const MAX_MULTIPLIER: f64 = 10.0;

fn bounded_retries<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = u32::deserialize(deserializer)?;
    if value > MAX_RETRY_ATTEMPTS {
        return Err(serde::de::Error::custom(format!(
            "max_retries {} exceeds maximum allowed value {}",
            value, MAX_RETRY_ATTEMPTS
        )));
    }
    Ok(value)
}

fn bounded_backoff<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let duration = seconds::deserialize(deserializer)?;
    if duration.as_secs_f64() > MAX_BACKOFF_SECONDS {
        return Err(serde::de::Error::custom(format!(
            "backoff {:?} exceeds maximum allowed {} seconds",
            duration, MAX_BACKOFF_SECONDS
        )));
    }
    Ok(duration)
}

fn bounded_multiplier<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || !(1.0..=MAX_MULTIPLIER).contains(&value) {
        return Err(serde::de::Error::custom(format!(
            "backoff_multiplier {} must be between 1.0 and {}",
            value, MAX_MULTIPLIER
        )));
    }
    Ok(value)
}

fn bounded_jitter<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(serde::de::Error::custom(format!(
            "jitter_factor {} must be between 0.0 and 1.0",
            value
        )));
    }
    Ok(value)
}

/// Backoff schedule for retrying a failed write
///
/// Durations are written as seconds, e.g. `initial_backoff: 0.1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    #[serde(deserialize_with = "bounded_retries")]
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(
        serialize_with = "seconds::serialize",
        deserialize_with = "bounded_backoff"
    )]
    pub initial_backoff: Duration,
    /// Cap on any single delay
    #[serde(
        serialize_with = "seconds::serialize",
        deserialize_with = "bounded_backoff"
    )]
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays
    #[serde(deserialize_with = "bounded_multiplier")]
    pub backoff_multiplier: f64,
    /// Random extra delay, as a fraction of the computed delay
    #[serde(deserialize_with = "bounded_jitter")]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Constant delay between attempts
    pub fn fixed(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff: backoff,
            max_backoff: backoff,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Delay before retry number `attempt` (1-based); zero for attempt 0
    pub fn next_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let base = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_backoff.as_secs_f64());
        let jitter = capped * self.jitter_factor * rand::random::<f64>();

        Duration::from_secs_f64(capped + jitter)
    }

    /// Whether another attempt is allowed after `attempt` retries
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_backoff > self.max_backoff {
            return Err("initial_backoff must not exceed max_backoff".to_string());
        }
        Ok(())
    }
}

/// Result of a retried operation
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// Succeeded after `attempts` retries
    Success {
        /// Operation output
        value: T,
        /// Retries used
        attempts: u32,
    },
    /// Gave up after `attempts` retries
    Failed {
        /// Last error seen
        error: E,
        /// Retries used
        attempts: u32,
    },
}

impl<T, E> RetryResult<T, E> {
    /// Number of retries used
    pub fn attempts(&self) -> u32 {
        match self {
            RetryResult::Success { attempts, .. } | RetryResult::Failed { attempts, .. } => {
                *attempts
            }
        }
    }

    /// Collapse into a plain `Result`
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryResult::Success { value, .. } => Ok(value),
            RetryResult::Failed { error, .. } => Err(error),
        }
    }
}

/// Runs an async operation under a [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Active policy
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retry every failure until the policy is exhausted
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.execute_with_predicate(operation, |_| true).await
    }

    /// Retry only failures accepted by `should_retry`
    pub async fn execute_with_predicate<F, Fut, P, T, E>(
        &self,
        mut operation: F,
        mut should_retry: P,
    ) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("Operation succeeded after {} retries", attempt);
                    }
                    return RetryResult::Success {
                        value,
                        attempts: attempt,
                    };
                }
                Err(error) => {
                    if !self.policy.should_retry(attempt) || !should_retry(&error) {
                        warn!("Operation failed after {} attempts: {}", attempt + 1, error);
                        return RetryResult::Failed {
                            error,
                            attempts: attempt,
                        };
                    }

                    attempt += 1;
                    let backoff = self.policy.next_backoff(attempt);
                    warn!(
                        "Operation failed (attempt {}), retrying in {:?}: {}",
                        attempt, backoff, error
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}
