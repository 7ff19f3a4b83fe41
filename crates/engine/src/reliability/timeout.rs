//! Execution and dispatch timeouts
//!
//! Two ceilings are enforced: a hard limit on how long one execution may run
//! from its first step, and a per-dispatch limit on a single action call.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::serde_util::duration_millis;

/// Timeout violations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TimeoutError {
    /// Execution ran past its maximum duration
    #[error("execution exceeded its maximum duration (ran for {elapsed:?}, limit {limit:?})")]
    Execution { elapsed: Duration, limit: Duration },

    /// A single action dispatch did not return in time
    #[error("action dispatch timed out after {limit:?}")]
    Dispatch { limit: Duration },
}

/// Timeout configuration for executions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Maximum time from the first step to a terminal state
    #[serde(with = "duration_millis")]
    pub max_execution_duration: Duration,

    /// Maximum time a single dispatcher call may take
    #[serde(with = "duration_millis")]
    pub dispatch_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            max_execution_duration: Duration::from_secs(30 * 24 * 3600), // 30 days
            dispatch_timeout: Duration::from_secs(30),
        }
    }
}

impl TimeoutConfig {
    /// Create a new timeout configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum execution duration
    pub fn with_max_execution_duration(mut self, limit: Duration) -> Self {
        self.max_execution_duration = limit;
        self
    }

    /// Set the per-dispatch timeout
    pub fn with_dispatch_timeout(mut self, limit: Duration) -> Self {
        self.dispatch_timeout = limit;
        self
    }

    /// Check if an execution started at `started_at` has run past its ceiling
    pub fn check_execution(
        &self,
        started_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<TimeoutError> {
        let started = started_at?;

        let elapsed = now
            .signed_duration_since(started)
            .to_std()
            .unwrap_or(Duration::ZERO);

        if elapsed > self.max_execution_duration {
            Some(TimeoutError::Execution {
                elapsed,
                limit: self.max_execution_duration,
            })
        } else {
            None
        }
    }

    /// Run a dispatch future under the per-dispatch timeout
    pub async fn run_dispatch<F, T>(&self, fut: F) -> Result<T, TimeoutError>
    where
        F: Future<Output = T>,
    {
        tokio::time::timeout(self.dispatch_timeout, fut)
            .await
            .map_err(|_| TimeoutError::Dispatch {
                limit: self.dispatch_timeout,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_started_never_times_out() {
        let config = TimeoutConfig::new();
        assert!(config.check_execution(None, Utc::now()).is_none());
    }

    #[test]
    fn test_execution_within_limit() {
        let config = TimeoutConfig::new().with_max_execution_duration(Duration::from_secs(60));
        let now = Utc::now();
        let started = now - chrono::Duration::seconds(30);

        assert!(config.check_execution(Some(started), now).is_none());
    }

    #[test]
    fn test_execution_exceeds_limit() {
        let config = TimeoutConfig::new().with_max_execution_duration(Duration::from_secs(60));
        let now = Utc::now();
        let started = now - chrono::Duration::seconds(61);

        match config.check_execution(Some(started), now) {
            Some(TimeoutError::Execution { elapsed, limit }) => {
                assert_eq!(limit, Duration::from_secs(60));
                assert!(elapsed > limit);
            }
            other => panic!("expected execution timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_completes_in_time() {
        let config = TimeoutConfig::new().with_dispatch_timeout(Duration::from_secs(1));
        let result = config.run_dispatch(async { 42 }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_times_out() {
        let config = TimeoutConfig::new().with_dispatch_timeout(Duration::from_millis(50));
        let result = config
            .run_dispatch(tokio::time::sleep(Duration::from_secs(10)))
            .await;

        assert_eq!(
            result,
            Err(TimeoutError::Dispatch {
                limit: Duration::from_millis(50)
            })
        );
    }
}
