//! Retry policy for action dispatch

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::serde_util::duration_millis;

/// When a failed action is dispatched again
///
/// The engine default is 3 retries (4 attempts) starting at 30 seconds,
/// doubling up to an hour, with 10% jitter so executions that failed
/// together against a recovering action service spread out.
///
/// ```
/// use automation_engine::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_retries(5)
///     .with_initial_interval(Duration::from_secs(10));
///
/// assert_eq!(policy.max_attempts, 6);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first dispatch
    pub max_attempts: u32,

    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    pub backoff_coefficient: f64,

    /// Fraction of the delay added or removed at random
    pub jitter: f64,

    /// Dispatcher error codes that fail the action on the first occurrence
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    pub fn exponential() -> Self {
        Self {
            max_attempts: 4,
            initial_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(60 * 60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            non_retryable_errors: vec![],
        }
    }

    /// Same delay before every retry, no jitter
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Retries allowed after the first attempt (a node's `max_retries`)
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_attempts = max_retries.saturating_add(1);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_attempts.saturating_sub(1)
    }

    /// Delay before the given retry; the first retry is `1`
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let Some(exponent) = retry.checked_sub(1) else {
            return Duration::ZERO;
        };
        let exponent = i32::try_from(exponent).unwrap_or(i32::MAX);
        let delay = (self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent))
            .min(self.max_interval.as_secs_f64());

        if self.jitter <= 0.0 || delay <= 0.0 {
            return Duration::from_secs_f64(delay);
        }
        let spread = delay * self.jitter.min(1.0);
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((delay + offset).max(0.0))
    }

    /// Whether an error with this code may be retried at all
    pub fn should_retry(&self, error_code: Option<&str>) -> bool {
        error_code.map_or(true, |code| !self.non_retryable_errors.iter().any(|c| c == code))
    }

    /// Whether another attempt is allowed after `failures` failed attempts
    pub fn has_attempts_remaining(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}
