//! Runnable-execution polling
//!
//! Executions become runnable when enrolled, when a retry comes due, or when
//! a wait resumes them. The poller asks the store for them in small batches
//! and stretches its sleep while the store keeps coming back empty.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::engine::{EngineError, WorkflowEngine};
use crate::serde_util::duration_millis;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Sleep after a poll that found executions
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Longest sleep after consecutive empty polls
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth factor applied per empty poll
    pub idle_growth: f64,

    /// Upper bound on executions claimed per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            idle_growth: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }
}

/// Sleep length between runnable polls
#[derive(Debug, Clone)]
pub struct AdaptiveInterval {
    floor: Duration,
    ceiling: Duration,
    growth: f64,
    empty_polls: u32,
}

impl AdaptiveInterval {
    pub fn new(config: &PollerConfig) -> Self {
        Self {
            floor: config.min_interval,
            ceiling: config.max_interval.max(config.min_interval),
            growth: config.idle_growth.max(1.0),
            empty_polls: 0,
        }
    }

    pub fn current(&self) -> Duration {
        if self.empty_polls == 0 {
            return self.floor;
        }
        let exponent = i32::try_from(self.empty_polls).unwrap_or(i32::MAX);
        let secs = self.floor.as_secs_f64() * self.growth.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.ceiling)
            .min(self.ceiling)
    }

    pub fn record(&mut self, found: usize) {
        if found > 0 {
            self.empty_polls = 0;
        } else if self.current() < self.ceiling {
            self.empty_polls = self.empty_polls.saturating_add(1);
        }
    }
}

/// Claims runnable execution IDs for the pool's execution queue
pub struct RunnablePoller {
    engine: Arc<WorkflowEngine>,
    interval: AdaptiveInterval,
    batch_size: usize,
    shutdown_rx: watch::Receiver<bool>,
}

impl RunnablePoller {
    pub fn new(
        engine: Arc<WorkflowEngine>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            engine,
            interval: AdaptiveInterval::new(&config),
            batch_size: config.batch_size.max(1),
            shutdown_rx,
        }
    }

    /// Up to `slots` runnable executions; empty once shutdown has begun
    pub async fn poll(&mut self, slots: usize) -> Result<Vec<Uuid>, EngineError> {
        if self.is_shutdown() {
            return Ok(Vec::new());
        }

        let ids = self
            .engine
            .runnable_executions(slots.min(self.batch_size))
            .await?;
        self.interval.record(ids.len());

        match ids.len() {
            0 => trace!(
                next_poll_ms = self.interval.current().as_millis() as u64,
                "nothing runnable"
            ),
            n => debug!(count = n, "claimed runnable executions"),
        }
        Ok(ids)
    }

    /// Returns true when woken by shutdown rather than the timer
    pub async fn wait(&mut self) -> bool {
        let sleep = self.interval.current();
        tokio::select! {
            _ = tokio::time::sleep(sleep) => false,
            _ = self.shutdown_rx.changed() => true,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_polls_stretch_to_ceiling() {
        let config = PollerConfig {
            idle_growth: 2.0,
            ..PollerConfig::new()
                .with_min_interval(Duration::from_millis(100))
                .with_max_interval(Duration::from_millis(300))
        };
        let mut interval = AdaptiveInterval::new(&config);
        assert_eq!(interval.current(), Duration::from_millis(100));

        interval.record(0);
        assert_eq!(interval.current(), Duration::from_millis(200));
        interval.record(0);
        interval.record(0);
        assert_eq!(interval.current(), Duration::from_millis(300));

        interval.record(4);
        assert_eq!(interval.current(), Duration::from_millis(100));
    }

    #[test]
    fn test_growth_below_one_is_flat() {
        let config = PollerConfig {
            idle_growth: 0.5,
            ..PollerConfig::default()
        };
        let mut interval = AdaptiveInterval::new(&config);
        interval.record(0);
        assert_eq!(interval.current(), config.min_interval);
    }
}
