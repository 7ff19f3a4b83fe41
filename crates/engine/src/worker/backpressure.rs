//! Load-aware intake for the worker pool
//!
//! Scanners ask before pulling more executions or waits. Intake closes when
//! in-flight work reaches the high watermark and reopens only once it has
//! fallen to the low watermark.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Watermarks as a fraction of the pool's concurrency
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackpressureConfig {
    pub high_watermark: f64,
    pub low_watermark: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_watermark: 0.9,
            low_watermark: 0.7,
        }
    }
}

impl BackpressureConfig {
    pub fn validate(&self) -> Result<(), BackpressureError> {
        let in_range = |w: f64| (0.0..=1.0).contains(&w);
        if !in_range(self.high_watermark) || !in_range(self.low_watermark) {
            return Err(BackpressureError::InvalidConfig(
                "watermarks must be between 0 and 1".into(),
            ));
        }
        if self.low_watermark >= self.high_watermark {
            return Err(BackpressureError::InvalidConfig(format!(
                "low watermark {} is not below high watermark {}",
                self.low_watermark, self.high_watermark
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackpressureError {
    #[error("invalid backpressure configuration: {0}")]
    InvalidConfig(String),
}

/// In-flight counter with an open/closed intake gate
pub struct BackpressureState {
    config: BackpressureConfig,
    capacity: usize,
    in_flight: AtomicUsize,
    open: AtomicBool,
}

impl BackpressureState {
    pub fn new(config: BackpressureConfig, max_concurrency: usize) -> Self {
        Self {
            config,
            capacity: max_concurrency.max(1),
            in_flight: AtomicUsize::new(0),
            open: AtomicBool::new(true),
        }
    }

    /// Whether scanners may pull more work right now
    pub fn should_accept(&self) -> bool {
        let load = self.in_flight() as f64 / self.capacity as f64;
        let open = self.open.load(Ordering::Relaxed);

        let next = if open {
            load < self.config.high_watermark
        } else {
            load <= self.config.low_watermark
        };
        if next != open {
            self.open.store(next, Ordering::Relaxed);
            tracing::debug!(in_flight = self.in_flight(), open = next, "worker intake changed");
        }
        next
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn available_slots(&self) -> usize {
        self.capacity.saturating_sub(self.in_flight())
    }

    pub fn started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marks(high: f64, low: f64) -> BackpressureConfig {
        BackpressureConfig {
            high_watermark: high,
            low_watermark: low,
        }
    }

    #[test]
    fn test_invalid_watermarks() {
        assert!(marks(0.5, 0.8).validate().is_err());
        assert!(marks(1.5, 0.8).validate().is_err());
        assert!(BackpressureConfig::default().validate().is_ok());
    }

    #[test]
    fn test_intake_closes_and_reopens_with_hysteresis() {
        let state = BackpressureState::new(marks(0.8, 0.5), 10);
        assert!(state.should_accept());

        for _ in 0..8 {
            state.started();
        }
        assert!(!state.should_accept());

        // 70% sits between the watermarks
        state.finished();
        assert!(!state.should_accept());

        state.finished();
        state.finished();
        assert!(state.should_accept());
        assert_eq!(state.available_slots(), 5);
    }
}
