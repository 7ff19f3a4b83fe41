//! Engine configuration
//!
//! Every value has a default; `from_env` overrides them from `ENGINE_*`
//! variables and ignores values that fail to parse.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::reliability::{RetryPolicy, TimeoutConfig};
use crate::serde_util::{duration_millis, duration_secs};

/// Bulk enrollment settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkConfig {
    pub default_batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    /// Attempts per batch before a systemic failure sticks
    pub max_batch_attempts: u32,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 100,
            min_batch_size: 10,
            max_batch_size: 500,
            max_batch_attempts: 3,
        }
    }
}

impl BulkConfig {
    /// Clamp a requested batch size into the allowed range
    pub fn clamp_batch_size(&self, requested: usize) -> usize {
        requested.clamp(self.min_batch_size, self.max_batch_size)
    }
}

/// Version migration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationConfig {
    pub default_batch_size: usize,
    /// Lease attempts per execution before it is deferred to a later batch
    pub claim_attempts: u32,
    #[serde(with = "duration_millis")]
    pub claim_backoff: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 100,
            claim_attempts: 3,
            claim_backoff: Duration::from_millis(200),
        }
    }
}

/// Periodic scan settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(with = "duration_secs")]
    pub wait_scan_interval: Duration,
    #[serde(with = "duration_secs")]
    pub listener_scan_interval: Duration,
    /// Rows fetched per scan
    pub scan_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            wait_scan_interval: Duration::from_secs(30),
            listener_scan_interval: Duration::from_secs(30),
            scan_batch_size: 100,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Lease owner name written on claimed executions
    pub worker_id: String,

    /// Active plus waiting executions allowed per account
    pub max_concurrent_executions_per_account: usize,

    #[serde(with = "duration_millis")]
    pub lease_ttl: Duration,

    /// Default action retry policy
    pub retry_policy: RetryPolicy,

    pub timeouts: TimeoutConfig,

    /// Steps taken per claim before the lease is handed back
    pub max_steps_per_drive: u32,

    pub bulk: BulkConfig,

    pub migration: MigrationConfig,

    pub scheduler: SchedulerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("engine-{}", Uuid::now_v7()),
            max_concurrent_executions_per_account: 100,
            lease_ttl: Duration::from_secs(300),
            retry_policy: RetryPolicy::exponential(),
            timeouts: TimeoutConfig::default(),
            max_steps_per_drive: 100,
            bulk: BulkConfig::default(),
            migration: MigrationConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `ENGINE_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(id) = std::env::var("ENGINE_WORKER_ID") {
            if !id.trim().is_empty() {
                config.worker_id = id;
            }
        }
        env_parse("ENGINE_MAX_CONCURRENT_EXECUTIONS", &mut config.max_concurrent_executions_per_account);
        env_parse("ENGINE_MAX_STEPS_PER_DRIVE", &mut config.max_steps_per_drive);
        env_secs("ENGINE_LEASE_TTL_SECS", &mut config.lease_ttl);

        let mut max_retries = config.retry_policy.max_retries();
        env_parse("ENGINE_ACTION_MAX_RETRIES", &mut max_retries);
        let mut initial = config.retry_policy.initial_interval;
        env_secs("ENGINE_ACTION_RETRY_INITIAL_SECS", &mut initial);
        let mut cap = config.retry_policy.max_interval;
        env_secs("ENGINE_ACTION_RETRY_MAX_SECS", &mut cap);
        config.retry_policy = config
            .retry_policy
            .with_max_retries(max_retries)
            .with_initial_interval(initial)
            .with_max_interval(cap);

        env_secs("ENGINE_MAX_EXECUTION_SECS", &mut config.timeouts.max_execution_duration);
        env_secs("ENGINE_DISPATCH_TIMEOUT_SECS", &mut config.timeouts.dispatch_timeout);

        env_secs("ENGINE_WAIT_SCAN_INTERVAL_SECS", &mut config.scheduler.wait_scan_interval);
        env_secs("ENGINE_LISTENER_SCAN_INTERVAL_SECS", &mut config.scheduler.listener_scan_interval);
        env_parse("ENGINE_SCAN_BATCH_SIZE", &mut config.scheduler.scan_batch_size);

        env_parse("ENGINE_BULK_BATCH_SIZE", &mut config.bulk.default_batch_size);
        env_parse("ENGINE_BULK_MAX_BATCH_ATTEMPTS", &mut config.bulk.max_batch_attempts);
        env_parse("ENGINE_MIGRATION_BATCH_SIZE", &mut config.migration.default_batch_size);

        config
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrent_executions(mut self, max: usize) -> Self {
        self.max_concurrent_executions_per_account = max.max(1);
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_max_steps_per_drive(mut self, steps: u32) -> Self {
        self.max_steps_per_drive = steps.max(1);
        self
    }

    pub fn with_bulk(mut self, bulk: BulkConfig) -> Self {
        self.bulk = bulk;
        self
    }

    pub fn with_migration(mut self, migration: MigrationConfig) -> Self {
        self.migration = migration;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }
}

fn env_parse<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => warn!(key, value = %raw, "ignoring unparseable setting"),
        }
    }
}

fn env_secs(key: &str, target: &mut Duration) {
    let mut secs = target.as_secs();
    env_parse(key, &mut secs);
    *target = Duration::from_secs(secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_executions_per_account, 100);
        assert_eq!(config.lease_ttl, Duration::from_secs(300));
        assert_eq!(config.retry_policy.max_retries(), 3);
        assert_eq!(config.scheduler.wait_scan_interval, Duration::from_secs(30));
        assert_eq!(config.timeouts.max_execution_duration, Duration::from_secs(30 * 24 * 3600));
        assert!(config.worker_id.starts_with("engine-"));
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::new()
            .with_worker_id("w-1")
            .with_max_concurrent_executions(0)
            .with_max_steps_per_drive(5);

        assert_eq!(config.worker_id, "w-1");
        assert_eq!(config.max_concurrent_executions_per_account, 1);
        assert_eq!(config.max_steps_per_drive, 5);
    }

    #[test]
    fn test_batch_size_clamped() {
        let bulk = BulkConfig::default();
        assert_eq!(bulk.clamp_batch_size(1), 10);
        assert_eq!(bulk.clamp_batch_size(250), 250);
        assert_eq!(bulk.clamp_batch_size(10_000), 500);
    }

    #[test]
    fn test_serde_round_trip() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
