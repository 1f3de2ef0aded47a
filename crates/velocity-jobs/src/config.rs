//! Job scheduler configuration.

use crate::error::{JobError, JobResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest number of priority levels a manager runs with.
pub const MIN_PRIORITY_LEVELS: u32 = 5;

/// Configuration for the job system.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Redis connection configuration.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Manager and worker pool configuration.
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Lease-based recovery of jobs abandoned by crashed workers.
    #[serde(default)]
    pub lease: LeaseConfig,
}

impl JobsConfig {
    /// Checks values that would make the manager misbehave.
    pub fn validate(&self) -> JobResult<()> {
        if self.redis.url.trim().is_empty() {
            return Err(JobError::Configuration("Redis URL is required".to_string()));
        }
        if self.redis.pool_size == 0 {
            return Err(JobError::Configuration("Redis pool size must be at least 1".to_string()));
        }
        self.manager.validate()?;
        self.lease.validate()
    }
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size for each connection owner (manager or worker).
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Key prefix for queue, schedule, lease and stats keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_key_prefix() -> String {
    "jobs".to_string()
}

/// Manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Number of workers in the pool.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Run loop period in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Number of priority queues. Raised to 5 when lower.
    #[serde(default = "default_priority_levels")]
    pub priority_levels: u32,

    /// Upper bound on a single blocking queue pop in milliseconds.
    #[serde(default = "default_pop_timeout")]
    pub pop_timeout_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            poll_interval_ms: default_poll_interval(),
            priority_levels: default_priority_levels(),
            pop_timeout_ms: default_pop_timeout(),
        }
    }
}

fn default_max_workers() -> usize {
    4
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_priority_levels() -> u32 {
    MIN_PRIORITY_LEVELS
}

fn default_pop_timeout() -> u64 {
    1000
}

impl ManagerConfig {
    /// Returns the poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Interval used while waiting for workers to stop: half the poll
    /// interval, never below 10ms.
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis((self.poll_interval_ms / 2).max(10))
    }

    /// Returns the blocking pop timeout as Duration.
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }

    /// Priority level count with the floor applied.
    pub fn priority_levels(&self) -> u32 {
        self.priority_levels.max(MIN_PRIORITY_LEVELS)
    }

    fn validate(&self) -> JobResult<()> {
        if self.max_workers == 0 {
            return Err(JobError::Configuration("max_workers must be at least 1".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(JobError::Configuration("poll_interval_ms must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Lease configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Record leases on dequeue and sweep expired ones.
    #[serde(default = "default_lease_enabled")]
    pub enabled: bool,

    /// How long a worker may hold a job before it is considered abandoned.
    #[serde(default = "default_lease_duration")]
    pub duration_ms: u64,

    /// Requeues allowed before an abandoned job is marked failed.
    #[serde(default = "default_lease_max_retries")]
    pub max_retries: u32,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            enabled: default_lease_enabled(),
            duration_ms: default_lease_duration(),
            max_retries: default_lease_max_retries(),
        }
    }
}

fn default_lease_enabled() -> bool {
    true
}

fn default_lease_duration() -> u64 {
    300_000 // 5 minutes
}

fn default_lease_max_retries() -> u32 {
    3
}

impl LeaseConfig {
    /// A configuration with leases turned off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Returns the lease duration as Duration.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    fn validate(&self) -> JobResult<()> {
        if self.enabled && self.duration_ms == 0 {
            return Err(JobError::Configuration(
                "lease.duration_ms must be positive when leases are enabled".to_string(),
            ));
        }
        Ok(())
    }
}
