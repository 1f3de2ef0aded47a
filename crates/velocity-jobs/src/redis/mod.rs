//! Redis-backed job store.
//!
//! Priority queues are lists, the delayed set and the lease set are sorted
//! sets scored by milliseconds, and stats snapshots are appended to a stream.

mod store;

pub use store::RedisJobStore;

use crate::config::RedisConfig;
use crate::error::{JobError, JobResult};
use crate::store::{JobStore, StoreConnector};
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use std::time::Duration;
use tracing::{debug, info};

/// Create a Redis connection pool.
pub async fn create_pool(config: &RedisConfig) -> JobResult<Pool> {
    debug!(url = %config.url, pool_size = config.pool_size, "Creating Redis connection pool");

    let cfg = Config::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {}", e)))?;

    // Test connection
    let mut conn = pool.get().await?;
    redis::cmd("PING")
        .query_async::<String>(&mut *conn)
        .await?;

    Ok(pool)
}

/// Redis key builder.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// List holding the keys queued at one priority level.
    pub fn queue(&self, priority: u32) -> String {
        format!("{}/queue/{}", self.prefix, priority)
    }

    /// All priority queue keys, highest priority first.
    pub fn queues(&self, priority_levels: u32) -> Vec<String> {
        (1..=priority_levels).map(|p| self.queue(p)).collect()
    }

    /// Delayed set (sorted set by due time).
    pub fn scheduled(&self) -> String {
        format!("{}/queue/scheduled", self.prefix)
    }

    /// Lease set (sorted set by expiry time).
    pub fn leases(&self) -> String {
        format!("{}/leases", self.prefix)
    }

    /// Stats stream.
    pub fn stats(&self) -> String {
        format!("{}/stats", self.prefix)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("jobs")
    }
}

/// Opens one pool per connection owner.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    config: RedisConfig,
    priority_levels: u32,
    pop_timeout: Duration,
}

impl RedisConnector {
    /// Create a connector.
    pub fn new(config: RedisConfig, priority_levels: u32, pop_timeout: Duration) -> Self {
        Self {
            config,
            priority_levels,
            pop_timeout,
        }
    }
}

#[async_trait]
impl StoreConnector for RedisConnector {
    async fn connect(&self) -> JobResult<Box<dyn JobStore>> {
        let pool = create_pool(&self.config).await?;
        info!(prefix = %self.config.key_prefix, "Connected job store to Redis");
        Ok(Box::new(RedisJobStore::new(
            pool,
            RedisKeys::new(&self.config.key_prefix),
            self.priority_levels,
            self.pop_timeout,
        )))
    }

    fn priority_levels(&self) -> u32 {
        self.priority_levels
    }
}
