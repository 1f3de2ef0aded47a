//! Redis job store implementation.

use super::RedisKeys;
use crate::error::{JobError, JobResult};
use crate::job::{now_millis, Job};
use crate::stats::JobStats;
use crate::store::JobStore;
use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::debug;

/// Redis-backed job store.
pub struct RedisJobStore {
    pool: Pool,
    keys: RedisKeys,
    queue_keys: Vec<String>,
    pop_timeout: Duration,
}

impl RedisJobStore {
    /// Create a new Redis job store.
    pub fn new(pool: Pool, keys: RedisKeys, priority_levels: u32, pop_timeout: Duration) -> Self {
        let queue_keys = keys.queues(priority_levels);
        Self {
            pool,
            keys,
            queue_keys,
            pop_timeout,
        }
    }

    /// Get a connection from the pool.
    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    fn queue_key(&self, priority: u32) -> JobResult<&str> {
        priority
            .checked_sub(1)
            .and_then(|index| self.queue_keys.get(index as usize))
            .map(String::as_str)
            .ok_or(JobError::InvalidPriority {
                priority,
                levels: self.queue_keys.len() as u32,
            })
    }

    /// Atomically reads and removes members of a sorted set scored at or below `max`.
    async fn pull_until(&self, key: &str, max: i64) -> JobResult<Vec<String>> {
        let mut conn = self.conn().await?;

        let (members,): (Vec<String>,) = redis::pipe()
            .atomic()
            .zrangebyscore(key, "-inf", max)
            .zrembyscore(key, "-inf", max)
            .ignore()
            .query_async(&mut *conn)
            .await?;

        Ok(members)
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn set_job(&self, key: &str, job: &Job) -> JobResult<()> {
        let json = job.to_json()?;
        let mut conn = self.conn().await?;
        let _: () = conn.set(key, json).await?;
        Ok(())
    }

    async fn get_job(&self, key: &str) -> JobResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let json: Option<String> = conn.get(key).await?;
        json.map(|json| Job::from_json(&json)).transpose()
    }

    async fn add_to_queue(&self, priority: u32, key: &str) -> JobResult<()> {
        let queue_key = self.queue_key(priority)?;
        let mut conn = self.conn().await?;
        let _: u64 = conn.rpush(queue_key, key).await?;
        Ok(())
    }

    async fn add_all_to_queue(&self, priority: u32, keys: &[String]) -> JobResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let queue_key = self.queue_key(priority)?;
        let mut conn = self.conn().await?;
        let _: u64 = conn.rpush(queue_key, keys).await?;
        Ok(())
    }

    async fn get_next_in_queue(&self) -> JobResult<Option<String>> {
        let mut conn = self.conn().await?;

        // BLPOP checks its keys left to right, so passing them in priority
        // order drains higher priorities first on every call.
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(&self.queue_keys)
            .arg(self.pop_timeout.as_secs_f64())
            .query_async(&mut *conn)
            .await?;

        if let Some((queue, key)) = &popped {
            debug!(queue = %queue, job_key = %key, "Popped job key");
        }

        Ok(popped.map(|(_, key)| key))
    }

    async fn queue_lengths(&self) -> JobResult<Vec<u64>> {
        let mut conn = self.conn().await?;

        let mut pipe = redis::pipe();
        for key in &self.queue_keys {
            pipe.llen(key);
        }

        let lengths: Vec<u64> = pipe.query_async(&mut *conn).await?;
        Ok(lengths)
    }

    async fn add_to_schedule(&self, due_time: i64, value: &str) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: u64 = conn.zadd(self.keys.scheduled(), value, due_time).await?;
        Ok(())
    }

    async fn pull_scheduled_until(&self, time: i64) -> JobResult<Vec<String>> {
        self.pull_until(&self.keys.scheduled(), time).await
    }

    async fn get_scheduled_length(&self) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        let count: u64 = conn.zcard(self.keys.scheduled()).await?;
        Ok(count)
    }

    async fn add_lease(&self, key: &str, expires_at: i64) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: u64 = conn.zadd(self.keys.leases(), key, expires_at).await?;
        Ok(())
    }

    async fn remove_lease(&self, key: &str) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: u64 = conn.zrem(self.keys.leases(), key).await?;
        Ok(())
    }

    async fn pull_expired_leases(&self, now: i64) -> JobResult<Vec<String>> {
        self.pull_until(&self.keys.leases(), now).await
    }

    async fn record_job_stats(&self, stats: &JobStats) -> JobResult<()> {
        let fields = stats.to_fields(now_millis());
        let mut conn = self.conn().await?;
        let _: String = conn.xadd(self.keys.stats(), "*", fields.as_slice()).await?;
        Ok(())
    }

    async fn close_connection(&self) -> JobResult<()> {
        self.pool.close();
        Ok(())
    }
}
