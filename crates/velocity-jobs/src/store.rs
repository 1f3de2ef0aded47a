//! Persistence contract consumed by the scheduler, workers and manager.

use crate::error::{JobError, JobResult};
use crate::job::Job;
use crate::stats::JobStats;
use async_trait::async_trait;
use std::fmt;

/// Storage primitives the scheduling layer depends on.
///
/// Every manager and every worker holds its own instance, obtained from a
/// [`StoreConnector`]. Queue pops and the delayed-set/lease pulls must be
/// atomic across instances: no entry may be handed out twice.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Upserts a full job record.
    async fn set_job(&self, key: &str, job: &Job) -> JobResult<()>;

    /// Fetches a job record by key.
    async fn get_job(&self, key: &str) -> JobResult<Option<Job>>;

    /// Appends a key to the tail of a priority queue.
    async fn add_to_queue(&self, priority: u32, key: &str) -> JobResult<()>;

    /// Appends keys, in order, to the tail of a priority queue.
    async fn add_all_to_queue(&self, priority: u32, keys: &[String]) -> JobResult<()>;

    /// Pops the head of the first non-empty queue in priority order.
    ///
    /// Waits a bounded time for work before returning `None`.
    async fn get_next_in_queue(&self) -> JobResult<Option<String>>;

    /// Depth of each priority queue, index 0 being priority 1.
    async fn queue_lengths(&self) -> JobResult<Vec<u64>>;

    /// Total number of queued keys across all priorities.
    async fn get_queued_length(&self) -> JobResult<u64> {
        Ok(self.queue_lengths().await?.iter().sum())
    }

    /// Adds an encoded [`ScheduleEntry`] to the delayed set.
    async fn add_to_schedule(&self, due_time: i64, value: &str) -> JobResult<()>;

    /// Atomically reads and removes every delayed entry due at or before `time`.
    async fn pull_scheduled_until(&self, time: i64) -> JobResult<Vec<String>>;

    /// Number of entries in the delayed set.
    async fn get_scheduled_length(&self) -> JobResult<u64>;

    /// Records (or refreshes) the lease on a dequeued job.
    async fn add_lease(&self, key: &str, expires_at: i64) -> JobResult<()>;

    /// Drops the lease on a job.
    async fn remove_lease(&self, key: &str) -> JobResult<()>;

    /// Atomically reads and removes every lease that expired at or before `now`.
    async fn pull_expired_leases(&self, now: i64) -> JobResult<Vec<String>>;

    /// Appends a stats snapshot.
    async fn record_job_stats(&self, stats: &JobStats) -> JobResult<()>;

    /// Releases backend resources. Calling it again is a no-op.
    async fn close_connection(&self) -> JobResult<()>;
}

/// Opens private store connections.
#[async_trait]
pub trait StoreConnector: Send + Sync + 'static {
    /// Opens a new connection.
    async fn connect(&self) -> JobResult<Box<dyn JobStore>>;

    /// Number of priority queues behind connections from this connector.
    fn priority_levels(&self) -> u32;
}

/// A delayed-set member: which job to promote, into which queue, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    /// Job key.
    pub key: String,
    /// Target priority queue.
    pub priority: u32,
    /// Due time in ms since the epoch.
    pub due: i64,
}

impl ScheduleEntry {
    /// Creates an entry.
    pub fn new(key: impl Into<String>, priority: u32, due: i64) -> Self {
        Self {
            key: key.into(),
            priority,
            due,
        }
    }

    /// Encodes as `{key}.{priority}.{due}`.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Decodes a member, splitting from the right so keys may contain dots.
    pub fn decode(value: &str) -> JobResult<Self> {
        let mut parts = value.rsplitn(3, '.');
        let due = parts.next();
        let priority = parts.next();
        let key = parts.next();

        match (key, priority, due) {
            (Some(key), Some(priority), Some(due)) if !key.is_empty() => {
                let priority = priority
                    .parse::<u32>()
                    .map_err(|_| JobError::MalformedEntry(value.to_string()))?;
                let due = due
                    .parse::<i64>()
                    .map_err(|_| JobError::MalformedEntry(value.to_string()))?;
                Ok(Self::new(key, priority, due))
            }
            _ => Err(JobError::MalformedEntry(value.to_string())),
        }
    }
}

impl fmt::Display for ScheduleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.key, self.priority, self.due)
    }
}
