//! Job error types.

use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store backend error not covered by a more specific variant.
    #[error("Store error: {0}")]
    Store(String),

    /// The store connection was already closed.
    #[error("Store connection is closed")]
    StoreClosed,

    /// Job not found.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// Priority outside of the configured levels.
    #[error("Invalid priority {priority}: expected a value in 1..={levels}")]
    InvalidPriority { priority: u32, levels: u32 },

    /// The job record was written but it could not be queued or scheduled.
    ///
    /// The record stays in `waiting`/`scheduled` state without a queue entry
    /// until the caller re-submits it.
    #[error("Job {key} was stored but could not be queued: {source}")]
    Unreachable {
        key: String,
        #[source]
        source: Box<JobError>,
    },

    /// Malformed entry read back from the delayed set.
    #[error("Malformed schedule entry: {0}")]
    MalformedEntry(String),

    /// No run function registered for the job type.
    #[error("no run function registered for job type {0}")]
    UnknownJobType(String),

    /// Job execution failed.
    #[error("Job execution failed: {0}")]
    ExecutionFailed(String),

    /// Worker error.
    #[error("Worker error: {0}")]
    Worker(String),

    /// Manager error.
    #[error("Manager error: {0}")]
    Manager(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Returns true if the error came from the persistence layer.
    ///
    /// The manager logs these and tries again on its next tick.
    pub fn is_store_error(&self) -> bool {
        match self {
            JobError::Redis(_)
            | JobError::Pool(_)
            | JobError::Store(_)
            | JobError::StoreClosed
            | JobError::Serialization(_) => true,
            JobError::Unreachable { source, .. } => source.is_store_error(),
            _ => false,
        }
    }

    /// Returns the key of a job that was persisted but left without a queue entry.
    pub fn unreachable_key(&self) -> Option<&str> {
        match self {
            JobError::Unreachable { key, .. } => Some(key),
            _ => None,
        }
    }
}

impl From<JobError> for velocity_core::VelocityError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::InvalidPriority { .. } => Self::Validation(err.to_string()),
            JobError::Configuration(msg) => Self::Configuration(msg),
            JobError::NotFound(key) => Self::not_found("Job", key),
            e if e.is_store_error() => Self::Store(e.to_string()),
            e => Self::Job(e.to_string()),
        }
    }
}
