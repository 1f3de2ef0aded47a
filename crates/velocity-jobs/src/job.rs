//! Job records, partial job requests and run outcomes.

use crate::error::JobResult;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Job type used when a request does not name one.
pub const DEFAULT_JOB_TYPE: &str = "global";

/// Priority used when a request does not set one.
pub const DEFAULT_PRIORITY: u32 = 1;

/// Width mask applied to the millisecond timestamp part of generated ids.
const TIMESTAMP_MASK: i64 = 0x0fff_ffff;

/// Current wall clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Generates a coordination-free job id.
///
/// Masked millisecond timestamp followed by a random 32-bit integer.
pub fn generate_job_id() -> String {
    let random = (Uuid::new_v4().as_u128() & 0xffff_ffff) as u32;
    format!("{}{}", now_millis() & TIMESTAMP_MASK, random)
}

/// Builds the store key for a new job of the given type.
pub fn job_key(job_type: &str) -> String {
    format!("jobs/{}/{}", job_type, generate_job_id())
}

/// Persisted job state.
///
/// Flattened into the job record under the `state` field. Only `complete`
/// carries a result and only `failed` carries an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    /// Queued for immediate execution.
    Waiting,
    /// Parked in the delayed set until its due time.
    Scheduled,
    /// Dequeued by a worker.
    Running,
    /// Finished successfully.
    Complete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    /// Finished with an error.
    Failed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
}

impl JobState {
    /// Returns the state name as persisted.
    pub fn name(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Complete { .. } => "complete",
            JobState::Failed { .. } => "failed",
        }
    }

    /// Returns true for `complete` and `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete { .. } | JobState::Failed { .. })
    }
}

impl Default for JobState {
    fn default() -> Self {
        JobState::Waiting
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// A persisted work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Globally unique key; never changes after the first write.
    pub key: String,

    /// Selects the run function.
    #[serde(rename = "type")]
    pub job_type: String,

    /// Priority level, `1..=N`.
    pub priority: u32,

    /// Opaque payload handed to the run function.
    #[serde(default)]
    pub data: Value,

    /// Lifecycle state (and its result/error payload).
    #[serde(flatten)]
    pub state: JobState,

    /// Number of times the job was requeued after its lease expired.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempts: u32,
}

impl Job {
    /// Marks the job complete, attaching the result if any.
    pub fn complete(&mut self, result: Option<Value>) {
        self.state = JobState::Complete { result };
    }

    /// Marks the job failed, attaching the error if any.
    pub fn fail(&mut self, error: Option<Value>) {
        self.state = JobState::Failed { error };
    }

    /// Returns the result of a completed job.
    pub fn result(&self) -> Option<&Value> {
        match &self.state {
            JobState::Complete { result } => result.as_ref(),
            _ => None,
        }
    }

    /// Returns the error of a failed job.
    pub fn error(&self) -> Option<&Value> {
        match &self.state {
            JobState::Failed { error } => error.as_ref(),
            _ => None,
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> JobResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> JobResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A job request with any subset of `key`, `type` and `priority` left unset.
///
/// # Example
///
/// ```rust
/// use velocity_jobs::NewJob;
///
/// let job = NewJob::new("echo").priority(2).data("hi");
/// assert_eq!(job.job_type.as_deref(), Some("echo"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    /// Explicit key; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Job type; defaults to `global`.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,

    /// Priority; defaults to 1. Zero counts as unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,

    /// Payload.
    #[serde(default)]
    pub data: Value,

    /// Lease requeue count carried over when a job is resubmitted.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempts: u32,
}

impl NewJob {
    /// Creates a request for the given job type.
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: Some(job_type.into()),
            ..Self::default()
        }
    }

    /// Sets an explicit key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Sets the priority level.
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the payload.
    pub fn data(mut self, data: impl Into<Value>) -> Self {
        self.data = data.into();
        self
    }

    /// Sets the payload from any serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> JobResult<Self> {
        self.data = serde_json::to_value(payload)?;
        Ok(self)
    }
}

impl From<Job> for NewJob {
    fn from(job: Job) -> Self {
        Self {
            key: Some(job.key),
            job_type: Some(job.job_type),
            priority: Some(job.priority),
            data: job.data,
            attempts: job.attempts,
        }
    }
}

/// What a run function asks the worker to do with the job it just ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Terminal success.
    Complete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    /// Terminal failure.
    Fail {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
    /// Re-submit as a delayed job due at `time` (ms since epoch).
    Reschedule { time: i64 },
}

impl JobOutcome {
    /// Success with a result payload.
    pub fn complete(result: impl Into<Value>) -> Self {
        JobOutcome::Complete {
            result: Some(result.into()),
        }
    }

    /// Success without a result payload.
    pub fn done() -> Self {
        JobOutcome::Complete { result: None }
    }

    /// Failure with an error payload.
    pub fn fail(error: impl Into<Value>) -> Self {
        JobOutcome::Fail {
            error: Some(error.into()),
        }
    }

    /// Run again at an absolute time.
    pub fn reschedule(time: i64) -> Self {
        JobOutcome::Reschedule { time }
    }

    /// Run again after a delay from now.
    pub fn reschedule_in(delay: Duration) -> Self {
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        JobOutcome::Reschedule {
            time: now_millis().saturating_add(delay_ms),
        }
    }
}
