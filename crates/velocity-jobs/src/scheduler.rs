//! Enqueue logic shared by producers and workers.

use crate::error::{JobError, JobResult};
use crate::job::{job_key, Job, JobState, NewJob, DEFAULT_JOB_TYPE, DEFAULT_PRIORITY};
use crate::metrics::JobMetrics;
use crate::store::{JobStore, ScheduleEntry, StoreConnector};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, warn};

/// Normalizes job requests and writes them into the store.
///
/// A job with a positive due time goes to the delayed set; anything else is
/// pushed straight onto its priority queue.
///
/// # Example
///
/// ```rust,ignore
/// let scheduler = JobScheduler::connect(&connector).await?;
/// let key = scheduler
///     .schedule_job(NewJob::new("echo").data("hi"), 0)
///     .await?;
/// scheduler.end().await?;
/// ```
pub struct JobScheduler {
    /// Private store connection.
    store: Box<dyn JobStore>,

    /// Number of priority queues.
    priority_levels: u32,

    /// Set once the connection has been released.
    ended: AtomicBool,
}

impl JobScheduler {
    /// Wrap an already opened store connection.
    pub fn new(store: Box<dyn JobStore>, priority_levels: u32) -> Self {
        Self {
            store,
            priority_levels,
            ended: AtomicBool::new(false),
        }
    }

    /// Open a private connection through `connector`.
    pub async fn connect(connector: &dyn StoreConnector) -> JobResult<Self> {
        let store = connector.connect().await?;
        Ok(Self::new(store, connector.priority_levels()))
    }

    /// The underlying store connection.
    pub fn store(&self) -> &dyn JobStore {
        self.store.as_ref()
    }

    /// Number of priority queues jobs may target.
    pub fn priority_levels(&self) -> u32 {
        self.priority_levels
    }

    /// Fill in key, type, priority and state for a request.
    pub fn resolve(&self, request: NewJob, due_time: i64) -> JobResult<Job> {
        let priority = match request.priority {
            None | Some(0) => DEFAULT_PRIORITY,
            Some(p) if p > self.priority_levels => {
                return Err(JobError::InvalidPriority {
                    priority: p,
                    levels: self.priority_levels,
                })
            }
            Some(p) => p,
        };

        let job_type = request
            .job_type
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_JOB_TYPE.to_string());

        let key = request
            .key
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| job_key(&job_type));

        let state = if due_time > 0 {
            JobState::Scheduled
        } else {
            JobState::Waiting
        };

        Ok(Job {
            key,
            job_type,
            priority,
            data: request.data,
            state,
            attempts: request.attempts,
        })
    }

    /// Persist a job and make it reachable by workers.
    ///
    /// Returns the job key. When the record was written but the queue or
    /// delayed-set write failed, the error is [`JobError::Unreachable`]
    /// carrying the key so the caller can re-submit it.
    pub async fn schedule_job(&self, request: NewJob, due_time: i64) -> JobResult<String> {
        let job = self.resolve(request, due_time)?;

        self.store.set_job(&job.key, &job).await?;

        let queued = if due_time > 0 {
            let entry = ScheduleEntry::new(job.key.as_str(), job.priority, due_time);
            self.store.add_to_schedule(due_time, &entry.encode()).await
        } else {
            self.store.add_to_queue(job.priority, &job.key).await
        };

        if let Err(e) = queued {
            warn!(job_key = %job.key, error = %e, "Job stored but not queued");
            return Err(JobError::Unreachable {
                key: job.key,
                source: Box::new(e),
            });
        }

        JobMetrics::job_scheduled(&job.job_type, job.priority, due_time > 0);
        debug!(
            job_key = %job.key,
            job_type = %job.job_type,
            priority = job.priority,
            due_time,
            "Job scheduled"
        );

        Ok(job.key)
    }

    /// Release the store connection. Calling it again is a no-op.
    pub async fn end(&self) -> JobResult<()> {
        if self.ended.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.store.close_connection().await
    }

    /// Whether [`end`](Self::end) has been called.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

/// Move every delayed job due at or before `now` into its priority queue.
///
/// Entries are batched into one `add_all_to_queue` call per priority, in
/// due-time order. Returns the number of promoted jobs. A batch that cannot
/// be queued is put back into the delayed set; the remaining batches are
/// still promoted and the first error is returned afterwards.
pub async fn promote_due(store: &dyn JobStore, now: i64, priority_levels: u32) -> JobResult<usize> {
    let due = store.pull_scheduled_until(now).await?;
    if due.is_empty() {
        return Ok(0);
    }

    let mut batches: BTreeMap<u32, Vec<ScheduleEntry>> = BTreeMap::new();
    for value in &due {
        match ScheduleEntry::decode(value) {
            Ok(mut entry) => {
                if entry.priority == 0 || entry.priority > priority_levels {
                    warn!(
                        job_key = %entry.key,
                        priority = entry.priority,
                        "Scheduled job priority out of range, clamping"
                    );
                    entry.priority = entry.priority.clamp(1, priority_levels);
                }
                batches.entry(entry.priority).or_default().push(entry);
            }
            Err(e) => warn!(error = %e, "Dropping malformed schedule entry"),
        }
    }

    let mut promoted = 0;
    let mut first_error = None;
    for (priority, entries) in batches {
        let keys: Vec<String> = entries.iter().map(|entry| entry.key.clone()).collect();

        if let Err(e) = store.add_all_to_queue(priority, &keys).await {
            error!(priority, count = keys.len(), error = %e, "Failed to promote scheduled jobs");
            for entry in &entries {
                if let Err(e) = store.add_to_schedule(entry.due, &entry.encode()).await {
                    error!(job_key = %entry.key, error = %e, "Failed to restore schedule entry");
                }
            }
            first_error.get_or_insert(e);
            continue;
        }

        JobMetrics::jobs_promoted(priority, keys.len());
        debug!(priority, count = keys.len(), "Promoted scheduled jobs");
        promoted += keys.len();
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(promoted),
    }
}
