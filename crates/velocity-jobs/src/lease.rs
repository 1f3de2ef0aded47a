//! Recovery of jobs abandoned by crashed workers.
//!
//! Workers record a lease when they dequeue a job and drop it once the
//! outcome is persisted. A lease that outlives its duration means the worker
//! died mid-job; the manager sweeps those every tick.

use crate::config::LeaseConfig;
use crate::error::JobResult;
use crate::job::JobState;
use crate::metrics::JobMetrics;
use crate::store::JobStore;
use serde_json::Value;
use tracing::{debug, error, info, warn};

/// What a sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseSweep {
    /// Jobs pushed back onto their queue.
    pub requeued: usize,
    /// Jobs that ran out of attempts and were marked failed.
    pub failed: usize,
    /// Expired leases whose job had already moved on.
    pub skipped: usize,
}

/// Requeue or fail every job whose lease expired at or before `now`.
///
/// Every job without a terminal write is recovered. That includes
/// `scheduled` jobs, which a worker dequeued straight after promotion and
/// died on before writing `running`. Each recovery bumps `attempts`; once it
/// exceeds `max_retries` the job fails instead. A job that cannot be
/// recovered gets its lease back so the next sweep retries it. The other
/// pulled keys are still swept and the first error is returned at the end.
pub async fn sweep_expired_leases(
    store: &dyn JobStore,
    now: i64,
    config: &LeaseConfig,
) -> JobResult<LeaseSweep> {
    let mut sweep = LeaseSweep::default();
    let mut first_error = None;

    for key in store.pull_expired_leases(now).await? {
        match recover(store, &key, config).await {
            Ok(Recovery::Requeued) => sweep.requeued += 1,
            Ok(Recovery::Failed) => sweep.failed += 1,
            Ok(Recovery::Skipped) => sweep.skipped += 1,
            Err(e) => {
                warn!(job_key = %key, error = %e, "Failed to recover job");
                if let Err(e) = store.add_lease(&key, now).await {
                    error!(job_key = %key, error = %e, "Failed to restore lease");
                }
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(sweep),
    }
}

enum Recovery {
    Requeued,
    Failed,
    Skipped,
}

async fn recover(store: &dyn JobStore, key: &str, config: &LeaseConfig) -> JobResult<Recovery> {
    let mut job = match store.get_job(key).await? {
        Some(job) if !job.state.is_terminal() => job,
        Some(job) => {
            debug!(job_key = %key, state = %job.state, "Lease expired after job moved on");
            return Ok(Recovery::Skipped);
        }
        None => {
            warn!(job_key = %key, "Lease expired for missing job");
            return Ok(Recovery::Skipped);
        }
    };

    job.attempts += 1;

    if job.attempts > config.max_retries {
        warn!(job_key = %key, attempts = job.attempts, "Lease expired too often, failing job");
        job.fail(Some(Value::String(format!(
            "lease expired after {} attempts",
            job.attempts
        ))));
        store.set_job(key, &job).await?;
        JobMetrics::lease_recovered("failed");
        Ok(Recovery::Failed)
    } else {
        info!(job_key = %key, attempts = job.attempts, "Lease expired, requeueing job");
        job.state = JobState::Waiting;
        store.set_job(key, &job).await?;
        store.add_to_queue(job.priority, key).await?;
        JobMetrics::lease_recovered("requeued");
        Ok(Recovery::Requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::memory::MemoryConnector;
    use serde_json::json;
    use std::time::Duration;

    fn job(key: &str, state: JobState, attempts: u32) -> Job {
        Job {
            key: key.to_string(),
            job_type: "echo".to_string(),
            priority: 2,
            data: json!(null),
            state,
            attempts,
        }
    }

    fn config(max_retries: u32) -> LeaseConfig {
        LeaseConfig {
            max_retries,
            ..LeaseConfig::default()
        }
    }

    #[tokio::test]
    async fn test_expired_running_job_is_requeued() {
        let connector = MemoryConnector::new(5, Duration::from_millis(10));
        let store = connector.handle();
        store.set_job("a", &job("a", JobState::Running, 0)).await.unwrap();
        store.add_lease("a", 100).await.unwrap();

        let sweep = sweep_expired_leases(&store, 100, &config(3)).await.unwrap();

        assert_eq!(sweep.requeued, 1);
        assert_eq!(connector.queued_keys(2), vec!["a".to_string()]);
        let stored = store.get_job("a").await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Waiting);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_unexpired_lease_is_kept() {
        let connector = MemoryConnector::new(5, Duration::from_millis(10));
        let store = connector.handle();
        store.set_job("a", &job("a", JobState::Running, 0)).await.unwrap();
        store.add_lease("a", 500).await.unwrap();

        let sweep = sweep_expired_leases(&store, 499, &config(3)).await.unwrap();

        assert_eq!(sweep, LeaseSweep::default());
        assert_eq!(connector.lease_of("a"), Some(500));
    }

    #[tokio::test]
    async fn test_job_out_of_attempts_fails() {
        let connector = MemoryConnector::new(5, Duration::from_millis(10));
        let store = connector.handle();
        store.set_job("a", &job("a", JobState::Running, 2)).await.unwrap();
        store.add_lease("a", 1).await.unwrap();

        let sweep = sweep_expired_leases(&store, 10, &config(2)).await.unwrap();

        assert_eq!(sweep.failed, 1);
        assert!(connector.queued_keys(2).is_empty());
        let stored = store.get_job("a").await.unwrap().unwrap();
        assert_eq!(stored.error(), Some(&json!("lease expired after 3 attempts")));
    }

    #[tokio::test]
    async fn test_finished_and_missing_jobs_are_skipped() {
        let connector = MemoryConnector::new(5, Duration::from_millis(10));
        let store = connector.handle();
        store
            .set_job("done", &job("done", JobState::Complete { result: None }, 0))
            .await
            .unwrap();
        store
            .set_job("broken", &job("broken", JobState::Failed { error: None }, 0))
            .await
            .unwrap();
        store.add_lease("done", 1).await.unwrap();
        store.add_lease("broken", 1).await.unwrap();
        store.add_lease("gone", 1).await.unwrap();

        let sweep = sweep_expired_leases(&store, 10, &config(3)).await.unwrap();

        assert_eq!(sweep.skipped, 3);
        assert_eq!(store.get_queued_length().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_recovery_restores_lease() {
        let connector = MemoryConnector::new(5, Duration::from_millis(10));
        let store = connector.handle();
        store.set_job("a", &job("a", JobState::Running, 0)).await.unwrap();
        store.set_job("b", &job("b", JobState::Running, 0)).await.unwrap();
        store.add_lease("a", 5).await.unwrap();
        store.add_lease("b", 5).await.unwrap();
        connector.poison_key("a");

        assert!(sweep_expired_leases(&store, 10, &config(3)).await.is_err());
        assert_eq!(connector.lease_of("a"), Some(10));
        assert!(connector.lease_of("b").is_none());
        assert_eq!(connector.queued_keys(2), vec!["b".to_string()]);
        let stored = store.get_job("b").await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Waiting);

        connector.clear_poison("a");
        let sweep = sweep_expired_leases(&store, 10, &config(3)).await.unwrap();
        assert_eq!(sweep.requeued, 1);
        assert_eq!(connector.queued_keys(2), vec!["b".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn test_expired_promoted_job_is_requeued() {
        let connector = MemoryConnector::new(5, Duration::from_millis(10));
        let store = connector.handle();
        store.set_job("a", &job("a", JobState::Scheduled, 0)).await.unwrap();
        store.add_lease("a", 1).await.unwrap();

        let sweep = sweep_expired_leases(&store, 10, &config(3)).await.unwrap();

        assert_eq!(sweep.requeued, 1);
        assert_eq!(connector.queued_keys(2), vec!["a".to_string()]);
        let stored = store.get_job("a").await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Waiting);
        assert_eq!(stored.attempts, 1);
    }
}
