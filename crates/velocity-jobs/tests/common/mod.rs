//! Common test infrastructure for job manager integration tests.

#![allow(dead_code)]

pub mod redis;

use std::sync::Arc;
use std::time::Duration;
use velocity_jobs::{
    Job, JobManager, JobOutcome, JobScheduler, JobState, JobStore, JobsConfig, LeaseConfig,
    ManagerConfig, ManagerSnapshot, MemoryConnector, MemoryJobStore, RunnerRegistry,
};

/// How long any single wait in these tests may take.
pub const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Manager configuration with intervals short enough for tests.
pub fn fast_config(max_workers: usize) -> JobsConfig {
    JobsConfig {
        manager: ManagerConfig {
            max_workers,
            poll_interval_ms: 20,
            pop_timeout_ms: 20,
            ..ManagerConfig::default()
        },
        lease: LeaseConfig {
            duration_ms: 60_000,
            ..LeaseConfig::default()
        },
        ..JobsConfig::default()
    }
}

/// Run functions shared by most tests.
pub fn default_runners() -> RunnerRegistry {
    let mut runners = RunnerRegistry::new();
    runners
        .register("echo", |job: Job| async move { Ok(JobOutcome::complete(job.data)) })
        .register("boom", |_job: Job| async move { Ok(JobOutcome::fail("boom")) });
    runners
}

/// An in-memory store plus a manager and a producer-side scheduler on it.
pub struct TestPool {
    pub connector: Arc<MemoryConnector>,
    pub manager: JobManager,
    pub scheduler: JobScheduler,
}

impl TestPool {
    /// Creates a pool without starting the manager.
    pub async fn new(config: JobsConfig, runners: RunnerRegistry) -> Self {
        let connector = Arc::new(MemoryConnector::new(
            config.manager.priority_levels(),
            config.manager.pop_timeout(),
        ));
        let scheduler = JobScheduler::connect(connector.as_ref())
            .await
            .expect("Failed to connect scheduler");
        let manager = JobManager::new(config, connector.clone(), runners);

        Self {
            connector,
            manager,
            scheduler,
        }
    }

    /// Creates a pool and starts the manager.
    pub async fn started(config: JobsConfig, runners: RunnerRegistry) -> Self {
        let pool = Self::new(config, runners).await;
        pool.manager.start().await.expect("Failed to start manager");
        pool
    }

    /// A direct handle on the shared store.
    pub fn store(&self) -> MemoryJobStore {
        self.connector.handle()
    }

    /// Waits until a snapshot satisfies `condition`.
    pub async fn wait_for<F>(&self, condition: F) -> ManagerSnapshot
    where
        F: FnMut(&ManagerSnapshot) -> bool,
    {
        let mut rx = self.manager.subscribe();
        let snapshot = tokio::time::timeout(WAIT_LIMIT, rx.wait_for(condition))
            .await
            .expect("Timed out waiting for manager state")
            .expect("Manager state channel closed");
        snapshot.clone()
    }

    /// Polls the store until the job reaches a terminal state.
    pub async fn wait_for_job(&self, key: &str) -> Job {
        let store = self.store();
        tokio::time::timeout(WAIT_LIMIT, async {
            loop {
                if let Some(job) = store.get_job(key).await.expect("Failed to read job") {
                    if job.state.is_terminal() {
                        return job;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("Timed out waiting for job to finish")
    }

    /// Stops the manager and waits for the drain to finish.
    pub async fn shutdown(&self) {
        self.manager.stop();
        tokio::time::timeout(WAIT_LIMIT, self.manager.wait_stopped())
            .await
            .expect("Timed out waiting for manager to stop")
            .expect("Manager failed to stop");
    }
}

/// Asserts a job finished complete with the given result.
pub fn assert_completed_with(job: &Job, expected: serde_json::Value) {
    match &job.state {
        JobState::Complete { result } => assert_eq!(result.as_ref(), Some(&expected)),
        other => panic!("expected complete, got {other:?}"),
    }
}
