//! Run function registry.

use crate::error::JobResult;
use crate::job::{Job, JobOutcome};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// A run function: receives the job, resolves to what should happen to it.
pub type RunFn = Arc<dyn Fn(Job) -> BoxFuture<'static, JobResult<JobOutcome>> + Send + Sync>;

/// Maps job types to run functions.
///
/// Filled before the manager starts and shared read-only with every worker.
///
/// # Example
///
/// ```rust
/// use velocity_jobs::{JobOutcome, RunnerRegistry};
///
/// let mut runners = RunnerRegistry::new();
/// runners.register("echo", |job| async move { Ok(JobOutcome::complete(job.data)) });
/// assert!(runners.contains("echo"));
/// ```
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: HashMap<String, RunFn>,
}

impl RunnerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the run function for a job type, replacing any previous one.
    pub fn register<F, Fut>(&mut self, job_type: impl Into<String>, run: F) -> &mut Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult<JobOutcome>> + Send + 'static,
    {
        let job_type = job_type.into();
        let run_fn: RunFn = Arc::new(move |job| Box::pin(run(job)));
        info!(job_type = %job_type, "Registered run function");
        self.runners.insert(job_type, run_fn);
        self
    }

    /// Look up the run function for a job type.
    pub fn resolve(&self, job_type: &str) -> Option<RunFn> {
        self.runners.get(job_type).cloned()
    }

    /// Check if a job type has a run function.
    pub fn contains(&self, job_type: &str) -> bool {
        self.runners.contains_key(job_type)
    }

    /// Registered job types.
    pub fn job_types(&self) -> Vec<&str> {
        self.runners.keys().map(String::as_str).collect()
    }

    /// Number of registered run functions.
    pub fn len(&self) -> usize {
        self.runners.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}

impl fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut job_types = self.job_types();
        job_types.sort_unstable();
        f.debug_struct("RunnerRegistry")
            .field("job_types", &job_types)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use serde_json::json;

    fn job() -> Job {
        Job {
            key: "jobs/echo/1".into(),
            job_type: "echo".into(),
            priority: 1,
            data: json!("hi"),
            state: JobState::Running,
            attempts: 0,
        }
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let mut runners = RunnerRegistry::new();
        runners.register("echo", |job| async move { Ok(JobOutcome::complete(job.data)) });

        let run = runners.resolve("echo").unwrap();
        let outcome = run(job()).await.unwrap();
        assert_eq!(outcome, JobOutcome::complete("hi"));
        assert!(runners.resolve("resize").is_none());
    }

    #[test]
    fn test_register_replaces() {
        let mut runners = RunnerRegistry::new();
        runners
            .register("echo", |_| async { Ok(JobOutcome::done()) })
            .register("echo", |_| async { Ok(JobOutcome::fail("nope")) });

        assert_eq!(runners.len(), 1);
        assert_eq!(format!("{:?}", runners), r#"RunnerRegistry { job_types: ["echo"] }"#);
    }
}
