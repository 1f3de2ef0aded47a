//! Run functions shipped with the worker host.

use serde::Deserialize;
use std::time::Duration;
use velocity_jobs::{Job, JobOutcome, JobResult, RunnerRegistry};

/// Registry holding every built-in run function.
pub fn builtin_runners() -> RunnerRegistry {
    let mut runners = RunnerRegistry::new();
    runners.register("echo", echo).register("sleep", sleep);
    runners
}

/// Completes with the job's data as its result.
pub async fn echo(job: Job) -> JobResult<JobOutcome> {
    Ok(JobOutcome::complete(job.data))
}

#[derive(Debug, Deserialize)]
struct SleepInput {
    ms: u64,
}

/// Waits `data.ms` milliseconds, then completes without a result.
pub async fn sleep(job: Job) -> JobResult<JobOutcome> {
    let input: SleepInput = serde_json::from_value(job.data)?;
    tokio::time::sleep(Duration::from_millis(input.ms)).await;
    Ok(JobOutcome::done())
}
