//! Integration tests for delayed jobs, priorities and rescheduling.

mod common;

use common::{assert_completed_with, default_runners, fast_config, TestPool};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use velocity_jobs::job::now_millis;
use velocity_jobs::{Job, JobOutcome, JobState, JobStore, NewJob, RunnerRegistry};

#[tokio::test]
async fn test_delayed_job_waits_for_promotion() {
    let pool = TestPool::new(fast_config(1), default_runners()).await;
    let store = pool.store();

    let due = now_millis() + 5_000;
    let key = pool
        .scheduler
        .schedule_job(NewJob::new("echo").data("later"), due)
        .await
        .expect("Failed to schedule job");

    assert_eq!(store.get_queued_length().await.unwrap(), 0);
    assert_eq!(store.get_scheduled_length().await.unwrap(), 1);
    let job = store.get_job(&key).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Scheduled);

    // Not yet due.
    assert_eq!(pool.manager.promote_until(due - 1).await.unwrap(), 0);
    assert_eq!(store.get_scheduled_length().await.unwrap(), 1);

    assert_eq!(pool.manager.promote_until(due).await.unwrap(), 1);
    assert_eq!(store.get_scheduled_length().await.unwrap(), 0);
    assert_eq!(pool.connector.queued_keys(1), vec![key]);
}

#[tokio::test]
async fn test_delayed_job_runs_once_due() {
    let pool = TestPool::started(fast_config(1), default_runners()).await;

    let key = pool
        .scheduler
        .schedule_job(NewJob::new("echo").data("soon"), now_millis() + 100)
        .await
        .expect("Failed to schedule job");

    let job = pool.wait_for_job(&key).await;
    assert_completed_with(&job, json!("soon"));
    assert_eq!(pool.store().get_scheduled_length().await.unwrap(), 0);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_higher_priority_jobs_run_first() {
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut runners = RunnerRegistry::new();
    {
        let order = Arc::clone(&order);
        runners.register("record", move |job: Job| {
            let order = Arc::clone(&order);
            async move {
                order.lock().push(job.data.clone());
                Ok(JobOutcome::done())
            }
        });
    }

    let pool = TestPool::new(fast_config(1), runners).await;
    let mut keys = Vec::new();
    for (name, priority) in [("low", 3), ("first", 1), ("second", 1), ("mid", 2)] {
        let key = pool
            .scheduler
            .schedule_job(NewJob::new("record").priority(priority).data(name), 0)
            .await
            .expect("Failed to schedule job");
        keys.push(key);
    }

    pool.manager.start().await.expect("Failed to start manager");
    for key in &keys {
        pool.wait_for_job(key).await;
    }

    assert_eq!(
        *order.lock(),
        vec![json!("first"), json!("second"), json!("mid"), json!("low")]
    );

    pool.shutdown().await;
}

#[tokio::test]
async fn test_rescheduled_job_runs_again() {
    let calls = Arc::new(AtomicUsize::new(0));

    let mut runners = RunnerRegistry::new();
    {
        let calls = Arc::clone(&calls);
        runners.register("twice", move |_job: Job| {
            let calls = Arc::clone(&calls);
            async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Ok(JobOutcome::reschedule_in(Duration::from_millis(50))),
                    n => Ok(JobOutcome::complete(n + 1)),
                }
            }
        });
    }

    let pool = TestPool::started(fast_config(1), runners).await;

    let key = pool
        .scheduler
        .schedule_job(NewJob::new("twice").key("jobs/twice/one"), 0)
        .await
        .expect("Failed to schedule job");

    let job = pool.wait_for_job(&key).await;
    assert_eq!(job.key, "jobs/twice/one");
    assert_completed_with(&job, json!(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // A reschedule is neither a completion nor a failure.
    let snapshot = pool.wait_for(|s| s.completed_total == 1).await;
    assert_eq!(snapshot.failed_total, 0);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_unknown_job_type_fails_the_job() {
    let pool = TestPool::started(fast_config(1), default_runners()).await;

    let key = pool
        .scheduler
        .schedule_job(NewJob::new("nobody-runs-this"), 0)
        .await
        .expect("Failed to schedule job");

    let job = pool.wait_for_job(&key).await;
    assert_eq!(
        job.error(),
        Some(&json!("no run function registered for job type nobody-runs-this"))
    );

    pool.wait_for(|s| s.failed_total == 1).await;
    pool.shutdown().await;
}

#[tokio::test]
async fn test_panicking_run_function_fails_the_job() {
    let mut runners = default_runners();
    runners.register("panics", |_job: Job| async move {
        if true {
            panic!("kaboom");
        }
        Ok(JobOutcome::done())
    });

    let pool = TestPool::started(fast_config(1), runners).await;

    let key = pool
        .scheduler
        .schedule_job(NewJob::new("panics"), 0)
        .await
        .expect("Failed to schedule job");

    let job = pool.wait_for_job(&key).await;
    assert_eq!(job.error(), Some(&json!("run function panicked: kaboom")));

    // The worker survives a panicking run function.
    let snapshot = pool.wait_for(|s| s.failed_total == 1).await;
    assert_eq!(snapshot.restarts, 0);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_scheduling_same_key_overwrites_record() {
    let pool = TestPool::new(fast_config(1), default_runners()).await;
    let store = pool.store();

    for data in ["one", "two"] {
        pool.scheduler
            .schedule_job(NewJob::new("echo").key("jobs/echo/same").data(data), 0)
            .await
            .expect("Failed to schedule job");
    }

    let job = store.get_job("jobs/echo/same").await.unwrap().unwrap();
    assert_eq!(job.data, json!("two"));
    // Both schedules were queued under one record.
    assert_eq!(store.get_queued_length().await.unwrap(), 2);
}
