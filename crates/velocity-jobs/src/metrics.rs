//! Prometheus-style metrics for the job system.
//!
//! Emitted through the `metrics` facade alongside the stats snapshots the
//! manager writes to the store. Install any recorder to collect them.

use crate::stats::JobStats;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names for the job system.
pub mod names {
    /// Total jobs written by the scheduler.
    pub const JOBS_SCHEDULED_TOTAL: &str = "velocity_jobs_scheduled_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "velocity_jobs_completed_total";
    /// Total jobs failed.
    pub const JOBS_FAILED_TOTAL: &str = "velocity_jobs_failed_total";
    /// Total jobs rescheduled by their run function.
    pub const JOBS_RESCHEDULED_TOTAL: &str = "velocity_jobs_rescheduled_total";
    /// Total delayed jobs promoted into a priority queue.
    pub const JOBS_PROMOTED_TOTAL: &str = "velocity_jobs_promoted_total";
    /// Total jobs recovered from an expired lease.
    pub const LEASES_RECOVERED_TOTAL: &str = "velocity_jobs_leases_recovered_total";

    /// Current depth of a priority queue.
    pub const QUEUE_DEPTH: &str = "velocity_jobs_queue_depth";
    /// Current number of delayed jobs.
    pub const JOBS_DELAYED: &str = "velocity_jobs_delayed";

    /// Run function duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "velocity_job_duration_seconds";

    /// Live workers.
    pub const WORKERS_LIVE: &str = "velocity_workers_live";
    /// Idle workers.
    pub const WORKERS_IDLE: &str = "velocity_workers_idle";
    /// Total worker restarts after a crash.
    pub const WORKER_RESTARTS_TOTAL: &str = "velocity_worker_restarts_total";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    // Job counters
    describe_counter!(
        names::JOBS_SCHEDULED_TOTAL,
        "Total number of jobs scheduled"
    );
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(
        names::JOBS_FAILED_TOTAL,
        "Total number of jobs that failed"
    );
    describe_counter!(
        names::JOBS_RESCHEDULED_TOTAL,
        "Total number of jobs rescheduled by their run function"
    );
    describe_counter!(
        names::JOBS_PROMOTED_TOTAL,
        "Total number of delayed jobs promoted into a priority queue"
    );
    describe_counter!(
        names::LEASES_RECOVERED_TOTAL,
        "Total number of jobs recovered from an expired lease"
    );

    // Queue gauges
    describe_gauge!(
        names::QUEUE_DEPTH,
        "Current number of jobs waiting in a priority queue"
    );
    describe_gauge!(
        names::JOBS_DELAYED,
        "Current number of delayed jobs"
    );

    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Run function duration in seconds"
    );

    // Worker metrics
    describe_gauge!(
        names::WORKERS_LIVE,
        "Number of live workers"
    );
    describe_gauge!(
        names::WORKERS_IDLE,
        "Number of idle workers"
    );
    describe_counter!(
        names::WORKER_RESTARTS_TOTAL,
        "Total number of workers respawned after a crash"
    );
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job written by the scheduler.
    pub fn job_scheduled(job_type: &str, priority: u32, delayed: bool) {
        counter!(
            names::JOBS_SCHEDULED_TOTAL,
            "job_type" => job_type.to_string(),
            "priority" => priority.to_string(),
            "delayed" => delayed.to_string()
        )
        .increment(1);
    }

    /// Record a job completed.
    pub fn job_completed(job_type: &str, duration: Duration) {
        counter!(
            names::JOBS_COMPLETED_TOTAL,
            "job_type" => job_type.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "job_type" => job_type.to_string(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job failed.
    pub fn job_failed(job_type: &str, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "job_type" => job_type.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "job_type" => job_type.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job rescheduled by its run function.
    pub fn job_rescheduled(job_type: &str, duration: Duration) {
        counter!(
            names::JOBS_RESCHEDULED_TOTAL,
            "job_type" => job_type.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "job_type" => job_type.to_string(),
            "status" => "rescheduled"
        )
        .record(duration.as_secs_f64());
    }

    /// Record delayed jobs promoted into a priority queue.
    pub fn jobs_promoted(priority: u32, count: usize) {
        counter!(
            names::JOBS_PROMOTED_TOTAL,
            "priority" => priority.to_string()
        )
        .increment(count as u64);
    }

    /// Record a job recovered from an expired lease.
    pub fn lease_recovered(outcome: &'static str) {
        counter!(
            names::LEASES_RECOVERED_TOTAL,
            "outcome" => outcome
        )
        .increment(1);
    }
}

/// Manager metrics recorder.
#[derive(Clone)]
pub struct ManagerMetrics;

impl ManagerMetrics {
    /// Publish the gauges carried by a stats snapshot.
    pub fn record_stats(stats: &JobStats) {
        for (index, depth) in stats.job_queues.iter().enumerate() {
            gauge!(
                names::QUEUE_DEPTH,
                "priority" => (index + 1).to_string()
            )
            .set(*depth as f64);
        }

        gauge!(names::JOBS_DELAYED).set(stats.scheduled_jobs as f64);
        gauge!(names::WORKERS_LIVE).set(stats.live_workers as f64);
        gauge!(names::WORKERS_IDLE).set(stats.idle_workers as f64);
    }

    /// Record a worker respawned after a crash.
    pub fn worker_restarted() {
        counter!(names::WORKER_RESTARTS_TOTAL).increment(1);
    }
}
