//! Aggregate throughput statistics flushed by the manager.

use serde::{Deserialize, Serialize};

/// Stats snapshot emitted once per manager tick.
///
/// `completed_jobs` and `failed_jobs` count events since the previous flush.
/// Worker counts are gauges that carry over between flushes; queue depths
/// and the scheduled count are sampled from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    /// Workers that reported readiness and have not stopped or crashed.
    pub live_workers: u32,
    /// Live workers waiting for a `start` command.
    pub idle_workers: u32,
    /// Jobs completed since the last flush.
    pub completed_jobs: u64,
    /// Jobs failed since the last flush.
    pub failed_jobs: u64,
    /// Depth of each priority queue, index 0 being priority 1.
    pub job_queues: Vec<u64>,
    /// Entries waiting in the delayed set.
    pub scheduled_jobs: u64,
}

impl JobStats {
    /// Creates an empty snapshot for `priority_levels` queues.
    pub fn new(priority_levels: u32) -> Self {
        Self {
            job_queues: vec![0; priority_levels as usize],
            ..Self::default()
        }
    }

    /// Total queued jobs across priorities.
    pub fn queued_jobs(&self) -> u64 {
        self.job_queues.iter().sum()
    }

    /// Zeroes the per-window counters after a flush.
    pub fn reset_window(&mut self) {
        self.completed_jobs = 0;
        self.failed_jobs = 0;
    }

    /// Flattens the snapshot into stream entry fields.
    pub fn to_fields(&self, timestamp: i64) -> Vec<(&'static str, String)> {
        let queues = self
            .job_queues
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(",");

        vec![
            ("liveWorkers", self.live_workers.to_string()),
            ("idleWorkers", self.idle_workers.to_string()),
            ("completedJobs", self.completed_jobs.to_string()),
            ("failedJobs", self.failed_jobs.to_string()),
            ("jobQueues", queues),
            ("scheduledJobs", self.scheduled_jobs.to_string()),
            ("timestamp", timestamp.to_string()),
        ]
    }
}
