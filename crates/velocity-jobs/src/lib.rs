//! Velocity Jobs - Priority Job Queue and Worker Pool
//!
//! A store-backed job system with:
//! - Strict-priority FIFO queues (at least 5 levels)
//! - Delayed jobs promoted into their queue once due
//! - A supervised pool of single-job workers driven by `start`/`stop` commands
//! - Crash detection with same-slot respawn
//! - Lease-based recovery of jobs abandoned by crashed workers
//! - Periodic throughput stats written to the store and the `metrics` facade
//! - Redis and in-memory store backends behind one trait
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Velocity Jobs Architecture                      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  Producer ──► JobScheduler::schedule_job                         │
//! │                     │                                            │
//! │          due_time = 0 │ due_time > 0                             │
//! │                     ▼                                            │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │                  JobStore (Redis / memory)               │    │
//! │  │  ┌─────────┐ ┌─────────┐       ┌─────────┐               │    │
//! │  │  │ queue/1 │ │ queue/2 │  ...  │ queue/N │               │    │
//! │  │  └────▲────┘ └────▲────┘       └────▲────┘               │    │
//! │  │       └──── promotion (per tick) ───┘                    │    │
//! │  │  ┌──────────────────┐  ┌────────┐  ┌───────┐             │    │
//! │  │  │  delayed set     │  │ leases │  │ stats │             │    │
//! │  │  └──────────────────┘  └────────┘  └───────┘             │    │
//! │  └─────────────────────────────────────────────────────────┘    │
//! │                           │ pop                                  │
//! │                           ▼                                      │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │                    JobManager                            │    │
//! │  │  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐    │    │
//! │  │  │ Worker 0 │ │ Worker 1 │ │ Worker 2 │ │ Worker N │    │    │
//! │  │  └──────────┘ └──────────┘ └──────────┘ └──────────┘    │    │
//! │  │     start/stop ▲        │ online/idle/completed/         │    │
//! │  │                │        ▼ failed/stopped                 │    │
//! │  │            supervisor task (tick, wake, sweep, flush)    │    │
//! │  └─────────────────────────────────────────────────────────┘    │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use velocity_jobs::{
//!     JobManager, JobOutcome, JobScheduler, JobsConfig, MemoryConnector, NewJob, RunnerRegistry,
//! };
//!
//! let config = JobsConfig::default();
//! let connector = Arc::new(MemoryConnector::new(
//!     config.manager.priority_levels(),
//!     config.manager.pop_timeout(),
//! ));
//!
//! let mut runners = RunnerRegistry::new();
//! runners.register("echo", |job| async move { Ok(JobOutcome::complete(job.data)) });
//!
//! let manager = JobManager::new(config, connector.clone(), runners);
//! manager.start().await?;
//!
//! let scheduler = JobScheduler::connect(connector.as_ref()).await?;
//! scheduler.schedule_job(NewJob::new("echo").data("hi"), 0).await?;
//!
//! manager.stop();
//! manager.wait_stopped().await?;
//! ```

pub mod config;
pub mod error;
pub mod job;
pub mod lease;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod redis;
pub mod runner;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod worker;

pub use config::{JobsConfig, LeaseConfig, ManagerConfig, RedisConfig};
pub use error::{JobError, JobResult};
pub use job::{Job, JobOutcome, JobState, NewJob};
pub use lease::{sweep_expired_leases, LeaseSweep};
pub use manager::{JobManager, ManagerPhase, ManagerSnapshot, WorkerState};
pub use memory::{MemoryConnector, MemoryJobStore};
pub use self::metrics::{register_metrics, JobMetrics, ManagerMetrics};
pub use self::redis::{RedisConnector, RedisJobStore, RedisKeys};
pub use runner::{RunFn, RunnerRegistry};
pub use scheduler::{promote_due, JobScheduler};
pub use stats::JobStats;
pub use store::{JobStore, ScheduleEntry, StoreConnector};
pub use worker::{JobWorker, WorkerCommand, WorkerEvent, WorkerId, WorkerMessage};

/// Re-export commonly used items
pub mod prelude {
    pub use crate::job::{Job, JobOutcome, JobState, NewJob};
    pub use crate::manager::JobManager;
    pub use crate::runner::RunnerRegistry;
    pub use crate::scheduler::JobScheduler;
    pub use crate::store::{JobStore, StoreConnector};
    pub use crate::{JobError, JobResult};
}
