//! Single-job-at-a-time workers and their command protocol.
//!
//! A worker is a tokio task with its own store connection. The manager talks
//! to it through two commands ([`WorkerCommand`]); the worker answers with
//! exactly one [`WorkerMessage`] per pull cycle on a shared event channel.

use crate::config::LeaseConfig;
use crate::error::{JobError, JobResult};
use crate::job::{now_millis, Job, JobOutcome, JobState, NewJob};
use crate::metrics::JobMetrics;
use crate::runner::{RunFn, RunnerRegistry};
use crate::scheduler::JobScheduler;
use crate::store::StoreConnector;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Command sent by the manager to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Pull and run jobs until the queues are empty.
    Start,
    /// Finish the current job, release the connection and exit.
    Stop,
}

/// Status message sent by a worker to the manager.
///
/// A pulled job that ends without a terminal write sends nothing of its own:
/// reschedules, keys without a record and jobs already finished. The worker
/// keeps pulling, so the cycle still closes with `Idle` or the next job's
/// `Completed`/`Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMessage {
    /// Connected and ready.
    Online,
    /// Found no job and waits for the next `start`.
    Idle,
    /// Ran a job to completion.
    Completed,
    /// Ran a job that failed.
    Failed,
    /// Drained and about to exit.
    Stopped,
}

/// Pool slot plus spawn generation.
///
/// The generation tells a replacement apart from the worker it replaced, so
/// late events from a crashed worker are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId {
    /// Pool index.
    pub index: usize,
    /// Spawn counter, unique per manager.
    pub generation: u64,
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}.{}", self.index, self.generation)
    }
}

/// Event delivered to the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A protocol message from a running worker.
    Message {
        worker: WorkerId,
        message: WorkerMessage,
    },
    /// The worker task ended. `error` is set when it faulted or panicked.
    Exited {
        worker: WorkerId,
        error: Option<String>,
    },
}

/// Manager-side handle on a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    abort: AbortHandle,
}

impl WorkerHandle {
    /// The worker's id.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Send a command. Returns false if the worker is gone.
    pub fn send(&self, command: WorkerCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Tear down the task once it has acknowledged `stop`.
    pub fn terminate(&self) {
        self.abort.abort();
    }
}

/// A handle with no worker behind it, for driving the manager in tests.
#[cfg(test)]
pub(crate) fn detached_handle(id: WorkerId) -> (WorkerHandle, mpsc::UnboundedReceiver<WorkerCommand>) {
    let (commands, rx) = mpsc::unbounded_channel();
    let abort = tokio::spawn(async {}).abort_handle();
    (WorkerHandle { id, commands, abort }, rx)
}

/// Everything a worker needs besides its id.
#[derive(Clone)]
pub struct WorkerContext {
    /// Opens the worker's private store connection.
    pub connector: Arc<dyn StoreConnector>,
    /// Run functions by job type.
    pub runners: Arc<RunnerRegistry>,
    /// Lease settings.
    pub lease: LeaseConfig,
    /// Where protocol messages and exit notifications go.
    pub events: mpsc::UnboundedSender<WorkerEvent>,
}

/// Spawn a worker task and a watcher that reports how it ended.
pub fn spawn_worker(id: WorkerId, ctx: WorkerContext) -> WorkerHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let events = ctx.events.clone();

    let task = tokio::spawn(
        async move {
            let scheduler = JobScheduler::connect(ctx.connector.as_ref()).await?;
            JobWorker::new(id, scheduler, ctx.runners, ctx.lease, commands_rx, ctx.events)
                .run()
                .await
        }
        .instrument(tracing::info_span!(
            "worker",
            index = id.index,
            generation = id.generation
        )),
    );
    let abort = task.abort_handle();

    tokio::spawn(async move {
        let error = match task.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) if e.is_cancelled() => None,
            Err(e) => Some(format!("worker task panicked: {}", e)),
        };
        let _ = events.send(WorkerEvent::Exited { worker: id, error });
    });

    WorkerHandle {
        id,
        commands: commands_tx,
        abort,
    }
}

/// Pulls jobs, runs them and reports the outcome.
///
/// Holds a [`JobScheduler`] for rescheduling rather than being one.
pub struct JobWorker {
    id: WorkerId,
    scheduler: JobScheduler,
    runners: Arc<RunnerRegistry>,
    /// Run functions resolved so far, including misses.
    resolved: HashMap<String, Option<RunFn>>,
    lease: LeaseConfig,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    stopping: bool,
}

impl JobWorker {
    /// Create a worker over an open scheduler connection.
    pub fn new(
        id: WorkerId,
        scheduler: JobScheduler,
        runners: Arc<RunnerRegistry>,
        lease: LeaseConfig,
        commands: mpsc::UnboundedReceiver<WorkerCommand>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            id,
            scheduler,
            runners,
            resolved: HashMap::new(),
            lease,
            commands,
            events,
            stopping: false,
        }
    }

    /// Worker main loop.
    ///
    /// Announces readiness, runs one pull cycle on its own, then serves
    /// commands until `stop`. A store error ends the loop with `Err`, which
    /// the manager treats as a crash.
    pub async fn run(mut self) -> JobResult<()> {
        self.emit(WorkerMessage::Online);
        debug!(worker = %self.id, "Worker online");

        if let Err(e) = self.serve().await {
            error!(worker = %self.id, error = %e, "Worker loop failed");
            let _ = self.scheduler.end().await;
            return Err(e);
        }

        if let Err(e) = self.scheduler.end().await {
            warn!(worker = %self.id, error = %e, "Failed to close worker connection");
        }
        info!(worker = %self.id, "Worker stopped");
        self.emit(WorkerMessage::Stopped);
        Ok(())
    }

    async fn serve(&mut self) -> JobResult<()> {
        self.drain_queue().await?;

        while !self.stopping {
            match self.commands.recv().await {
                Some(WorkerCommand::Start) => self.drain_queue().await?,
                Some(WorkerCommand::Stop) | None => self.stopping = true,
            }
        }

        Ok(())
    }

    /// Pull-and-run until no job is found or a stop is pending.
    async fn drain_queue(&mut self) -> JobResult<()> {
        loop {
            self.poll_commands();
            if self.stopping {
                return Ok(());
            }

            let Some(key) = self.get_job().await? else {
                self.emit(WorkerMessage::Idle);
                return Ok(());
            };

            if let Some(message) = self.run_job(&key).await? {
                self.emit(message);
            }
        }
    }

    /// Picks up a stop that arrived while busy.
    fn poll_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(WorkerCommand::Start) => {}
                Ok(WorkerCommand::Stop) | Err(TryRecvError::Disconnected) => {
                    self.stopping = true;
                    return;
                }
                Err(TryRecvError::Empty) => return,
            }
        }
    }

    /// Pop the next job key.
    async fn get_job(&self) -> JobResult<Option<String>> {
        self.scheduler.store().get_next_in_queue().await
    }

    /// Run one dequeued job and persist what its run function decided.
    ///
    /// Returns the message to report, or `None` when the job was
    /// rescheduled or could not be run.
    pub async fn run_job(&mut self, key: &str) -> JobResult<Option<WorkerMessage>> {
        let Some(mut job) = self.scheduler.store().get_job(key).await? else {
            warn!(job_key = %key, "Dequeued key has no job record");
            return Ok(None);
        };

        if job.state.is_terminal() {
            debug!(job_key = %key, state = %job.state, "Skipping finished job");
            return Ok(None);
        }

        if self.lease.enabled {
            let expires_at = now_millis().saturating_add(self.lease.duration_ms as i64);
            self.scheduler.store().add_lease(key, expires_at).await?;
        }
        job.state = JobState::Running;
        self.scheduler.store().set_job(key, &job).await?;

        debug!(job_key = %key, job_type = %job.job_type, "Running job");
        let started = Instant::now();
        let outcome = self.execute(&job).await;
        let elapsed = started.elapsed();

        let message = match outcome {
            JobOutcome::Complete { result } => {
                job.complete(result);
                self.scheduler.store().set_job(key, &job).await?;
                JobMetrics::job_completed(&job.job_type, elapsed);
                debug!(job_key = %key, elapsed_ms = elapsed.as_millis() as u64, "Job completed");
                Some(WorkerMessage::Completed)
            }
            JobOutcome::Fail { error } => {
                warn!(job_key = %key, error = ?error, "Job failed");
                job.fail(error);
                self.scheduler.store().set_job(key, &job).await?;
                JobMetrics::job_failed(&job.job_type, elapsed);
                Some(WorkerMessage::Failed)
            }
            JobOutcome::Reschedule { time } => {
                let job_type = job.job_type.clone();
                self.scheduler.schedule_job(NewJob::from(job), time).await?;
                JobMetrics::job_rescheduled(&job_type, elapsed);
                debug!(job_key = %key, due_time = time, "Job rescheduled");
                None
            }
        };

        if self.lease.enabled {
            self.scheduler.store().remove_lease(key).await?;
        }

        Ok(message)
    }

    /// Invoke the run function, turning every failure into a `fail` outcome.
    async fn execute(&mut self, job: &Job) -> JobOutcome {
        let Some(run) = self.runner_for(&job.job_type) else {
            return JobOutcome::fail(JobError::UnknownJobType(job.job_type.clone()).to_string());
        };

        let input = job.clone();
        let call = async move { run(input).await };

        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => JobOutcome::fail(e.to_string()),
            Err(panic) => {
                error!(job_key = %job.key, "Run function panicked");
                JobOutcome::fail(format!("run function panicked: {}", panic_message(&*panic)))
            }
        }
    }

    /// Resolve a run function, once per type for the worker's lifetime.
    fn runner_for(&mut self, job_type: &str) -> Option<RunFn> {
        if let Some(cached) = self.resolved.get(job_type) {
            return cached.clone();
        }
        let run = self.runners.resolve(job_type);
        if run.is_none() {
            warn!(job_type = %job_type, "No run function registered");
        }
        self.resolved.insert(job_type.to_string(), run.clone());
        run
    }

    fn emit(&self, message: WorkerMessage) {
        let _ = self.events.send(WorkerEvent::Message {
            worker: self.id,
            message,
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
