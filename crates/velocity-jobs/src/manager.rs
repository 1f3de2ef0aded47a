//! Worker pool supervision.
//!
//! [`JobManager`] is a handle; the pool itself is driven by a single
//! supervisor task that owns every worker handle, the manager's store
//! connection and the stats accumulator. The handle talks to it over a
//! control channel and observes it through a `watch` snapshot.

use crate::config::JobsConfig;
use crate::error::{JobError, JobResult};
use crate::job::now_millis;
use crate::lease::sweep_expired_leases;
use crate::metrics::ManagerMetrics;
use crate::runner::RunnerRegistry;
use crate::scheduler::promote_due;
use crate::stats::JobStats;
use crate::store::{JobStore, StoreConnector};
use crate::worker::{
    spawn_worker, WorkerCommand, WorkerContext, WorkerEvent, WorkerHandle, WorkerId,
    WorkerMessage,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

/// Worker run-state as tracked by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Spawned, not yet connected.
    Started,
    /// Online or processing jobs.
    Active,
    /// Waiting for a `start` command.
    Idle,
    /// Drained and gone.
    Stopped,
}

/// Manager lifecycle phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerPhase {
    /// Never started.
    #[default]
    Created,
    /// Ticking and supervising workers.
    Running,
    /// Waiting for workers to acknowledge `stop`.
    Draining,
    /// Every worker stopped and the store connection is closed.
    Stopped,
}

/// Point-in-time view of the manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManagerSnapshot {
    /// Lifecycle phase.
    pub phase: ManagerPhase,
    /// Worker state by pool index; `None` while a slot waits to be refilled.
    pub workers: Vec<Option<WorkerState>>,
    /// Stats accumulated since the last flush.
    pub stats: JobStats,
    /// Jobs completed since start.
    pub completed_total: u64,
    /// Jobs failed since start, lease failures included.
    pub failed_total: u64,
    /// Workers that crashed while the manager was active.
    pub restarts: u64,
    /// Run loop iterations.
    pub ticks: u64,
}

impl ManagerSnapshot {
    /// Whether the manager is running.
    pub fn is_active(&self) -> bool {
        self.phase == ManagerPhase::Running
    }

    /// Number of workers in a given state.
    pub fn count(&self, state: WorkerState) -> usize {
        self.workers.iter().filter(|w| **w == Some(state)).count()
    }
}

enum Control {
    Tick,
    Promote {
        until: i64,
        reply: oneshot::Sender<JobResult<usize>>,
    },
    Stop,
}

/// Supervises a fixed-size pool of workers.
///
/// # Example
///
/// ```rust,ignore
/// let connector = Arc::new(RedisConnector::new(config.redis.clone(), 5, pop_timeout));
/// let manager = JobManager::new(config, connector, runners);
/// manager.start().await?;
/// // ...
/// manager.stop();
/// manager.wait_stopped().await?;
/// ```
pub struct JobManager {
    config: JobsConfig,
    connector: Arc<dyn StoreConnector>,
    runners: Arc<RunnerRegistry>,
    started: AtomicBool,
    control: Mutex<Option<mpsc::UnboundedSender<Control>>>,
    snapshot: Arc<watch::Sender<ManagerSnapshot>>,
}

impl JobManager {
    /// Create a manager. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: JobsConfig,
        connector: Arc<dyn StoreConnector>,
        runners: RunnerRegistry,
    ) -> Self {
        let (snapshot, _) = watch::channel(ManagerSnapshot::default());

        Self {
            config,
            connector,
            runners: Arc::new(runners),
            started: AtomicBool::new(false),
            control: Mutex::new(None),
            snapshot: Arc::new(snapshot),
        }
    }

    /// The manager's configuration.
    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    /// Connect, fill the pool and start the run loop.
    ///
    /// A manager runs once; starting it again is an error.
    pub async fn start(&self) -> JobResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(JobError::Manager("job manager already started".to_string()));
        }

        let result = self.launch().await;
        if result.is_err() {
            self.started.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn launch(&self) -> JobResult<()> {
        self.config.validate()?;

        let priority_levels = self.config.manager.priority_levels();
        if self.connector.priority_levels() != priority_levels {
            return Err(JobError::Configuration(format!(
                "store has {} priority queues but the manager expects {}",
                self.connector.priority_levels(),
                priority_levels
            )));
        }

        let store = self.connector.connect().await?;
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut supervisor = Supervisor {
            config: self.config.clone(),
            priority_levels,
            store,
            ctx: WorkerContext {
                connector: Arc::clone(&self.connector),
                runners: Arc::clone(&self.runners),
                lease: self.config.lease.clone(),
                events: events_tx,
            },
            events: events_rx,
            control: control_rx,
            workers: (0..self.config.manager.max_workers).map(|_| None).collect(),
            stats: JobStats::new(priority_levels),
            completed_total: 0,
            failed_total: 0,
            restarts: 0,
            ticks: 0,
            generation: 0,
            active: true,
            phase: ManagerPhase::Running,
            snapshot: Arc::clone(&self.snapshot),
        };
        supervisor.fill_pool();
        supervisor.publish();

        *self.control.lock() = Some(control_tx);

        info!(
            max_workers = self.config.manager.max_workers,
            priority_levels,
            poll_interval_ms = self.config.manager.poll_interval_ms,
            "Job manager started"
        );

        tokio::spawn(supervisor.run().instrument(tracing::info_span!("job_manager")));
        Ok(())
    }

    /// Ask every worker to stop. Returns immediately; see
    /// [`wait_stopped`](Self::wait_stopped).
    pub fn stop(&self) {
        if self.send(Control::Stop) {
            info!("Stopping job manager...");
        }
    }

    /// Run a tick now instead of waiting for the timer.
    pub fn tick_now(&self) {
        self.send(Control::Tick);
    }

    /// Promote every delayed job due at or before `until`.
    ///
    /// Runs on the supervisor while the manager is running, otherwise on a
    /// short-lived connection of its own.
    pub async fn promote_until(&self, until: i64) -> JobResult<usize> {
        if self.snapshot.borrow().is_active() {
            let (reply_tx, reply_rx) = oneshot::channel();
            if self.send(Control::Promote {
                until,
                reply: reply_tx,
            }) {
                if let Ok(result) = reply_rx.await {
                    return result;
                }
            }
        }

        let store = self.connector.connect().await?;
        let result = promote_due(store.as_ref(), until, self.config.manager.priority_levels()).await;
        if let Err(e) = store.close_connection().await {
            warn!(error = %e, "Failed to close promotion connection");
        }
        result
    }

    /// Current state of the pool.
    pub fn snapshot(&self) -> ManagerSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that sees every snapshot update.
    pub fn subscribe(&self) -> watch::Receiver<ManagerSnapshot> {
        self.snapshot.subscribe()
    }

    /// Resolve once the drain finished and the store connection is closed.
    ///
    /// Returns immediately for a manager that was never started.
    pub async fn wait_stopped(&self) -> JobResult<()> {
        let mut rx = self.snapshot.subscribe();
        let result = rx
            .wait_for(|s| matches!(s.phase, ManagerPhase::Created | ManagerPhase::Stopped))
            .await
            .map(|_| ());
        result.map_err(|_| JobError::Manager("manager state channel closed".to_string()))
    }

    fn send(&self, control: Control) -> bool {
        match self.control.lock().as_ref() {
            Some(tx) => tx.send(control).is_ok(),
            None => false,
        }
    }
}

struct WorkerSlot {
    handle: WorkerHandle,
    state: WorkerState,
}

/// Owns the pool. Runs as a single task, so nothing here needs a lock.
struct Supervisor {
    config: JobsConfig,
    priority_levels: u32,
    store: Box<dyn JobStore>,
    ctx: WorkerContext,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    control: mpsc::UnboundedReceiver<Control>,
    workers: Vec<Option<WorkerSlot>>,
    stats: JobStats,
    completed_total: u64,
    failed_total: u64,
    restarts: u64,
    ticks: u64,
    generation: u64,
    active: bool,
    phase: ManagerPhase,
    snapshot: Arc<watch::Sender<ManagerSnapshot>>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut ticker = interval(self.config.manager.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(event) = self.events.recv() => self.handle_event(event),
                control = self.control.recv() => match control {
                    Some(Control::Tick) => self.tick().await,
                    Some(Control::Promote { until, reply }) => {
                        let _ = reply.send(self.promote(until).await);
                    }
                    Some(Control::Stop) | None => break,
                },
                _ = ticker.tick() => self.tick().await,
            }
            self.publish();
        }

        self.shutdown().await;
    }

    /// One run-loop iteration.
    async fn tick(&mut self) {
        if !self.active {
            return;
        }
        self.ticks += 1;
        self.fill_pool();

        if let Err(e) = self.wake_idle_workers().await {
            warn!(error = %e, "Failed to wake idle workers");
        }

        if let Err(e) = self.promote(now_millis()).await {
            warn!(error = %e, "Failed to promote scheduled jobs");
        }

        if self.config.lease.enabled {
            match sweep_expired_leases(self.store.as_ref(), now_millis(), &self.config.lease).await {
                Ok(sweep) => {
                    self.stats.failed_jobs += sweep.failed as u64;
                    self.failed_total += sweep.failed as u64;
                }
                Err(e) => warn!(error = %e, "Failed to sweep expired leases"),
            }
        }

        if let Err(e) = self.flush_stats().await {
            warn!(error = %e, "Failed to record job stats");
        }
    }

    /// Send `start` to as many idle workers as there are queued jobs.
    async fn wake_idle_workers(&mut self) -> JobResult<usize> {
        let idle = self.count(WorkerState::Idle);
        if idle == 0 {
            return Ok(0);
        }

        let queued = self.store.get_queued_length().await?;
        let budget = queued.min(idle as u64) as usize;

        let mut woken = 0;
        for slot in self.workers.iter_mut().flatten() {
            if woken == budget {
                break;
            }
            if slot.state == WorkerState::Idle && slot.handle.send(WorkerCommand::Start) {
                slot.state = WorkerState::Active;
                woken += 1;
            }
        }

        self.stats.idle_workers = self.stats.idle_workers.saturating_sub(woken as u32);
        if woken > 0 {
            debug!(woken, queued, "Woke idle workers");
        }
        Ok(woken)
    }

    async fn promote(&self, until: i64) -> JobResult<usize> {
        promote_due(self.store.as_ref(), until, self.priority_levels).await
    }

    /// Sample queue depths, emit the snapshot and open a new window.
    async fn flush_stats(&mut self) -> JobResult<()> {
        self.stats.job_queues = self.store.queue_lengths().await?;
        self.stats.scheduled_jobs = self.store.get_scheduled_length().await?;

        self.store.record_job_stats(&self.stats).await?;
        ManagerMetrics::record_stats(&self.stats);
        self.stats.reset_window();
        Ok(())
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Message { worker, message } => self.on_message(worker, message),
            WorkerEvent::Exited {
                worker,
                error: Some(error),
            } => self.on_crash(worker, error),
            WorkerEvent::Exited { worker, error: None } => self.on_exit(worker),
        }
    }

    fn on_message(&mut self, worker: WorkerId, message: WorkerMessage) {
        let Some(slot) = find_slot(&mut self.workers, worker) else {
            debug!(worker = %worker, message = ?message, "Ignoring message from replaced worker");
            return;
        };
        let previous = slot.state;

        match message {
            WorkerMessage::Online => {
                slot.state = WorkerState::Active;
                if previous == WorkerState::Started {
                    self.stats.live_workers += 1;
                }
            }
            WorkerMessage::Idle => {
                slot.state = WorkerState::Idle;
                if previous != WorkerState::Idle {
                    self.stats.idle_workers += 1;
                }
            }
            WorkerMessage::Completed => {
                self.stats.completed_jobs += 1;
                self.completed_total += 1;
            }
            WorkerMessage::Failed => {
                self.stats.failed_jobs += 1;
                self.failed_total += 1;
            }
            WorkerMessage::Stopped => {
                slot.state = WorkerState::Stopped;
                slot.handle.terminate();
                self.release(previous);
                debug!(worker = %worker, "Worker acknowledged stop");
            }
        }
    }

    fn on_crash(&mut self, worker: WorkerId, error: String) {
        let Some(slot) = find_slot(&mut self.workers, worker) else {
            return;
        };
        let previous = slot.state;
        if previous == WorkerState::Stopped {
            return;
        }
        slot.state = WorkerState::Stopped;

        error!(worker = %worker, state = ?previous, error = %error, "Worker crashed");
        self.release(previous);

        if !self.active {
            return;
        }

        self.restarts += 1;
        ManagerMetrics::worker_restarted();

        if previous == WorkerState::Started {
            // Never came online; the store is likely down. Refill on the next tick.
            self.workers[worker.index] = None;
        } else {
            self.spawn_at(worker.index);
        }
    }

    fn on_exit(&mut self, worker: WorkerId) {
        if let Some(slot) = find_slot(&mut self.workers, worker) {
            let previous = slot.state;
            if previous != WorkerState::Stopped {
                slot.state = WorkerState::Stopped;
                self.release(previous);
            }
        }
    }

    /// Take a worker that left `previous` out of the gauges.
    fn release(&mut self, previous: WorkerState) {
        if previous == WorkerState::Idle {
            self.stats.idle_workers = self.stats.idle_workers.saturating_sub(1);
        }
        if matches!(previous, WorkerState::Active | WorkerState::Idle) {
            self.stats.live_workers = self.stats.live_workers.saturating_sub(1);
        }
    }

    fn fill_pool(&mut self) {
        for index in 0..self.workers.len() {
            if self.workers[index].is_none() {
                self.spawn_at(index);
            }
        }
    }

    fn spawn_at(&mut self, index: usize) {
        self.generation += 1;
        let id = WorkerId {
            index,
            generation: self.generation,
        };

        let handle = spawn_worker(id, self.ctx.clone());
        debug!(worker = %id, "Spawned worker");
        self.workers[index] = Some(WorkerSlot {
            handle,
            state: WorkerState::Started,
        });
    }

    fn count(&self, state: WorkerState) -> usize {
        self.workers
            .iter()
            .flatten()
            .filter(|slot| slot.state == state)
            .count()
    }

    fn all_stopped(&self) -> bool {
        self.workers
            .iter()
            .flatten()
            .all(|slot| slot.state == WorkerState::Stopped)
    }

    /// Broadcast `stop`, wait for every worker, then close the store.
    async fn shutdown(&mut self) {
        self.active = false;
        self.phase = ManagerPhase::Draining;

        for slot in self.workers.iter_mut().flatten() {
            if slot.state != WorkerState::Stopped {
                slot.handle.send(WorkerCommand::Stop);
            }
        }
        self.publish();
        info!(live_workers = self.stats.live_workers, "Draining workers");

        let mut ticker = interval(self.config.manager.drain_interval());
        while !self.all_stopped() {
            tokio::select! {
                Some(event) = self.events.recv() => {
                    self.handle_event(event);
                    self.publish();
                }
                _ = ticker.tick() => {}
            }
        }

        if let Err(e) = self.store.close_connection().await {
            warn!(error = %e, "Failed to close manager connection");
        }

        self.phase = ManagerPhase::Stopped;
        self.publish();
        info!(
            completed = self.completed_total,
            failed = self.failed_total,
            restarts = self.restarts,
            "Job manager stopped"
        );
    }

    fn publish(&self) {
        self.snapshot.send_replace(ManagerSnapshot {
            phase: self.phase,
            workers: self
                .workers
                .iter()
                .map(|slot| slot.as_ref().map(|slot| slot.state))
                .collect(),
            stats: self.stats.clone(),
            completed_total: self.completed_total,
            failed_total: self.failed_total,
            restarts: self.restarts,
            ticks: self.ticks,
        });
    }
}

fn find_slot(workers: &mut [Option<WorkerSlot>], worker: WorkerId) -> Option<&mut WorkerSlot> {
    workers
        .get_mut(worker.index)?
        .as_mut()
        .filter(|slot| slot.handle.id() == worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnector;
    use crate::worker::detached_handle;
    use std::time::Duration;

    fn supervisor(connector: &MemoryConnector, slots: usize) -> Supervisor {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (_control_tx, control_rx) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(ManagerSnapshot::default());

        Supervisor {
            config: JobsConfig::default(),
            priority_levels: 5,
            store: Box::new(connector.handle()),
            ctx: WorkerContext {
                connector: Arc::new(connector.clone()),
                runners: Arc::new(RunnerRegistry::new()),
                lease: Default::default(),
                events: events_tx,
            },
            events: events_rx,
            control: control_rx,
            workers: (0..slots).map(|_| None).collect(),
            stats: JobStats::new(5),
            completed_total: 0,
            failed_total: 0,
            restarts: 0,
            ticks: 0,
            generation: 0,
            active: true,
            phase: ManagerPhase::Running,
            snapshot: Arc::new(snapshot),
        }
    }

    /// Installs detached handles in every slot and returns their command receivers.
    fn install_idle(sup: &mut Supervisor) -> Vec<mpsc::UnboundedReceiver<WorkerCommand>> {
        let mut receivers = Vec::new();
        for index in 0..sup.workers.len() {
            let id = WorkerId {
                index,
                generation: index as u64 + 1,
            };
            let (handle, commands) = detached_handle(id);
            sup.workers[index] = Some(WorkerSlot {
                handle,
                state: WorkerState::Started,
            });
            sup.on_message(id, WorkerMessage::Online);
            sup.on_message(id, WorkerMessage::Idle);
            receivers.push(commands);
        }
        receivers
    }

    fn message(index: usize, generation: u64, message: WorkerMessage) -> WorkerEvent {
        WorkerEvent::Message {
            worker: WorkerId { index, generation },
            message,
        }
    }

    #[tokio::test]
    async fn test_wake_is_bounded_by_queue_length() {
        let connector = MemoryConnector::new(5, Duration::from_millis(10));
        let mut sup = supervisor(&connector, 3);
        let mut receivers = install_idle(&mut sup);
        assert_eq!(sup.stats.idle_workers, 3);

        connector.handle().add_to_queue(1, "jobs/echo/1").await.unwrap();

        assert_eq!(sup.wake_idle_workers().await.unwrap(), 1);
        assert_eq!(sup.stats.idle_workers, 2);
        assert_eq!(sup.count(WorkerState::Active), 1);

        let started: usize = receivers
            .iter_mut()
            .map(|rx| usize::from(rx.try_recv() == Ok(WorkerCommand::Start)))
            .sum();
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn test_wake_is_bounded_by_idle_workers() {
        let connector = MemoryConnector::new(5, Duration::from_millis(10));
        let mut sup = supervisor(&connector, 2);
        let _receivers = install_idle(&mut sup);

        let store = connector.handle();
        for n in 0..5 {
            store.add_to_queue(2, &format!("jobs/echo/{}", n)).await.unwrap();
        }

        assert_eq!(sup.wake_idle_workers().await.unwrap(), 2);
        assert_eq!(sup.wake_idle_workers().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_counters_follow_messages() {
        let connector = MemoryConnector::new(5, Duration::from_millis(10));
        let mut sup = supervisor(&connector, 2);
        let _receivers = install_idle(&mut sup);
        assert_eq!(sup.stats.live_workers, 2);

        sup.handle_event(message(0, 1, WorkerMessage::Completed));
        sup.handle_event(message(0, 1, WorkerMessage::Failed));
        sup.handle_event(message(1, 2, WorkerMessage::Stopped));

        assert_eq!(sup.stats.completed_jobs, 1);
        assert_eq!(sup.stats.failed_jobs, 1);
        assert_eq!(sup.stats.live_workers, 1);
        assert_eq!(sup.stats.idle_workers, 1);

        // Stale generation for slot 0 is ignored.
        sup.handle_event(message(0, 99, WorkerMessage::Stopped));
        assert_eq!(sup.stats.live_workers, 1);
    }

    #[tokio::test]
    async fn test_crash_respawns_same_index() {
        let connector = MemoryConnector::new(5, Duration::from_millis(10));
        let mut sup = supervisor(&connector, 2);
        let _receivers = install_idle(&mut sup);
        sup.generation = 2;

        sup.handle_event(WorkerEvent::Exited {
            worker: WorkerId {
                index: 1,
                generation: 2,
            },
            error: Some("boom".into()),
        });

        assert_eq!(sup.restarts, 1);
        assert_eq!(sup.stats.live_workers, 1);
        assert_eq!(sup.stats.idle_workers, 1);
        let slot = sup.workers[1].as_ref().unwrap();
        assert_eq!(slot.state, WorkerState::Started);
        assert_eq!(slot.handle.id().generation, 3);
    }

    #[tokio::test]
    async fn test_crash_while_draining_is_not_respawned() {
        let connector = MemoryConnector::new(5, Duration::from_millis(10));
        let mut sup = supervisor(&connector, 1);
        let _receivers = install_idle(&mut sup);
        sup.active = false;

        sup.handle_event(WorkerEvent::Exited {
            worker: WorkerId {
                index: 0,
                generation: 1,
            },
            error: Some("boom".into()),
        });

        assert_eq!(sup.restarts, 0);
        assert!(sup.all_stopped());
    }

    #[tokio::test]
    async fn test_flush_resets_window_only() {
        let connector = MemoryConnector::new(5, Duration::from_millis(10));
        let mut sup = supervisor(&connector, 1);
        let _receivers = install_idle(&mut sup);
        sup.handle_event(message(0, 1, WorkerMessage::Completed));
        connector.handle().add_to_schedule(10, "a.1.10").await.unwrap();

        sup.flush_stats().await.unwrap();

        let recorded = connector.recorded_stats();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].completed_jobs, 1);
        assert_eq!(recorded[0].scheduled_jobs, 1);
        assert_eq!(recorded[0].live_workers, 1);
        assert_eq!(sup.stats.completed_jobs, 0);
        assert_eq!(sup.stats.live_workers, 1);
    }

    #[tokio::test]
    async fn test_start_rejects_priority_mismatch() {
        let connector = Arc::new(MemoryConnector::new(7, Duration::from_millis(10)));
        let manager = JobManager::new(JobsConfig::default(), connector, RunnerRegistry::new());

        assert!(matches!(manager.start().await, Err(JobError::Configuration(_))));
        assert_eq!(manager.snapshot().phase, ManagerPhase::Created);
        manager.wait_stopped().await.unwrap();
    }

    #[test]
    fn test_snapshot_counts() {
        let snapshot = ManagerSnapshot {
            phase: ManagerPhase::Running,
            workers: vec![Some(WorkerState::Idle), None, Some(WorkerState::Idle)],
            ..ManagerSnapshot::default()
        };
        assert!(snapshot.is_active());
        assert_eq!(snapshot.count(WorkerState::Idle), 2);
        assert_eq!(snapshot.count(WorkerState::Active), 0);
    }
}
