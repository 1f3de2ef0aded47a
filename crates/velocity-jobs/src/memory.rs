//! In-process job store.
//!
//! Implements the full store contract over shared in-memory state. Every
//! [`MemoryJobStore`] handle is one "connection"; handles created from the same
//! [`MemoryConnector`] see the same queues. Useful for embedding the scheduler
//! without Redis and as the backend of the test harness.

use crate::error::{JobError, JobResult};
use crate::job::Job;
use crate::stats::JobStats;
use crate::store::{JobStore, StoreConnector};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

#[derive(Default)]
struct State {
    jobs: HashMap<String, String>,
    queues: Vec<VecDeque<String>>,
    /// Ordered like a sorted set: by score, then member.
    scheduled: BTreeSet<(i64, String)>,
    leases: HashMap<String, i64>,
    stats: Vec<JobStats>,
    poisoned: HashSet<String>,
    poisoned_leases: HashSet<String>,
    unavailable: bool,
}

struct Shared {
    state: Mutex<State>,
    queued: Notify,
}

/// Creates handles onto one shared in-memory store.
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
    priority_levels: u32,
    pop_timeout: Duration,
}

impl MemoryConnector {
    /// Creates an empty store with `priority_levels` queues.
    pub fn new(priority_levels: u32, pop_timeout: Duration) -> Self {
        let state = State {
            queues: vec![VecDeque::new(); priority_levels as usize],
            ..State::default()
        };

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                queued: Notify::new(),
            }),
            priority_levels,
            pop_timeout,
        }
    }

    /// Opens a new handle without going through the async trait.
    pub fn handle(&self) -> MemoryJobStore {
        MemoryJobStore {
            shared: Arc::clone(&self.shared),
            priority_levels: self.priority_levels,
            pop_timeout: self.pop_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Makes every later `set_job` for `key` fail.
    pub fn poison_key(&self, key: impl Into<String>) {
        self.shared.state.lock().poisoned.insert(key.into());
    }

    /// Makes every later `add_lease` for `key` fail.
    pub fn poison_lease(&self, key: impl Into<String>) {
        self.shared.state.lock().poisoned_leases.insert(key.into());
    }

    /// Lifts any injected write failure for `key`.
    pub fn clear_poison(&self, key: &str) {
        let mut state = self.shared.state.lock();
        state.poisoned.remove(key);
        state.poisoned_leases.remove(key);
    }

    /// Simulates the backend being unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.state.lock().unavailable = unavailable;
    }

    /// Keys currently waiting in a priority queue, head first.
    pub fn queued_keys(&self, priority: u32) -> Vec<String> {
        let state = self.shared.state.lock();
        priority
            .checked_sub(1)
            .and_then(|index| state.queues.get(index as usize))
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Lease expiry recorded for a job, if any.
    pub fn lease_of(&self, key: &str) -> Option<i64> {
        self.shared.state.lock().leases.get(key).copied()
    }

    /// Every stats snapshot recorded so far, oldest first.
    pub fn recorded_stats(&self) -> Vec<JobStats> {
        self.shared.state.lock().stats.clone()
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self) -> JobResult<Box<dyn JobStore>> {
        if self.shared.state.lock().unavailable {
            return Err(JobError::Store("in-memory store unavailable".to_string()));
        }
        Ok(Box::new(self.handle()))
    }

    fn priority_levels(&self) -> u32 {
        self.priority_levels
    }
}

/// One connection to a [`MemoryConnector`]'s state.
pub struct MemoryJobStore {
    shared: Arc<Shared>,
    priority_levels: u32,
    pop_timeout: Duration,
    closed: AtomicBool,
}

impl MemoryJobStore {
    /// Locks the shared state after checking the connection is usable.
    fn state(&self) -> JobResult<parking_lot::MutexGuard<'_, State>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(JobError::StoreClosed);
        }
        let state = self.shared.state.lock();
        if state.unavailable {
            return Err(JobError::Store("in-memory store unavailable".to_string()));
        }
        Ok(state)
    }

    fn queue_index(&self, priority: u32) -> JobResult<usize> {
        if priority == 0 || priority > self.priority_levels {
            return Err(JobError::InvalidPriority {
                priority,
                levels: self.priority_levels,
            });
        }
        Ok((priority - 1) as usize)
    }

    fn try_pop(&self) -> JobResult<Option<String>> {
        let mut state = self.state()?;
        Ok(state.queues.iter_mut().find_map(VecDeque::pop_front))
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn set_job(&self, key: &str, job: &Job) -> JobResult<()> {
        let json = job.to_json()?;
        let mut state = self.state()?;
        if state.poisoned.contains(key) {
            return Err(JobError::Store(format!("write rejected for {}", key)));
        }
        state.jobs.insert(key.to_string(), json);
        Ok(())
    }

    async fn get_job(&self, key: &str) -> JobResult<Option<Job>> {
        let json = self.state()?.jobs.get(key).cloned();
        json.map(|json| Job::from_json(&json)).transpose()
    }

    async fn add_to_queue(&self, priority: u32, key: &str) -> JobResult<()> {
        let index = self.queue_index(priority)?;
        self.state()?.queues[index].push_back(key.to_string());
        self.shared.queued.notify_waiters();
        Ok(())
    }

    async fn add_all_to_queue(&self, priority: u32, keys: &[String]) -> JobResult<()> {
        let index = self.queue_index(priority)?;
        self.state()?.queues[index].extend(keys.iter().cloned());
        self.shared.queued.notify_waiters();
        Ok(())
    }

    async fn get_next_in_queue(&self) -> JobResult<Option<String>> {
        let deadline = Instant::now() + self.pop_timeout;
        loop {
            // Register interest before checking so a push in between is not lost.
            let notified = self.shared.queued.notified();
            if let Some(key) = self.try_pop()? {
                return Ok(Some(key));
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn queue_lengths(&self) -> JobResult<Vec<u64>> {
        Ok(self
            .state()?
            .queues
            .iter()
            .map(|queue| queue.len() as u64)
            .collect())
    }

    async fn add_to_schedule(&self, due_time: i64, value: &str) -> JobResult<()> {
        let mut state = self.state()?;
        state.scheduled.retain(|(_, member)| member != value);
        state.scheduled.insert((due_time, value.to_string()));
        Ok(())
    }

    async fn pull_scheduled_until(&self, time: i64) -> JobResult<Vec<String>> {
        let mut state = self.state()?;
        let due: Vec<(i64, String)> = state
            .scheduled
            .iter()
            .take_while(|(score, _)| *score <= time)
            .cloned()
            .collect();
        for entry in &due {
            state.scheduled.remove(entry);
        }
        Ok(due.into_iter().map(|(_, member)| member).collect())
    }

    async fn get_scheduled_length(&self) -> JobResult<u64> {
        Ok(self.state()?.scheduled.len() as u64)
    }

    async fn add_lease(&self, key: &str, expires_at: i64) -> JobResult<()> {
        let mut state = self.state()?;
        if state.poisoned_leases.contains(key) {
            return Err(JobError::Store(format!("lease rejected for {}", key)));
        }
        state.leases.insert(key.to_string(), expires_at);
        Ok(())
    }

    async fn remove_lease(&self, key: &str) -> JobResult<()> {
        self.state()?.leases.remove(key);
        Ok(())
    }

    async fn pull_expired_leases(&self, now: i64) -> JobResult<Vec<String>> {
        let mut state = self.state()?;
        let mut expired: Vec<(i64, String)> = state
            .leases
            .iter()
            .filter(|(_, expires_at)| **expires_at <= now)
            .map(|(key, expires_at)| (*expires_at, key.clone()))
            .collect();
        expired.sort();
        for (_, key) in &expired {
            state.leases.remove(key);
        }
        Ok(expired.into_iter().map(|(_, key)| key).collect())
    }

    async fn record_job_stats(&self, stats: &JobStats) -> JobResult<()> {
        self.state()?.stats.push(stats.clone());
        Ok(())
    }

    async fn close_connection(&self) -> JobResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use serde_json::json;

    fn connector() -> MemoryConnector {
        MemoryConnector::new(5, Duration::from_millis(50))
    }

    fn job(key: &str) -> Job {
        Job {
            key: key.to_string(),
            job_type: "echo".to_string(),
            priority: 1,
            data: json!(null),
            state: JobState::Waiting,
            attempts: 0,
        }
    }

    #[tokio::test]
    async fn test_set_and_get_job() {
        let store = connector().handle();
        store.set_job("jobs/echo/1", &job("jobs/echo/1")).await.unwrap();

        let found = store.get_job("jobs/echo/1").await.unwrap().unwrap();
        assert_eq!(found.key, "jobs/echo/1");
        assert!(store.get_job("jobs/echo/2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pop_respects_priority_then_fifo() {
        let store = connector().handle();
        store.add_to_queue(3, "c1").await.unwrap();
        store.add_to_queue(1, "a1").await.unwrap();
        store.add_all_to_queue(3, &["c2".to_string()]).await.unwrap();
        store.add_to_queue(1, "a2").await.unwrap();

        let mut popped = Vec::new();
        while let Some(key) = store.get_next_in_queue().await.unwrap() {
            popped.push(key);
        }
        assert_eq!(popped, vec!["a1", "a2", "c1", "c2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_wakes_on_push() {
        let connector = connector();
        let consumer = connector.handle();
        let producer = connector.handle();

        let pop = tokio::spawn(async move { consumer.get_next_in_queue().await });
        tokio::task::yield_now().await;
        producer.add_to_queue(2, "late").await.unwrap();

        assert_eq!(pop.await.unwrap().unwrap(), Some("late".to_string()));
    }

    #[tokio::test]
    async fn test_queue_rejects_out_of_range_priority() {
        let store = connector().handle();
        assert!(matches!(
            store.add_to_queue(6, "x").await,
            Err(JobError::InvalidPriority { priority: 6, levels: 5 })
        ));
        assert!(store.add_to_queue(0, "x").await.is_err());
    }

    #[tokio::test]
    async fn test_pull_scheduled_until_is_inclusive_and_removes() {
        let store = connector().handle();
        store.add_to_schedule(100, "a.1.100").await.unwrap();
        store.add_to_schedule(200, "b.1.200").await.unwrap();
        store.add_to_schedule(300, "c.1.300").await.unwrap();

        assert_eq!(store.pull_scheduled_until(200).await.unwrap(), vec!["a.1.100", "b.1.200"]);
        assert_eq!(store.get_scheduled_length().await.unwrap(), 1);
        assert!(store.pull_scheduled_until(200).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pull_expired_leases() {
        let connector = connector();
        let store = connector.handle();
        store.add_lease("a", 10).await.unwrap();
        store.add_lease("b", 50).await.unwrap();
        store.remove_lease("b").await.unwrap();
        store.add_lease("c", 5).await.unwrap();

        assert_eq!(store.pull_expired_leases(20).await.unwrap(), vec!["c", "a"]);
        assert!(connector.lease_of("a").is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_per_handle() {
        let connector = connector();
        let first = connector.handle();
        let second = connector.handle();

        first.close_connection().await.unwrap();
        first.close_connection().await.unwrap();

        assert!(matches!(first.get_queued_length().await, Err(JobError::StoreClosed)));
        assert_eq!(second.get_queued_length().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_poisoned_key_rejects_writes() {
        let connector = connector();
        connector.poison_key("jobs/echo/bad");
        let store = connector.handle();

        let err = store.set_job("jobs/echo/bad", &job("jobs/echo/bad")).await.unwrap_err();
        assert!(err.is_store_error());

        connector.poison_lease("jobs/echo/bad");
        assert!(store.add_lease("jobs/echo/bad", 1).await.is_err());

        connector.clear_poison("jobs/echo/bad");
        assert!(store.set_job("jobs/echo/bad", &job("jobs/echo/bad")).await.is_ok());
        assert!(store.add_lease("jobs/echo/bad", 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_unavailable_backend() {
        let connector = connector();
        let store = connector.handle();
        connector.set_unavailable(true);

        assert!(store.queue_lengths().await.is_err());
        assert!(connector.connect().await.is_err());

        connector.set_unavailable(false);
        assert_eq!(store.queue_lengths().await.unwrap(), vec![0; 5]);
    }
}
