//! Durable delayed tasks.
//!
//! A task is persisted with its absolute fire time before its timer is
//! armed, and deleted before its handler runs. [`TransactionalScheduler::start`]
//! re-arms every persisted task, so a task survives a restart and is
//! delivered at least once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rtx_transact::{ReadWriteTransaction, TransactError, TransactionBuilder, TransactionalPersistence};
use rtx_types::{NodeId, ResourceId, TaskId};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::config::{RetryPolicy, ServiceConfig};
use crate::error::ServiceResult;

/// Receives tasks when they fire.
pub trait TaskHandler: Send + Sync {
    fn on_fire(&self, task: &TaskId);
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

struct SchedulerInner {
    persistence: TransactionalPersistence,
    node: NodeId,
    runtime: Handle,
    handler: Arc<dyn TaskHandler>,
    timers: Mutex<HashMap<TaskId, AbortHandle>>,
    retry: RetryPolicy,
}

impl SchedulerInner {
    fn timers(&self) -> MutexGuard<'_, HashMap<TaskId, AbortHandle>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rw(&self, resource_id: ResourceId) -> TransactionBuilder<ReadWriteTransaction> {
        self.persistence.build_rw(self.node).with_resource_id(resource_id)
    }

    /// Delete the durable record of `task`. Returns false if it was already
    /// gone.
    fn delete(&self, task: &TaskId) -> ServiceResult<bool> {
        self.retry.run(|| {
            let mut txn = self.rw(*task.resource_id()).begin()?;
            match txn.delete_task(task) {
                Ok(()) => {
                    txn.commit()?;
                    Ok(true)
                }
                Err(TransactError::NoSuchTask(_) | TransactError::NotFound(_)) => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn fire(&self, task: TaskId) {
        self.timers().remove(&task);
        match self.delete(&task) {
            Ok(true) => {
                debug!(task = %task, "task fired");
                self.handler.on_fire(&task);
            }
            Ok(false) => debug!(task = %task, "task no longer persisted; skipped"),
            Err(e) => warn!(task = %task, error = %e, "could not delete fired task; it stays persisted"),
        }
    }
}

/// Timers backed by persisted task records.
#[derive(Clone)]
pub struct TransactionalScheduler {
    inner: Arc<SchedulerInner>,
}

impl TransactionalScheduler {
    /// Timers are driven on `runtime`; handlers run on its blocking pool.
    pub fn new(
        persistence: TransactionalPersistence,
        handler: Arc<dyn TaskHandler>,
        runtime: Handle,
        config: &ServiceConfig,
    ) -> ServiceResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                persistence,
                node: config.node_id,
                runtime,
                handler,
                timers: Mutex::new(HashMap::new()),
                retry: config.conflict_retry.clone(),
            }),
        })
    }

    /// Re-arm every task persisted for this node. Runs under an exclusive
    /// transaction. Returns the number of tasks armed.
    pub fn start(&self) -> ServiceResult<usize> {
        let exclusive = self.inner.persistence.open_exclusive_rw()?;
        let records = exclusive.compute_operation(|store| Ok(store.task_index().list_all_entries_by_resource()?))?;
        exclusive.close();

        let mut armed = 0;
        for record in records.iter().filter(|r| r.resource_id.node_id() == &self.inner.node) {
            for (task, fire_at) in &record.tasks {
                self.arm(*task, *fire_at);
                armed += 1;
            }
        }
        info!(node = %self.inner.node, armed, "scheduler started");
        Ok(armed)
    }

    /// Persist a task on `resource_id` firing after `delay`, then arm it.
    pub fn schedule_after(&self, resource_id: ResourceId, delay: Duration) -> ServiceResult<TaskId> {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.schedule_at(resource_id, now_millis().saturating_add(delay_ms))
    }

    /// Persist a task on `resource_id` firing at `fire_at` (milliseconds
    /// since the Unix epoch), then arm it. A time in the past fires
    /// immediately.
    pub fn schedule_at(&self, resource_id: ResourceId, fire_at: u64) -> ServiceResult<TaskId> {
        let task = TaskId::new(resource_id);
        self.inner.retry.run(|| {
            let mut txn = self.inner.rw(resource_id).begin()?;
            txn.create_task(&task, fire_at)?;
            txn.commit()?;
            Ok(())
        })?;
        self.arm(task, fire_at);
        Ok(task)
    }

    /// Disarm and delete a task. Returns false if it was not persisted.
    pub fn cancel(&self, task: &TaskId) -> ServiceResult<bool> {
        if let Some(timer) = self.inner.timers().remove(task) {
            timer.abort();
        }
        let deleted = self.inner.delete(task)?;
        debug!(task = %task, deleted, "task cancelled");
        Ok(deleted)
    }

    /// Disarm every timer. Persisted tasks are kept and re-armed by the next
    /// [`start`](Self::start).
    pub fn stop(&self) {
        let timers: Vec<_> = self.inner.timers().drain().collect();
        for (_, timer) in &timers {
            timer.abort();
        }
        info!(node = %self.inner.node, disarmed = timers.len(), "scheduler stopped");
    }

    /// Number of timers currently armed.
    pub fn armed_count(&self) -> usize {
        self.inner.timers().len()
    }

    fn arm(&self, task: TaskId, fire_at: u64) {
        let delay = Duration::from_millis(fire_at.saturating_sub(now_millis()));
        let inner = Arc::clone(&self.inner);

        // Held across spawn so the timer is registered before it can fire.
        let mut timers = self.inner.timers();
        let handle = self.inner.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tokio::task::spawn_blocking(move || inner.fire(task)).await {
                warn!(task = %task, error = %e, "task handler panicked");
            }
        });
        if let Some(previous) = timers.insert(task, handle.abort_handle()) {
            previous.abort();
        }
        debug!(task = %task, delay_ms = delay.as_millis() as u64, "task armed");
    }
}

impl std::fmt::Debug for TransactionalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalScheduler")
            .field("node", &self.inner.node)
            .field("armed", &self.armed_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtx_store::{DataStore, InMemoryDataStore};
    use rtx_transact::{JournalConfig, TransactConfig};
    use rtx_types::Path;
    use std::sync::mpsc;

    struct Recorder(Mutex<mpsc::Sender<TaskId>>);

    impl TaskHandler for Recorder {
        fn on_fire(&self, task: &TaskId) {
            let _ = self.0.lock().unwrap().send(*task);
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<InMemoryDataStore>,
        runtime: tokio::runtime::Runtime,
        node: NodeId,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                store: Arc::new(InMemoryDataStore::new()),
                runtime: tokio::runtime::Runtime::new().unwrap(),
                node: NodeId::random(),
            }
        }

        fn persistence(&self) -> TransactionalPersistence {
            let store: Arc<dyn DataStore> = self.store.clone();
            let config = TransactConfig {
                max_concurrent_transactions: 8,
                journal: JournalConfig {
                    path: self.dir.path().join("journal.log"),
                    ..JournalConfig::default()
                },
            };
            let persistence = TransactionalPersistence::open(store, &config).unwrap();
            persistence.start().unwrap();
            persistence
        }

        fn scheduler(&self, persistence: &TransactionalPersistence) -> (TransactionalScheduler, mpsc::Receiver<TaskId>) {
            let (tx, rx) = mpsc::channel();
            let scheduler = TransactionalScheduler::new(
                persistence.clone(),
                Arc::new(Recorder(Mutex::new(tx))),
                self.runtime.handle().clone(),
                &ServiceConfig {
                    node_id: self.node,
                    conflict_retry: RetryPolicy::default(),
                },
            )
            .unwrap();
            (scheduler, rx)
        }

        fn resource(&self, persistence: &TransactionalPersistence, at: &str) -> ResourceId {
            let path: Path = at.parse().unwrap();
            let id = ResourceId::new(self.node);
            let mut txn = persistence.build_rw(self.node).with_path(path.clone()).begin().unwrap();
            txn.link_new_resource(id, &path).unwrap();
            txn.commit().unwrap();
            id
        }

        fn persisted_tasks(&self) -> usize {
            self.store
                .task_index()
                .list_all_entries_by_resource()
                .unwrap()
                .iter()
                .map(|r| r.tasks.len())
                .sum()
        }
    }

    #[test]
    fn past_due_task_fires_immediately() {
        let fx = Fixture::new();
        let persistence = fx.persistence();
        let (scheduler, rx) = fx.scheduler(&persistence);
        let resource = fx.resource(&persistence, "/timer");

        let task = scheduler.schedule_at(resource, 0).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), task);
        assert_eq!(fx.persisted_tasks(), 0);
    }

    #[test]
    fn delayed_task_fires_after_delay() {
        let fx = Fixture::new();
        let persistence = fx.persistence();
        let (scheduler, rx) = fx.scheduler(&persistence);
        let resource = fx.resource(&persistence, "/timer");

        let task = scheduler
            .schedule_after(resource, Duration::from_millis(300))
            .unwrap();
        assert_eq!(fx.persisted_tasks(), 1);
        assert_eq!(scheduler.armed_count(), 1);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), task);
        assert_eq!(fx.persisted_tasks(), 0);
    }

    #[test]
    fn cancel_disarms_and_deletes() {
        let fx = Fixture::new();
        let persistence = fx.persistence();
        let (scheduler, rx) = fx.scheduler(&persistence);
        let resource = fx.resource(&persistence, "/timer");

        let task = scheduler
            .schedule_after(resource, Duration::from_millis(200))
            .unwrap();
        assert!(scheduler.cancel(&task).unwrap());
        assert_eq!(scheduler.armed_count(), 0);
        assert_eq!(fx.persisted_tasks(), 0);
        assert!(!scheduler.cancel(&task).unwrap());
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    }

    #[test]
    fn tasks_are_rearmed_after_restart() {
        let fx = Fixture::new();
        let task;
        let first_rx;
        {
            let persistence = fx.persistence();
            let (scheduler, rx) = fx.scheduler(&persistence);
            let resource = fx.resource(&persistence, "/timer");
            task = scheduler
                .schedule_after(resource, Duration::from_millis(600))
                .unwrap();
            scheduler.stop();
            assert_eq!(scheduler.armed_count(), 0);
            first_rx = rx;
        }
        assert_eq!(fx.persisted_tasks(), 1);

        let persistence = fx.persistence();
        let (scheduler, rx) = fx.scheduler(&persistence);
        assert_eq!(scheduler.start().unwrap(), 1);
        assert_eq!(scheduler.armed_count(), 1);

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), task);
        assert!(first_rx.try_recv().is_err());
        assert_eq!(fx.persisted_tasks(), 0);
    }

    #[test]
    fn start_without_tasks_arms_nothing() {
        let fx = Fixture::new();
        let persistence = fx.persistence();
        let (scheduler, _rx) = fx.scheduler(&persistence);
        assert_eq!(scheduler.start().unwrap(), 0);
    }
}
