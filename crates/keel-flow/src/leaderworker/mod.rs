//! Worker registry and leader-side failover.
//!
//! A worker is visible to the fleet only while its registry key exists:
//!
//! - **Registration**: a process registers its worker as a *candidate*,
//!   reports heartbeats, and after a stability threshold promotes itself to
//!   *official* with an atomic delete-candidate/put-official transaction.
//! - **Liveness**: the leader deletes every worker whose heartbeat is older
//!   than `heartbeat_report_interval * allowed_max_continue_lost_contact_times`.
//!   Nothing else removes a worker for suspected death.
//! - **Assignment**: a logic task is in flight exactly while an assignment key
//!   `{prefix}/dispatch/worker/{worker}/task/{task}` exists. The owning worker
//!   runs its handlers when the key appears and deletes it when done.
//! - **Failover**: on every leadership term the leader rebuilds its
//!   task/worker map and reports [`TaskEvent::Orphaned`] for each worker that
//!   disappears while owning tasks.
//!
//! Every process also runs [`LeaderWorker::run_membership_watch`], which keeps
//! a local view of the official workers and publishes [`MembershipEvent`]s for
//! the dispatcher's hash ring.

mod executor;
mod failover;
mod registry;
mod types;

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use keel_core::coord::watch::{PrefixEvent, spawn_prefix_watch};
use keel_core::coord::{Compare, SharedStore, Txn, TxnOp, WatchEventKind};
use keel_core::{LogicTaskId, WorkerId};

use crate::config::{LeaderConfig, WorkerConfig};
use crate::error::{Error, Result};
use crate::keys::KeyLayout;
use crate::metrics::EngineMetrics;

pub use failover::TaskWorkerMap;
pub use registry::RegisteredWorker;
pub use types::{
    LogicTask, MembershipEvent, TaskContext, TaskEvent, TaskHandler, Worker, WorkerType,
    handler_fn,
};

const EVENT_CHANNEL_CAPACITY: usize = 4096;
const MEMBERSHIP_WATCH_CAPACITY: usize = 256;
const ASSIGNMENT_WATCH_CAPACITY: usize = 1024;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Core(keel_core::Error::internal("membership lock poisoned"))
}

/// Worker registry, assignment primitives and leader failover.
///
/// Shared behind an `Arc`; background loops hold their own clone.
#[derive(Debug)]
pub struct LeaderWorker {
    store: SharedStore,
    keys: KeyLayout,
    config: WorkerConfig,
    leader_config: LeaderConfig,
    metrics: EngineMetrics,
    membership_tx: broadcast::Sender<MembershipEvent>,
    task_tx: broadcast::Sender<TaskEvent>,
    members: RwLock<BTreeSet<WorkerId>>,
}

impl LeaderWorker {
    /// Creates a registry over a coordination store.
    #[must_use]
    pub fn new(
        store: SharedStore,
        keys: KeyLayout,
        config: WorkerConfig,
        leader_config: LeaderConfig,
        metrics: EngineMetrics,
    ) -> Arc<Self> {
        let (membership_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (task_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            store,
            keys,
            config,
            leader_config,
            metrics,
            membership_tx,
            task_tx,
            members: RwLock::new(BTreeSet::new()),
        })
    }

    /// The key layout in use.
    #[must_use]
    pub fn keys(&self) -> &KeyLayout {
        &self.keys
    }

    /// Subscribes to official-membership changes seen by this process.
    #[must_use]
    pub fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent> {
        self.membership_tx.subscribe()
    }

    /// Subscribes to leader-side task notifications.
    #[must_use]
    pub fn subscribe_task_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.task_tx.subscribe()
    }

    /// Official workers as currently seen by this process.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn official_members(&self) -> Result<Vec<WorkerId>> {
        Ok(self
            .members
            .read()
            .map_err(poison_err)?
            .iter()
            .cloned()
            .collect())
    }

    /// Writes the assignment key of `task` under `worker`, unless another
    /// worker already holds it.
    ///
    /// The write is a transaction guarded on the absence of the task's key
    /// under every registered worker and every current holder other than
    /// `worker`. Returns the store revision of the write, or `None` when a
    /// guard fails and nothing was written. Overwriting an existing
    /// assignment for the same pair is idempotent.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a listing or the transaction fails.
    pub async fn assign_logic_task_to_worker(
        &self,
        worker: &WorkerId,
        task: &LogicTask,
    ) -> Result<Option<i64>> {
        let mut others: BTreeSet<WorkerId> = self
            .store
            .list(&self.keys.workers_prefix())
            .await?
            .iter()
            .filter_map(|kv| self.keys.parse_worker_key(&kv.key))
            .map(|(_, id)| id)
            .collect();
        others.extend(self.find_task_assignments(&task.id).await?);
        others.remove(worker);

        let key = self.keys.assignment_key(worker, &task.id);
        let txn = others
            .iter()
            .fold(Txn::new(), |txn, other| {
                txn.when(Compare::Missing(self.keys.assignment_key(other, &task.id)))
            })
            .then(TxnOp::put(key, task.data.clone()));
        let result = self.store.txn(txn).await?;
        if !result.succeeded {
            tracing::debug!(worker_id = %worker, logic_task_id = %task.id, "task held by another worker");
            return Ok(None);
        }
        tracing::info!(worker_id = %worker, logic_task_id = %task.id, "assigned logic task");
        Ok(Some(result.revision))
    }

    /// Returns every worker currently holding an assignment key for `task`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the listing fails.
    pub async fn find_task_assignments(&self, task: &LogicTaskId) -> Result<Vec<WorkerId>> {
        let kvs = self.store.list(&self.keys.dispatch_prefix()).await?;
        Ok(kvs
            .iter()
            .filter_map(|kv| self.keys.parse_assignment_key(&kv.key))
            .filter(|(_, t)| t == task)
            .map(|(worker, _)| worker)
            .collect())
    }

    /// Deletes one assignment key. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the delete fails.
    pub async fn delete_assignment(&self, worker: &WorkerId, task: &LogicTaskId) -> Result<bool> {
        Ok(self
            .store
            .delete(&self.keys.assignment_key(worker, task))
            .await?)
    }

    /// Cancels a dispatched task by deleting every assignment key for it.
    /// The owning worker observes the deletion and cancels the task's context.
    ///
    /// Returns the number of keys deleted.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a listing or delete fails.
    pub async fn cancel_logic_task(&self, task: &LogicTaskId) -> Result<usize> {
        let mut deleted = 0;
        for worker in self.find_task_assignments(task).await? {
            if self.delete_assignment(&worker, task).await? {
                deleted += 1;
            }
        }
        tracing::info!(logic_task_id = %task, deleted, "cancelled logic task");
        Ok(deleted)
    }

    /// Reads the raw payload of an assignment, if present.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    pub async fn get_assignment(&self, worker: &WorkerId, task: &LogicTaskId) -> Result<Option<Bytes>> {
        Ok(self
            .store
            .get(&self.keys.assignment_key(worker, task))
            .await?
            .map(|kv| kv.value))
    }

    /// Watches every assignment key until `cancel` fires: a snapshot each
    /// time the watch is established, then incremental changes.
    #[must_use]
    pub fn watch_assignments(&self, cancel: CancellationToken) -> mpsc::Receiver<PrefixEvent> {
        spawn_prefix_watch(
            Arc::clone(&self.store),
            self.keys.dispatch_prefix(),
            ASSIGNMENT_WATCH_CAPACITY,
            self.config.store_retry_interval,
            cancel,
        )
    }

    /// Tracks the official workers until `cancel` fires. Runs in every process.
    pub async fn run_membership_watch(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = spawn_prefix_watch(
            Arc::clone(&self.store),
            self.keys.worker_type_prefix(WorkerType::Official),
            MEMBERSHIP_WATCH_CAPACITY,
            self.config.store_retry_interval,
            cancel.clone(),
        );
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => return,
                event = events.recv() => event,
            };
            let Some(event) = event else { return };
            if let Err(e) = self.apply_membership_event(event) {
                tracing::error!(error = %e, "failed to apply membership event");
            }
        }
    }

    fn apply_membership_event(&self, event: PrefixEvent) -> Result<()> {
        let mut members = self.members.write().map_err(poison_err)?;
        let published = match event {
            PrefixEvent::Snapshot(kvs) => {
                let snapshot: BTreeSet<WorkerId> = kvs
                    .iter()
                    .filter_map(|kv| self.keys.parse_worker_key(&kv.key))
                    .map(|(_, id)| id)
                    .collect();
                *members = snapshot.clone();
                Some(MembershipEvent::Snapshot(snapshot.into_iter().collect()))
            }
            PrefixEvent::Change(change) => {
                match (self.keys.parse_worker_key(&change.kv.key), change.kind) {
                    (Some((_, id)), WatchEventKind::Put) => members
                        .insert(id.clone())
                        .then_some(MembershipEvent::Added(id)),
                    (Some((_, id)), WatchEventKind::Delete) => members
                        .remove(&id)
                        .then_some(MembershipEvent::Removed(id)),
                    (None, _) => None,
                }
            }
        };
        let count = members.len();
        drop(members);

        self.metrics.set_workers(WorkerType::Official.as_str(), count);
        if let Some(event) = published {
            tracing::debug!(?event, "membership changed");
            let _ = self.membership_tx.send(event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
