//! Consistent-hash dispatcher.
//!
//! Every process keeps a [`HashRing`] over the official workers, maintained
//! from the registry's membership events. [`Dispatcher::dispatch`] locates the
//! worker responsible for a logic task and writes the assignment key under
//! it. Dispatch never fails terminally: store errors, an empty ring, or a
//! located worker that is no longer alive are retried after
//! `retry_interval` plus jitter until the caller's token is cancelled.
//!
//! ## Guarantees
//!
//! - **One dispatch per task per process**: a "currently dispatching" set
//!   turns overlapping submissions of the same task into no-ops.
//! - **At most one live assignment**: an assignment held by a live official
//!   worker is kept as is. Assignments under workers that are no longer
//!   registered are deleted before a new one is written; a registered worker
//!   with a stale heartbeat keeps its assignment until the liveness probe
//!   evicts it. The write itself is guarded on the task's key being absent
//!   under every other worker.
//! - **No relocation on join**: a new member only receives new dispatches.
//!   When a member leaves, every task this process dispatched to it that is
//!   still assigned there is resubmitted through the normal path.
//! - **Bounded tracking**: every process watches the assignment keys and
//!   forgets a dispatched task once its key is deleted.

mod ring;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use keel_core::coord::watch::PrefixEvent;
use keel_core::observability::dispatch_span;
use keel_core::{LogicTaskId, WorkerId};

use crate::config::DispatcherConfig;
use crate::error::{Error, Result};
use crate::leaderworker::{LeaderWorker, LogicTask, MembershipEvent, TaskEvent};
use crate::metrics::{EngineMetrics, TimingGuard};

pub use ring::HashRing;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Core(keel_core::Error::internal("dispatcher lock poisoned"))
}

/// Outcome of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A new assignment key was written for this worker.
    Assigned(WorkerId),
    /// A live official worker already holds the task.
    AlreadyAssigned(WorkerId),
    /// Another dispatch of the same task is in progress in this process.
    AlreadyDispatching,
}

impl DispatchOutcome {
    /// The worker holding the task, if known.
    #[must_use]
    pub fn worker(&self) -> Option<&WorkerId> {
        match self {
            Self::Assigned(worker) | Self::AlreadyAssigned(worker) => Some(worker),
            Self::AlreadyDispatching => None,
        }
    }

    fn as_label(&self) -> &'static str {
        match self {
            Self::Assigned(_) => "assigned",
            Self::AlreadyAssigned(_) => "already_assigned",
            Self::AlreadyDispatching => "already_dispatching",
        }
    }
}

/// A task this process dispatched, kept so it can be resubmitted.
#[derive(Debug, Clone)]
struct Tracked {
    worker: WorkerId,
    data: Bytes,
    cancel: CancellationToken,
    /// Store revision of the assignment write, when this process wrote it.
    revision: Option<i64>,
}

/// Removes a task from the dispatching set when its dispatch ends.
struct DispatchingGuard<'a> {
    dispatching: &'a Mutex<HashSet<LogicTaskId>>,
    task: LogicTaskId,
}

impl Drop for DispatchingGuard<'_> {
    fn drop(&mut self) {
        self.dispatching
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.task);
    }
}

/// Routes logic tasks to official workers.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<LeaderWorker>,
    config: DispatcherConfig,
    metrics: EngineMetrics,
    ring: Mutex<HashRing>,
    dispatching: Mutex<HashSet<LogicTaskId>>,
    tracked: Mutex<HashMap<LogicTaskId, Tracked>>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    /// Creates a dispatcher with an empty ring.
    #[must_use]
    pub fn new(
        registry: Arc<LeaderWorker>,
        config: DispatcherConfig,
        metrics: EngineMetrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            ring: Mutex::new(HashRing::new(config.ring)),
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            registry,
            config,
            metrics,
            dispatching: Mutex::new(HashSet::new()),
            tracked: Mutex::new(HashMap::new()),
        })
    }

    /// Current ring members.
    ///
    /// # Errors
    ///
    /// Returns an error if the ring lock is poisoned.
    pub fn ring_members(&self) -> Result<Vec<WorkerId>> {
        Ok(self.ring.lock().map_err(poison_err)?.members().cloned().collect())
    }

    /// Worker the ring currently maps `task` to.
    ///
    /// # Errors
    ///
    /// Returns an error if the ring lock is poisoned.
    pub fn locate(&self, task: &LogicTaskId) -> Result<Option<WorkerId>> {
        Ok(self
            .ring
            .lock()
            .map_err(poison_err)?
            .locate_key(task.as_str().as_bytes())
            .cloned())
    }

    /// Returns true if a dispatch of `task` is in progress in this process.
    #[must_use]
    pub fn is_dispatching(&self, task: &LogicTaskId) -> bool {
        self.dispatching
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(task)
    }

    /// Dispatches `task`, retrying until it is assigned or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires first, or an internal
    /// error if a lock is poisoned.
    pub async fn dispatch(
        &self,
        task: LogicTask,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome> {
        let Some(_guard) = self.begin(&task.id)? else {
            tracing::debug!(logic_task_id = %task.id, "dispatch already in progress");
            self.metrics.record_dispatch(DispatchOutcome::AlreadyDispatching.as_label());
            return Ok(DispatchOutcome::AlreadyDispatching);
        };
        let _permit = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| Error::Cancelled)?
            }
        };
        let timer = TimingGuard::new(|elapsed| self.metrics.observe_dispatch_duration(elapsed));

        loop {
            match self.try_dispatch(&task, cancel).await {
                Ok(Some(outcome)) => {
                    tracing::info!(logic_task_id = %task.id, ?outcome, "dispatched");
                    self.metrics.record_dispatch(outcome.as_label());
                    return Ok(outcome);
                }
                Ok(None) => {
                    tracing::warn!(logic_task_id = %task.id, "task not assignable yet, retrying");
                }
                Err(e) => {
                    tracing::warn!(logic_task_id = %task.id, error = %e, "dispatch attempt failed, retrying");
                }
            }
            self.metrics.record_dispatch_retry();

            tokio::select! {
                () = cancel.cancelled() => {
                    timer.disarm();
                    self.metrics.record_dispatch("cancelled");
                    return Err(Error::Cancelled);
                }
                () = tokio::time::sleep(self.retry_delay()) => {}
            }
        }
    }

    /// Dispatches `task` in the background.
    pub fn submit(
        self: &Arc<Self>,
        task: LogicTask,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<DispatchOutcome>> {
        let this = Arc::clone(self);
        let span = dispatch_span("dispatch", task.id.as_str());
        tokio::spawn(async move { this.dispatch(task, &cancel).await }.instrument(span))
    }

    fn begin(&self, task: &LogicTaskId) -> Result<Option<DispatchingGuard<'_>>> {
        let inserted = self
            .dispatching
            .lock()
            .map_err(poison_err)?
            .insert(task.clone());
        Ok(inserted.then(|| DispatchingGuard {
            dispatching: &self.dispatching,
            task: task.clone(),
        }))
    }

    /// One dispatch attempt. `Ok(None)` means the task cannot be assigned
    /// right now: no live worker was located, an unresponsive but still
    /// registered worker holds it, or another writer won the assignment.
    async fn try_dispatch(
        &self,
        task: &LogicTask,
        cancel: &CancellationToken,
    ) -> Result<Option<DispatchOutcome>> {
        let mut holder = None;
        let mut held_by_unresponsive = false;
        for owner in self.registry.find_task_assignments(&task.id).await? {
            if holder.is_none() && self.registry.is_official_and_alive(&owner).await? {
                holder = Some(owner);
                continue;
            }
            if self.registry.get_worker(&owner).await?.is_some() {
                // The task may still be running there; eviction orphans it.
                tracing::debug!(logic_task_id = %task.id, worker_id = %owner, "assignment held by an unresponsive worker");
                held_by_unresponsive = true;
                continue;
            }
            tracing::info!(logic_task_id = %task.id, worker_id = %owner, "deleting stale assignment");
            self.registry.delete_assignment(&owner, &task.id).await?;
        }
        if let Some(holder) = holder {
            self.track(task, holder.clone(), cancel, None)?;
            return Ok(Some(DispatchOutcome::AlreadyAssigned(holder)));
        }
        if held_by_unresponsive {
            return Ok(None);
        }

        let Some(target) = self.locate(&task.id)? else {
            return Ok(None);
        };
        // The ring may lag the registry.
        if !self.registry.is_official_and_alive(&target).await? {
            tracing::debug!(worker_id = %target, "located worker is not alive");
            return Ok(None);
        }
        // Tracked before the write so the key's deletion always finds the entry.
        self.track(task, target.clone(), cancel, None)?;
        match self.registry.assign_logic_task_to_worker(&target, task).await {
            Ok(Some(revision)) => {
                self.set_tracked_revision(&task.id, &target, revision);
                Ok(Some(DispatchOutcome::Assigned(target)))
            }
            Ok(None) => {
                self.untrack_from(&target, &task.id);
                Ok(None)
            }
            Err(e) => {
                self.untrack_from(&target, &task.id);
                Err(e)
            }
        }
    }

    fn retry_delay(&self) -> Duration {
        let jitter_ms = u64::try_from(self.config.retry_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.config.retry_interval + Duration::from_millis(jitter)
    }

    fn track(
        &self,
        task: &LogicTask,
        worker: WorkerId,
        cancel: &CancellationToken,
        revision: Option<i64>,
    ) -> Result<()> {
        self.tracked.lock().map_err(poison_err)?.insert(
            task.id.clone(),
            Tracked {
                worker,
                data: task.data.clone(),
                cancel: cancel.clone(),
                revision,
            },
        );
        Ok(())
    }

    fn set_tracked_revision(&self, task: &LogicTaskId, worker: &WorkerId, revision: i64) {
        let mut tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = tracked.get_mut(task).filter(|t| &t.worker == worker) {
            entry.revision = Some(revision);
        }
    }

    fn untrack(&self, task: &LogicTaskId) -> Option<Tracked> {
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task)
    }

    /// Forgets `task` if it is tracked on `worker`.
    fn untrack_from(&self, worker: &WorkerId, task: &LogicTaskId) {
        let mut tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        if tracked.get(task).is_some_and(|t| &t.worker == worker) {
            tracked.remove(task);
        }
    }

    /// Drops tracked tasks whose assignment key is gone.
    fn prune_tracked(&self, event: PrefixEvent) {
        let keys = self.registry.keys();
        match event {
            PrefixEvent::Snapshot(kvs) => {
                let present: HashSet<(WorkerId, LogicTaskId)> = kvs
                    .iter()
                    .filter_map(|kv| keys.parse_assignment_key(&kv.key))
                    .collect();
                let dispatching = self.dispatching.lock().unwrap_or_else(PoisonError::into_inner);
                self.tracked
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|task, t| {
                        dispatching.contains(task) || present.contains(&(t.worker.clone(), task.clone()))
                    });
            }
            PrefixEvent::Change(change) if change.is_delete() => {
                let Some((worker, task)) = keys.parse_assignment_key(&change.kv.key) else {
                    return;
                };
                let mut tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
                // A delete older than this process's write belongs to an
                // earlier assignment of the same task.
                let released = tracked.get(&task).is_some_and(|t| {
                    t.worker == worker && t.revision.is_none_or(|written| change.revision > written)
                });
                if released {
                    tracked.remove(&task);
                    tracing::debug!(logic_task_id = %task, worker_id = %worker, "assignment released, untracked");
                }
            }
            PrefixEvent::Change(_) => {}
        }
    }

    /// Tasks dispatched by this process that are still tracked, with their worker.
    #[must_use]
    pub fn tracked_tasks(&self) -> Vec<(LogicTaskId, WorkerId)> {
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(task, tracked)| (task.clone(), tracked.worker.clone()))
            .collect()
    }

    /// Keeps the ring in sync with the official workers and prunes tracked
    /// tasks whose assignment was released, until `cancel` fires. Runs in
    /// every process.
    pub async fn run_ring_maintenance(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.registry.subscribe_membership();
        let mut assignments = self.registry.watch_assignments(cancel.clone());
        self.resync_ring();
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                Some(event) = assignments.recv() => self.prune_tracked(event),
                event = events.recv() => match event {
                    Ok(MembershipEvent::Snapshot(members)) => self.apply_members(members),
                    Ok(MembershipEvent::Added(worker)) => {
                        if self.with_ring(|ring| ring.add(worker.clone())) {
                            tracing::info!(worker_id = %worker, "worker added to ring");
                        }
                    }
                    Ok(MembershipEvent::Removed(worker)) => {
                        if self.with_ring(|ring| ring.remove(&worker)) {
                            tracing::info!(worker_id = %worker, "worker removed from ring");
                        }
                        self.resubmit_tasks_of(&worker);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "membership events lagged, resyncing ring");
                        self.resync_ring();
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    fn with_ring<R>(&self, f: impl FnOnce(&mut HashRing) -> R) -> R {
        f(&mut self.ring.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn resync_ring(self: &Arc<Self>) {
        match self.registry.official_members() {
            Ok(members) => self.apply_members(members),
            Err(e) => tracing::error!(error = %e, "failed to read membership"),
        }
    }

    fn apply_members(self: &Arc<Self>, members: Vec<WorkerId>) {
        let removed: Vec<WorkerId> = self.with_ring(|ring| {
            let removed: Vec<WorkerId> =
                ring.members().filter(|m| !members.contains(m)).cloned().collect();
            if ring.set_members(members) {
                tracing::info!(members = ring.len(), "ring rebuilt");
            }
            removed
        });
        for worker in removed {
            self.resubmit_tasks_of(&worker);
        }
    }

    /// Resubmits every tracked task dispatched to `worker` whose assignment
    /// key is still there. A missing key means the task finished or was
    /// already redispatched.
    fn resubmit_tasks_of(self: &Arc<Self>, worker: &WorkerId) {
        let tasks: Vec<(LogicTaskId, Tracked)> = {
            let mut tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
            let ids: Vec<LogicTaskId> = tracked
                .iter()
                .filter(|(_, t)| &t.worker == worker)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| tracked.remove(&id).map(|t| (id, t)))
                .collect()
        };
        for (id, tracked) in tasks {
            if tracked.cancel.is_cancelled() {
                continue;
            }
            let this = Arc::clone(self);
            let worker = worker.clone();
            tokio::spawn(async move {
                match this.registry.get_assignment(&worker, &id).await {
                    Ok(None) => {
                        tracing::debug!(logic_task_id = %id, worker_id = %worker, "task of removed worker already released");
                        return;
                    }
                    Ok(Some(_)) => {}
                    Err(e) => {
                        tracing::warn!(logic_task_id = %id, error = %e, "failed to read assignment of removed worker");
                    }
                }
                tracing::info!(logic_task_id = %id, worker_id = %worker, "resubmitting task of removed worker");
                drop(this.submit(LogicTask::new(id, tracked.data), tracked.cancel));
            });
        }
    }

    /// Leader loop: redispatches orphaned tasks and forgets finished ones
    /// until `term` is cancelled.
    ///
    /// `events` must be subscribed before the failover coordinator starts so
    /// no orphan notification of the term is missed.
    pub async fn run_task_events(
        self: Arc<Self>,
        mut events: broadcast::Receiver<TaskEvent>,
        term: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                () = term.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Ok(TaskEvent::Orphaned { worker_id, tasks }) => {
                    for task in tasks {
                        let data = self.orphan_payload(&worker_id, &task).await;
                        drop(self.submit(LogicTask::new(task, data), term.clone()));
                    }
                }
                Ok(TaskEvent::Finished { worker_id, task }) => {
                    self.untrack_from(&worker_id, &task);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Missed orphans are caught by the cleanup sweep.
                    tracing::warn!(skipped, "task events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Payload of an orphaned task: from the local record, else from the
    /// assignment key the dead worker left behind.
    async fn orphan_payload(&self, worker: &WorkerId, task: &LogicTaskId) -> Bytes {
        if let Some(tracked) = self.untrack(task) {
            return tracked.data;
        }
        match self.registry.get_assignment(worker, task).await {
            Ok(Some(data)) => data,
            Ok(None) => Bytes::new(),
            Err(e) => {
                tracing::warn!(logic_task_id = %task, error = %e, "failed to read orphaned payload");
                Bytes::new()
            }
        }
    }
}
