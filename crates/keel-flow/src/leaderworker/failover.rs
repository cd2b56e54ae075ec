//! Leader-side failover.
//!
//! Runs for exactly one leadership term. At the start of the term the
//! task/worker map is rebuilt from the store; afterwards a single
//! coordinator consumes two prefix watches (official workers and assignment
//! keys) so both feeds update the map in one place. Losing a worker emits a
//! [`TaskEvent::Orphaned`] carrying every task it owned; a registered worker
//! releasing an assignment emits [`TaskEvent::Finished`]. A periodic sweep
//! removes keys whose owner is no longer registered.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use keel_core::coord::watch::{PrefixEvent, spawn_prefix_watch};
use keel_core::coord::{KeyValue, WatchEventKind};
use keel_core::{LogicTaskId, WorkerId};

use super::LeaderWorker;
use super::registry::sleep_or_cancel;
use super::types::{TaskEvent, WorkerType};
use crate::error::Result;

const FAILOVER_WATCH_CAPACITY: usize = 1024;

/// Leader-only mirror of the assignment keys: `task -> worker` and
/// `worker -> {tasks}`, plus the set of official workers.
///
/// A cache of the store, rebuilt from scratch every term.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TaskWorkerMap {
    workers: BTreeSet<WorkerId>,
    task_to_worker: HashMap<LogicTaskId, WorkerId>,
    worker_to_tasks: HashMap<WorkerId, BTreeSet<LogicTaskId>>,
}

impl TaskWorkerMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a worker as registered.
    pub fn add_worker(&mut self, worker: WorkerId) {
        self.workers.insert(worker);
    }

    /// Returns true if the worker is registered.
    #[must_use]
    pub fn has_worker(&self, worker: &WorkerId) -> bool {
        self.workers.contains(worker)
    }

    /// Registered workers.
    pub fn workers(&self) -> impl Iterator<Item = &WorkerId> {
        self.workers.iter()
    }

    /// Records an assignment, replacing any previous owner of the task.
    pub fn insert(&mut self, worker: WorkerId, task: LogicTaskId) {
        if let Some(previous) = self.task_to_worker.insert(task.clone(), worker.clone()) {
            if previous != worker {
                self.detach(&previous, &task);
            }
        }
        self.worker_to_tasks.entry(worker).or_default().insert(task);
    }

    /// Removes an assignment. Returns true if it was present.
    pub fn remove(&mut self, worker: &WorkerId, task: &LogicTaskId) -> bool {
        if self.task_to_worker.get(task) != Some(worker) {
            return false;
        }
        self.task_to_worker.remove(task);
        self.detach(worker, task);
        true
    }

    /// Removes a worker and returns every task it owned.
    pub fn remove_worker(&mut self, worker: &WorkerId) -> BTreeSet<LogicTaskId> {
        self.workers.remove(worker);
        let tasks = self.worker_to_tasks.remove(worker).unwrap_or_default();
        for task in &tasks {
            self.task_to_worker.remove(task);
        }
        tasks
    }

    /// The worker currently owning a task.
    #[must_use]
    pub fn worker_of(&self, task: &LogicTaskId) -> Option<&WorkerId> {
        self.task_to_worker.get(task)
    }

    /// Tasks owned by a worker.
    #[must_use]
    pub fn tasks_of(&self, worker: &WorkerId) -> Vec<LogicTaskId> {
        self.worker_to_tasks
            .get(worker)
            .map(|tasks| tasks.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every `(worker, task)` pair.
    #[must_use]
    pub fn assignments(&self) -> Vec<(WorkerId, LogicTaskId)> {
        self.task_to_worker
            .iter()
            .map(|(task, worker)| (worker.clone(), task.clone()))
            .collect()
    }

    /// Number of tracked assignments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.task_to_worker.len()
    }

    /// Returns true if no assignment is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.task_to_worker.is_empty()
    }

    fn detach(&mut self, worker: &WorkerId, task: &LogicTaskId) {
        if let Some(tasks) = self.worker_to_tasks.get_mut(worker) {
            tasks.remove(task);
            if tasks.is_empty() {
                self.worker_to_tasks.remove(worker);
            }
        }
    }
}

impl LeaderWorker {
    /// Runs the leader-only registry logic until `term` is cancelled.
    ///
    /// Rebuilds the task/worker map, then starts the liveness probe, the
    /// cleanup sweep and the failover coordinator. Nothing survives the term.
    pub async fn run_as_leader(self: Arc<Self>, term: CancellationToken) {
        let Some(mut map) = self.rebuild_task_map(&term).await else {
            return;
        };
        tracing::info!(
            workers = map.workers().count(),
            assignments = map.len(),
            "rebuilt task/worker map"
        );

        tokio::spawn(
            Arc::clone(&self)
                .run_liveness_probe(term.clone())
                .in_current_span(),
        );
        tokio::spawn(Arc::clone(&self).run_cleanup(term.clone()).in_current_span());

        let retry = self.leader_config.listing_retry_interval;
        let mut workers = spawn_prefix_watch(
            Arc::clone(&self.store),
            self.keys.worker_type_prefix(WorkerType::Official),
            FAILOVER_WATCH_CAPACITY,
            retry,
            term.clone(),
        );
        let mut assignments = spawn_prefix_watch(
            Arc::clone(&self.store),
            self.keys.dispatch_prefix(),
            FAILOVER_WATCH_CAPACITY,
            retry,
            term.clone(),
        );

        loop {
            tokio::select! {
                () = term.cancelled() => break,
                event = workers.recv() => match event {
                    Some(event) => self.on_worker_event(&mut map, event, &term).await,
                    None => break,
                },
                event = assignments.recv() => match event {
                    Some(event) => self.on_assignment_event(&mut map, event),
                    None => break,
                },
            }
        }
        tracing::info!("failover coordinator stopped");
    }

    /// Lists official workers and every assignment key, retrying until both
    /// listings succeed. Assignments whose owner is gone are orphaned at once.
    async fn rebuild_task_map(&self, term: &CancellationToken) -> Option<TaskWorkerMap> {
        loop {
            match self.try_rebuild_task_map().await {
                Ok(map) => return Some(map),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to rebuild task/worker map, retrying");
                    if sleep_or_cancel(self.leader_config.listing_retry_interval, term).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn try_rebuild_task_map(&self) -> Result<TaskWorkerMap> {
        let mut map = TaskWorkerMap::new();
        let officials = self
            .store
            .list(&self.keys.worker_type_prefix(WorkerType::Official))
            .await?;
        for kv in &officials {
            if let Some((_, id)) = self.keys.parse_worker_key(&kv.key) {
                map.add_worker(id);
            }
        }

        let assignments = self.store.list(&self.keys.dispatch_prefix()).await?;
        let mut dangling: BTreeMap<WorkerId, BTreeSet<LogicTaskId>> = BTreeMap::new();
        for kv in &assignments {
            let Some((worker, task)) = self.keys.parse_assignment_key(&kv.key) else {
                continue;
            };
            if map.has_worker(&worker) {
                map.insert(worker, task);
            } else {
                dangling.entry(worker).or_default().insert(task);
            }
        }
        for (worker_id, tasks) in dangling {
            self.emit_orphaned(worker_id, tasks);
        }
        Ok(map)
    }

    async fn on_worker_event(
        &self,
        map: &mut TaskWorkerMap,
        event: PrefixEvent,
        term: &CancellationToken,
    ) {
        match event {
            PrefixEvent::Snapshot(kvs) => {
                let present: BTreeSet<WorkerId> = kvs
                    .iter()
                    .filter_map(|kv| self.keys.parse_worker_key(&kv.key))
                    .map(|(_, id)| id)
                    .collect();
                let gone: Vec<WorkerId> = map
                    .workers()
                    .filter(|id| !present.contains(*id))
                    .cloned()
                    .collect();
                for id in gone {
                    self.on_worker_removed(map, id, term).await;
                }
                for id in present {
                    map.add_worker(id);
                }
            }
            PrefixEvent::Change(change) => {
                let Some((_, id)) = self.keys.parse_worker_key(&change.kv.key) else {
                    return;
                };
                match change.kind {
                    WatchEventKind::Put => map.add_worker(id),
                    WatchEventKind::Delete => self.on_worker_removed(map, id, term).await,
                }
            }
        }
    }

    async fn on_worker_removed(
        &self,
        map: &mut TaskWorkerMap,
        worker_id: WorkerId,
        term: &CancellationToken,
    ) {
        let mut tasks = map.remove_worker(&worker_id);
        tracing::warn!(worker_id = %worker_id, known_tasks = tasks.len(), "official worker removed");

        // The map may lag the store; the listing is authoritative.
        let prefix = self.keys.worker_tasks_prefix(&worker_id);
        loop {
            match self.store.list(&prefix).await {
                Ok(kvs) => {
                    tasks.extend(
                        kvs.iter()
                            .filter_map(|kv| self.keys.parse_assignment_key(&kv.key))
                            .map(|(_, task)| task),
                    );
                    break;
                }
                Err(e) => {
                    tracing::warn!(worker_id = %worker_id, error = %e, "failed to list orphaned tasks, retrying");
                    if sleep_or_cancel(self.leader_config.listing_retry_interval, term).await {
                        return;
                    }
                }
            }
        }
        self.emit_orphaned(worker_id, tasks);
    }

    fn on_assignment_event(&self, map: &mut TaskWorkerMap, event: PrefixEvent) {
        match event {
            PrefixEvent::Snapshot(kvs) => {
                let present: BTreeSet<(WorkerId, LogicTaskId)> = kvs
                    .iter()
                    .filter_map(|kv| self.keys.parse_assignment_key(&kv.key))
                    .collect();
                for (worker, task) in map.assignments() {
                    if !present.contains(&(worker.clone(), task.clone())) {
                        self.on_assignment_removed(map, worker, task);
                    }
                }
                for (worker, task) in present {
                    map.insert(worker, task);
                }
            }
            PrefixEvent::Change(change) => {
                let Some((worker, task)) = self.keys.parse_assignment_key(&change.kv.key) else {
                    return;
                };
                match change.kind {
                    WatchEventKind::Put => map.insert(worker, task),
                    WatchEventKind::Delete => self.on_assignment_removed(map, worker, task),
                }
            }
        }
    }

    fn on_assignment_removed(&self, map: &mut TaskWorkerMap, worker: WorkerId, task: LogicTaskId) {
        map.remove(&worker, &task);
        if map.has_worker(&worker) {
            tracing::debug!(worker_id = %worker, logic_task_id = %task, "task finished");
            let _ = self.task_tx.send(TaskEvent::Finished {
                worker_id: worker,
                task,
            });
        }
    }

    fn emit_orphaned(&self, worker_id: WorkerId, tasks: BTreeSet<LogicTaskId>) {
        if tasks.is_empty() {
            return;
        }
        let tasks: Vec<LogicTaskId> = tasks.into_iter().collect();
        tracing::warn!(worker_id = %worker_id, count = tasks.len(), "tasks orphaned");
        self.metrics.record_tasks_orphaned(tasks.len());
        let _ = self.task_tx.send(TaskEvent::Orphaned { worker_id, tasks });
    }

    async fn run_cleanup(self: Arc<Self>, term: CancellationToken) {
        loop {
            if sleep_or_cancel(self.leader_config.cleanup_interval, &term).await {
                return;
            }
            if let Err(e) = self.cleanup_dangling_keys().await {
                tracing::warn!(error = %e, "cleanup sweep failed");
            }
        }
    }

    /// Deletes heartbeat and assignment keys whose worker is not registered.
    /// Dangling assignments are orphaned first so their tasks are redispatched.
    pub(crate) async fn cleanup_dangling_keys(&self) -> Result<()> {
        // Listed before the registry: a key written by a worker that registers
        // concurrently is then seen together with its registration.
        let heartbeats = self.store.list(&self.keys.heartbeat_prefix()).await?;
        let assignments = self.store.list(&self.keys.dispatch_prefix()).await?;
        let registered: BTreeSet<WorkerId> = self
            .store
            .list(&self.keys.workers_prefix())
            .await?
            .iter()
            .filter_map(|kv| self.keys.parse_worker_key(&kv.key))
            .map(|(_, id)| id)
            .collect();

        let stale_heartbeats: Vec<&KeyValue> = heartbeats
            .iter()
            .filter(|kv| {
                self.keys
                    .parse_heartbeat_key(&kv.key)
                    .is_some_and(|id| !registered.contains(&id))
            })
            .collect();
        let mut deleted = 0;
        for kv in stale_heartbeats {
            if self.store.delete(&kv.key).await? {
                deleted += 1;
            }
        }
        self.metrics.record_cleanup_deleted("heartbeat", deleted);

        let mut dangling: BTreeMap<WorkerId, Vec<(String, LogicTaskId)>> = BTreeMap::new();
        for kv in &assignments {
            if let Some((worker, task)) = self.keys.parse_assignment_key(&kv.key) {
                if !registered.contains(&worker) {
                    dangling.entry(worker).or_default().push((kv.key.clone(), task));
                }
            }
        }
        let mut deleted = 0;
        for (worker_id, entries) in dangling {
            self.emit_orphaned(
                worker_id,
                entries.iter().map(|(_, task)| task.clone()).collect(),
            );
            for (key, _) in entries {
                if self.store.delete(&key).await? {
                    deleted += 1;
                }
            }
        }
        self.metrics.record_cleanup_deleted("assignment", deleted);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(id: &str) -> WorkerId {
        WorkerId::new(id).unwrap()
    }

    fn t(id: &str) -> LogicTaskId {
        LogicTaskId::new(id).unwrap()
    }

    #[test]
    fn insert_moves_task_between_workers() {
        let mut map = TaskWorkerMap::new();
        map.insert(w("a"), t("1"));
        map.insert(w("b"), t("1"));
        assert_eq!(map.worker_of(&t("1")), Some(&w("b")));
        assert!(map.tasks_of(&w("a")).is_empty());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remove_requires_matching_owner() {
        let mut map = TaskWorkerMap::new();
        map.insert(w("a"), t("1"));
        assert!(!map.remove(&w("b"), &t("1")));
        assert!(map.remove(&w("a"), &t("1")));
        assert!(map.is_empty());
    }

    #[test]
    fn remove_worker_returns_all_tasks() {
        let mut map = TaskWorkerMap::new();
        map.add_worker(w("a"));
        map.insert(w("a"), t("1"));
        map.insert(w("a"), t("2"));
        map.insert(w("b"), t("3"));

        let tasks = map.remove_worker(&w("a"));
        assert_eq!(tasks.into_iter().collect::<Vec<_>>(), vec![t("1"), t("2")]);
        assert!(!map.has_worker(&w("a")));
        assert_eq!(map.worker_of(&t("1")), None);
        assert_eq!(map.assignments(), vec![(w("b"), t("3"))]);
    }
}
