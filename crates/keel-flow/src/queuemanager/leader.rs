//! Leader side of the queue manager: recovery, mutation application and
//! release decisions.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use keel_core::coord::KeyValue;
use keel_core::coord::watch::{PrefixEvent, spawn_prefix_watch};
use keel_core::{LogicTaskId, PipelineId, QueueId};

use super::{PriorityQueue, QueueManager, QueueMutation, ReleaseNotice, ReleaseOutcome};
use crate::error::Result;
use crate::leaderworker::{LogicTask, TaskEvent};
use crate::persistence::{PipelineQueue, PipelineStatus};

const INPUT_WATCH_CAPACITY: usize = 1024;

#[derive(Debug)]
struct QueueState {
    config: PipelineQueue,
    pending: PriorityQueue,
    running: BTreeSet<PipelineId>,
}

/// Everything the leader knows about queues during one term.
#[derive(Debug, Default)]
struct LeaderQueues {
    queues: HashMap<QueueId, QueueState>,
    /// Pipelines to re-dispatch once the recovery grace period passes.
    reload: Vec<PipelineId>,
}

fn pipeline_task(pipeline_id: PipelineId) -> LogicTask {
    LogicTask::new(
        LogicTaskId::from(pipeline_id),
        Bytes::from(pipeline_id.to_string()),
    )
}

impl QueueManager {
    /// Leader loop: rebuilds queue state from persisted statuses, then
    /// applies queue mutations and releases pipelines until `term` is
    /// cancelled.
    ///
    /// `task_events` must be subscribed before the failover coordinator
    /// starts so no finished assignment of the term is missed.
    pub async fn run_as_leader(
        self: Arc<Self>,
        mut task_events: broadcast::Receiver<TaskEvent>,
        term: CancellationToken,
    ) {
        let Some(mut state) = self.recover(&term).await else {
            return;
        };
        self.spawn_reload(std::mem::take(&mut state.reload), &term);
        let queue_ids: Vec<QueueId> = state.queues.keys().copied().collect();
        for queue_id in queue_ids {
            self.release_ready(&mut state, queue_id, &term).await;
        }

        let mut inputs = spawn_prefix_watch(
            Arc::clone(&self.store),
            self.keys.queue_input_prefix(),
            INPUT_WATCH_CAPACITY,
            self.retry_interval,
            term.clone(),
        );
        loop {
            tokio::select! {
                () = term.cancelled() => return,
                event = inputs.recv() => match event {
                    Some(PrefixEvent::Snapshot(mut kvs)) => {
                        // Apply in write order, not key order.
                        kvs.sort_by_key(|kv| kv.mod_revision);
                        for kv in kvs {
                            self.apply_input(&mut state, &kv, &term).await;
                        }
                    }
                    Some(PrefixEvent::Change(change)) if change.is_put() => {
                        self.apply_input(&mut state, &change.kv, &term).await;
                    }
                    Some(PrefixEvent::Change(_)) => {}
                    None => return,
                },
                event = task_events.recv() => match event {
                    Ok(TaskEvent::Finished { task, .. }) => {
                        if let Some(pipeline_id) = task.as_pipeline_id() {
                            self.on_finished(&mut state, pipeline_id, &term).await;
                        }
                    }
                    Ok(TaskEvent::Orphaned { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "queue task events lagged, resyncing running pipelines");
                        self.resync_running(&mut state, &term).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    async fn recover(&self, term: &CancellationToken) -> Option<LeaderQueues> {
        loop {
            match self.try_recover().await {
                Ok(state) => {
                    tracing::info!(
                        queues = state.queues.len(),
                        reload = state.reload.len(),
                        "queue state recovered"
                    );
                    return Some(state);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "queue recovery failed, retrying");
                }
            }
            tokio::select! {
                () = term.cancelled() => return None,
                () = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    async fn try_recover(&self) -> Result<LeaderQueues> {
        let mut state = LeaderQueues::default();
        let ids = self
            .pipelines
            .list_ids_by_statuses(&PipelineStatus::RECOVERABLE)
            .await?;
        for id in ids {
            let Some(pipeline) = self.pipelines.get_pipeline(id).await? else {
                continue;
            };
            match (pipeline.status, pipeline.queue_id) {
                (PipelineStatus::Running, queue_id) => {
                    if let Some(queue_id) = queue_id {
                        if let Some(queue) = self.queue_state(&mut state, queue_id).await? {
                            queue.running.insert(id);
                        }
                    }
                    state.reload.push(id);
                }
                (PipelineStatus::Queue, Some(queue_id)) => {
                    if let Some(queue) = self.queue_state(&mut state, queue_id).await? {
                        queue.pending.push(id, pipeline.priority);
                    }
                }
                (PipelineStatus::Queue, None) => state.reload.push(id),
                _ => {}
            }
        }
        Ok(state)
    }

    /// Loads a queue's configuration on first use. `None` if the queue no
    /// longer exists.
    async fn queue_state<'a>(
        &self,
        state: &'a mut LeaderQueues,
        queue_id: QueueId,
    ) -> Result<Option<&'a mut QueueState>> {
        if !state.queues.contains_key(&queue_id) {
            let Some(config) = self.pipelines.get_queue(queue_id).await? else {
                tracing::warn!(queue_id = %queue_id, "queue not found, ignoring its pipelines");
                return Ok(None);
            };
            state.queues.insert(
                queue_id,
                QueueState {
                    config,
                    pending: PriorityQueue::new(),
                    running: BTreeSet::new(),
                },
            );
        }
        Ok(state.queues.get_mut(&queue_id))
    }

    /// Re-dispatches recovered running pipelines after the grace period.
    /// Pipelines still held by a live worker resolve as already assigned.
    fn spawn_reload(self: &Arc<Self>, reload: Vec<PipelineId>, term: &CancellationToken) {
        if reload.is_empty() {
            return;
        }
        let this = Arc::clone(self);
        let term = term.clone();
        let delay = self.config.reload_running_interval;
        tokio::spawn(async move {
            tokio::select! {
                () = term.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            tracing::info!(count = reload.len(), "re-dispatching recovered pipelines");
            for pipeline_id in reload {
                drop(this.dispatcher.submit(pipeline_task(pipeline_id), term.clone()));
            }
        });
    }

    /// Applies one input event, then deletes it.
    ///
    /// Transient failures are retried for as long as the term lasts; if the
    /// term ends first the event stays in the store for the next leader.
    async fn apply_input(&self, state: &mut LeaderQueues, kv: &KeyValue, term: &CancellationToken) {
        let queue_id = self.keys.parse_queue_input_key(&kv.key).map(|(queue_id, _)| queue_id);
        match (queue_id, serde_json::from_slice::<QueueMutation>(&kv.value)) {
            (Some(queue_id), Ok(mutation)) => loop {
                match self.apply_mutation(state, queue_id, mutation.clone(), term).await {
                    Ok(()) => break,
                    Err(e) if e.is_transient() => {
                        tracing::warn!(key = %kv.key, error = %e, "failed to apply queue mutation, retrying");
                        tokio::select! {
                            () = term.cancelled() => return,
                            () = tokio::time::sleep(self.retry_interval) => {}
                        }
                    }
                    Err(e) => {
                        tracing::error!(key = %kv.key, error = %e, "dropping queue mutation");
                        break;
                    }
                }
            },
            (_, Err(e)) => tracing::warn!(key = %kv.key, error = %e, "malformed queue mutation"),
            (None, Ok(_)) => tracing::warn!(key = %kv.key, "queue mutation under unexpected key"),
        }
        if let Err(e) = self.store.delete(&kv.key).await {
            tracing::warn!(key = %kv.key, error = %e, "failed to delete queue mutation");
        }
    }

    async fn apply_mutation(
        &self,
        state: &mut LeaderQueues,
        queue_id: QueueId,
        mutation: QueueMutation,
        term: &CancellationToken,
    ) -> Result<()> {
        let Some(queue) = self.queue_state(state, queue_id).await? else {
            return Ok(());
        };
        // Store and persistence writes come before the in-memory change, so a
        // failed attempt leaves the state untouched for the retry.
        match mutation {
            QueueMutation::Put {
                pipeline_id,
                priority,
            } => {
                if queue.running.contains(&pipeline_id) {
                    tracing::debug!(pipeline_id = %pipeline_id, "pipeline already released");
                } else if !queue.pending.contains(pipeline_id) {
                    // A notice from an earlier admission must not resolve this one.
                    self.store.delete(&self.keys.release_key(pipeline_id)).await?;
                    queue.pending.push(pipeline_id, priority);
                    tracing::debug!(pipeline_id = %pipeline_id, queue_id = %queue_id, priority, "pipeline queued");
                }
            }
            QueueMutation::Reorder { pipeline_ids } => {
                queue.pending.reorder(&pipeline_ids);
                tracing::debug!(queue_id = %queue_id, order = ?queue.pending.pipeline_ids(), "queue reordered");
            }
            QueueMutation::PopOut { pipeline_id } => {
                if queue.pending.contains(pipeline_id) {
                    self.pipelines
                        .update_status(pipeline_id, PipelineStatus::StopByUser)
                        .await?;
                    queue.pending.remove(pipeline_id);
                    self.put_notice(
                        ReleaseNotice::new(pipeline_id, queue_id, ReleaseOutcome::PoppedOut),
                        term,
                    )
                    .await;
                    tracing::info!(pipeline_id = %pipeline_id, queue_id = %queue_id, "pipeline popped out");
                }
            }
        }
        self.release_ready(state, queue_id, term).await;
        Ok(())
    }

    /// Releases pending pipelines while the queue has free capacity.
    async fn release_ready(&self, state: &mut LeaderQueues, queue_id: QueueId, term: &CancellationToken) {
        let Some(queue) = state.queues.get_mut(&queue_id) else {
            return;
        };
        while queue.running.len() < queue.config.concurrency {
            let Some(pipeline_id) = queue.pending.pop() else {
                break;
            };
            queue.running.insert(pipeline_id);
            self.release(queue_id, pipeline_id, term).await;
        }
        self.metrics
            .set_queue_depth(&queue_id.to_string(), queue.pending.len());
    }

    async fn release(&self, queue_id: QueueId, pipeline_id: PipelineId, term: &CancellationToken) {
        if let Err(e) = self
            .pipelines
            .update_status(pipeline_id, PipelineStatus::Running)
            .await
        {
            tracing::warn!(pipeline_id = %pipeline_id, error = %e, "failed to mark pipeline running");
        }
        drop(self.dispatcher.submit(pipeline_task(pipeline_id), term.clone()));
        self.put_notice(
            ReleaseNotice::new(pipeline_id, queue_id, ReleaseOutcome::Released),
            term,
        )
        .await;
        self.metrics.record_queue_release(&queue_id.to_string());
        tracing::info!(pipeline_id = %pipeline_id, queue_id = %queue_id, "pipeline released");
    }

    /// Writes a release notice, retrying until it is stored or the term ends.
    async fn put_notice(&self, notice: ReleaseNotice, term: &CancellationToken) {
        let key = self.keys.release_key(notice.pipeline_id);
        let value = match serde_json::to_vec(&notice) {
            Ok(value) => Bytes::from(value),
            Err(e) => {
                tracing::error!(pipeline_id = %notice.pipeline_id, error = %e, "failed to encode release notice");
                return;
            }
        };
        loop {
            match self.store.put(&key, value.clone()).await {
                Ok(_) => return,
                Err(e) => {
                    tracing::warn!(pipeline_id = %notice.pipeline_id, error = %e, "failed to write release notice, retrying");
                }
            }
            tokio::select! {
                () = term.cancelled() => return,
                () = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    async fn on_finished(&self, state: &mut LeaderQueues, pipeline_id: PipelineId, term: &CancellationToken) {
        let Some(queue_id) = state
            .queues
            .iter_mut()
            .find_map(|(id, queue)| queue.running.remove(&pipeline_id).then_some(*id))
        else {
            return;
        };
        if let Err(e) = self.store.delete(&self.keys.release_key(pipeline_id)).await {
            tracing::warn!(pipeline_id = %pipeline_id, error = %e, "failed to delete release notice");
        }
        tracing::debug!(pipeline_id = %pipeline_id, queue_id = %queue_id, "queue slot freed");
        self.release_ready(state, queue_id, term).await;
    }

    /// Frees the slots of running pipelines that reached a terminal status
    /// while their finish notifications were missed.
    async fn resync_running(&self, state: &mut LeaderQueues, term: &CancellationToken) {
        let running: Vec<PipelineId> = state
            .queues
            .values()
            .flat_map(|queue| queue.running.iter().copied())
            .collect();
        for pipeline_id in running {
            match self.pipelines.get_pipeline(pipeline_id).await {
                Ok(Some(pipeline)) if !pipeline.status.is_terminal() => {}
                Ok(_) => self.on_finished(state, pipeline_id, term).await,
                Err(e) => {
                    tracing::warn!(pipeline_id = %pipeline_id, error = %e, "failed to read pipeline during resync");
                }
            }
        }
    }
}
