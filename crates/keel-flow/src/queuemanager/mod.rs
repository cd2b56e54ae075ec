//! Admission queues in front of the dispatcher.
//!
//! Any process may admit, reorder or pop out pipelines; it does so by writing
//! a [`QueueMutation`] under `{prefix}/queue-input/{queue}/{event}`. Only the
//! leader applies mutations, so there is a single ordering decision-maker:
//!
//! ```text
//!   put/reorder/pop-out ──▶ queue-input/{queue}/{ulid} ──▶ leader applies
//!                                                             │
//!        waiter resolved ◀── queue-release/{pipeline} ◀──────┤ release or pop out
//!                                                             ▼
//!                                                   dispatcher.submit
//! ```
//!
//! Every process runs [`QueueManager::run_release_watcher`], which resolves
//! the [`ReleaseHandle`]s it handed out when the leader's release notices
//! appear. A queue releases pipelines while fewer than its configured
//! concurrency are running; a running pipeline frees its slot when its
//! assignment is released by the worker.

mod leader;
mod queue;
mod types;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use keel_core::coord::watch::{PrefixEvent, spawn_prefix_watch};
use keel_core::coord::{KeyValue, SharedStore};
use keel_core::{PipelineId, QueueId};

use crate::config::{LeaderConfig, QueueConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::keys::KeyLayout;
use crate::metrics::EngineMetrics;
use crate::persistence::{PipelineStatus, PipelineStore};

pub use queue::PriorityQueue;
pub use types::{
    AdmissionError, QueueMutation, ReleaseHandle, ReleaseNotice, ReleaseOutcome,
};

const RELEASE_WATCH_CAPACITY: usize = 256;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Core(keel_core::Error::internal("queue waiter lock poisoned"))
}

/// Queue admission and, on the leader, release decisions.
#[derive(Debug)]
pub struct QueueManager {
    store: SharedStore,
    keys: KeyLayout,
    config: QueueConfig,
    retry_interval: Duration,
    pipelines: Arc<dyn PipelineStore>,
    dispatcher: Arc<Dispatcher>,
    metrics: EngineMetrics,
    waiters: Mutex<HashMap<PipelineId, Vec<oneshot::Sender<ReleaseNotice>>>>,
}

impl QueueManager {
    /// Creates a queue manager.
    #[must_use]
    pub fn new(
        store: SharedStore,
        keys: KeyLayout,
        config: QueueConfig,
        leader_config: &LeaderConfig,
        pipelines: Arc<dyn PipelineStore>,
        dispatcher: Arc<Dispatcher>,
        metrics: EngineMetrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            keys,
            config,
            retry_interval: leader_config.listing_retry_interval,
            pipelines,
            dispatcher,
            metrics,
            waiters: Mutex::new(HashMap::new()),
        })
    }

    /// Admits a pipeline into its queue.
    ///
    /// The pipeline is marked [`PipelineStatus::Queue`] and an admission
    /// event is written for the leader. The returned handle resolves when the
    /// leader releases or pops out the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an [`AdmissionError`]; [`AdmissionError::is_retryable`] tells
    /// the caller whether trying again later may succeed.
    pub async fn put_pipeline_into_queue(
        &self,
        pipeline_id: PipelineId,
    ) -> std::result::Result<ReleaseHandle, AdmissionError> {
        let pipeline = self
            .pipelines
            .get_pipeline(pipeline_id)
            .await?
            .ok_or(AdmissionError::PipelineNotFound(pipeline_id))?;
        if pipeline.status.is_terminal() {
            return Err(AdmissionError::AlreadyFinished(pipeline_id));
        }
        let queue_id = pipeline
            .queue_id
            .ok_or(AdmissionError::NoQueue(pipeline_id))?;
        if self.pipelines.get_queue(queue_id).await?.is_none() {
            return Err(AdmissionError::QueueNotFound(queue_id));
        }

        let (tx, rx) = oneshot::channel();
        self.add_waiter(pipeline_id, tx)?;
        let admitted = async {
            self.pipelines
                .update_status(pipeline_id, PipelineStatus::Queue)
                .await?;
            self.write_mutation(
                queue_id,
                &QueueMutation::Put {
                    pipeline_id,
                    priority: pipeline.priority,
                },
            )
            .await
        }
        .await;

        if let Err(e) = admitted {
            drop(rx);
            self.prune_waiters(pipeline_id);
            tracing::warn!(pipeline_id = %pipeline_id, queue_id = %queue_id, error = %e, "admission failed");
            return Err(AdmissionError::Store(e));
        }
        tracing::info!(pipeline_id = %pipeline_id, queue_id = %queue_id, "pipeline admitted");
        Ok(ReleaseHandle::new(pipeline_id, rx))
    }

    /// Reorders the pending pipelines of a queue: the listed ones are
    /// released first, in the listed order.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the mutation cannot be written.
    pub async fn batch_update_pipeline_priority_in_queue(
        &self,
        queue_id: QueueId,
        pipeline_ids: &[PipelineId],
    ) -> Result<()> {
        self.write_mutation(
            queue_id,
            &QueueMutation::Reorder {
                pipeline_ids: pipeline_ids.to_vec(),
            },
        )
        .await
    }

    /// Removes a pipeline from its queue before release.
    ///
    /// Returns false without writing anything if the pipeline is not
    /// currently queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline cannot be read or the mutation
    /// cannot be written.
    pub async fn pop_out_pipeline_from_queue(&self, pipeline_id: PipelineId) -> Result<bool> {
        let Some(pipeline) = self.pipelines.get_pipeline(pipeline_id).await? else {
            return Ok(false);
        };
        let (PipelineStatus::Queue, Some(queue_id)) = (pipeline.status, pipeline.queue_id) else {
            return Ok(false);
        };
        self.write_mutation(queue_id, &QueueMutation::PopOut { pipeline_id })
            .await?;
        tracing::info!(pipeline_id = %pipeline_id, queue_id = %queue_id, "pop-out requested");
        Ok(true)
    }

    async fn write_mutation(&self, queue_id: QueueId, mutation: &QueueMutation) -> Result<()> {
        let key = self
            .keys
            .queue_input_key(queue_id, &Ulid::new().to_string());
        let value = Bytes::from(serde_json::to_vec(mutation)?);
        self.store.put(&key, value).await?;
        Ok(())
    }

    fn add_waiter(&self, pipeline_id: PipelineId, tx: oneshot::Sender<ReleaseNotice>) -> Result<()> {
        self.waiters
            .lock()
            .map_err(poison_err)?
            .entry(pipeline_id)
            .or_default()
            .push(tx);
        Ok(())
    }

    fn prune_waiters(&self, pipeline_id: PipelineId) {
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = waiters.get_mut(&pipeline_id) {
            list.retain(|tx| !tx.is_closed());
            if list.is_empty() {
                waiters.remove(&pipeline_id);
            }
        }
    }

    /// Number of local waiters for a pipeline.
    #[must_use]
    pub fn waiter_count(&self, pipeline_id: PipelineId) -> usize {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pipeline_id)
            .map_or(0, Vec::len)
    }

    /// Resolves local release handles from the leader's notices until
    /// `cancel` fires. Runs in every process.
    pub async fn run_release_watcher(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = spawn_prefix_watch(
            Arc::clone(&self.store),
            self.keys.release_prefix(),
            RELEASE_WATCH_CAPACITY,
            self.retry_interval,
            cancel.clone(),
        );
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Some(PrefixEvent::Snapshot(kvs)) => kvs.iter().for_each(|kv| self.deliver(kv)),
                Some(PrefixEvent::Change(change)) if change.is_put() => self.deliver(&change.kv),
                Some(PrefixEvent::Change(_)) => {}
                None => return,
            }
        }
    }

    fn deliver(&self, kv: &KeyValue) {
        let notice: ReleaseNotice = match serde_json::from_slice(&kv.value) {
            Ok(notice) => notice,
            Err(e) => {
                tracing::warn!(key = %kv.key, error = %e, "malformed release notice");
                return;
            }
        };
        let waiters = self
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&notice.pipeline_id)
            .unwrap_or_default();
        if !waiters.is_empty() {
            tracing::debug!(pipeline_id = %notice.pipeline_id, outcome = ?notice.outcome, "release notice delivered");
        }
        for tx in waiters {
            let _ = tx.send(notice.clone());
        }
    }
}

#[cfg(test)]
mod tests;
