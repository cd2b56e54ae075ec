//! In-memory pipeline store for testing.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability
//! - **Single-process only**: Records are not shared across process boundaries

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use keel_core::{PipelineId, QueueId};

use super::{Pipeline, PipelineQueue, PipelineStatus, PipelineStore};
use crate::error::{Error, Result};

/// In-memory pipeline store.
///
/// ## Example
///
/// ```rust
/// use keel_core::PipelineId;
/// use keel_flow::persistence::Pipeline;
/// use keel_flow::persistence::memory::InMemoryPipelineStore;
///
/// let store = InMemoryPipelineStore::new();
/// store.insert_pipeline(Pipeline::new(PipelineId::new(42))).unwrap();
/// ```
#[derive(Debug, Default)]
pub struct InMemoryPipelineStore {
    pipelines: RwLock<BTreeMap<PipelineId, Pipeline>>,
    queues: RwLock<BTreeMap<QueueId, PipelineQueue>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryPipelineStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn insert_pipeline(&self, pipeline: Pipeline) -> Result<()> {
        self.pipelines
            .write()
            .map_err(poison_err)?
            .insert(pipeline.id, pipeline);
        Ok(())
    }

    /// Inserts or replaces a queue configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn insert_queue(&self, queue: PipelineQueue) -> Result<()> {
        self.queues.write().map_err(poison_err)?.insert(queue.id, queue);
        Ok(())
    }

    /// Current status of a pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn status_of(&self, id: PipelineId) -> Result<Option<PipelineStatus>> {
        Ok(self
            .pipelines
            .read()
            .map_err(poison_err)?
            .get(&id)
            .map(|p| p.status))
    }
}

#[async_trait]
impl PipelineStore for InMemoryPipelineStore {
    async fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        Ok(self.pipelines.read().map_err(poison_err)?.get(&id).cloned())
    }

    async fn update_status(&self, id: PipelineId, status: PipelineStatus) -> Result<()> {
        let mut pipelines = self.pipelines.write().map_err(poison_err)?;
        let Some(pipeline) = pipelines.get_mut(&id) else {
            drop(pipelines);
            return Err(Error::PipelineNotFound { pipeline_id: id });
        };
        pipeline.status = status;
        drop(pipelines);
        tracing::debug!(pipeline_id = %id, ?status, "pipeline status updated");
        Ok(())
    }

    async fn list_ids_by_statuses(&self, statuses: &[PipelineStatus]) -> Result<Vec<PipelineId>> {
        Ok(self
            .pipelines
            .read()
            .map_err(poison_err)?
            .values()
            .filter(|p| statuses.contains(&p.status))
            .map(|p| p.id)
            .collect())
    }

    async fn get_queue(&self, id: QueueId) -> Result<Option<PipelineQueue>> {
        Ok(self.queues.read().map_err(poison_err)?.get(&id).cloned())
    }
}
