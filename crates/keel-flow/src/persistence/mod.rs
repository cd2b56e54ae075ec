//! Persistence collaborator for pipeline records.
//!
//! Business records live outside the coordination store. The engine only
//! needs a narrow view of them: a pipeline's status, priority and queue, the
//! queue configuration, status updates, and the status listing used by the
//! leader's recovery pass.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_core::{PipelineId, QueueId};

use crate::error::Result;

/// Persisted lifecycle status of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PipelineStatus {
    /// Analyzed and waiting to be run.
    Analyzed,
    /// Admitted into a queue, waiting for release.
    Queue,
    /// Released and dispatched.
    Running,
    /// Finished successfully.
    Success,
    /// Finished with an error, or could not be admitted.
    Failed,
    /// Cancelled by a user.
    StopByUser,
}

impl PipelineStatus {
    /// Statuses the leader re-admits after a restart.
    pub const RECOVERABLE: [Self; 2] = [Self::Queue, Self::Running];

    /// Returns true for statuses a pipeline never leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::StopByUser)
    }
}

/// The engine's view of a pipeline record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    /// Pipeline ID.
    pub id: PipelineId,
    /// Current status.
    pub status: PipelineStatus,
    /// Queue the pipeline is admitted through; `None` bypasses queues.
    pub queue_id: Option<QueueId>,
    /// Admission priority; higher is released first.
    pub priority: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Pipeline {
    /// Creates an analyzed pipeline.
    #[must_use]
    pub fn new(id: PipelineId) -> Self {
        Self {
            id,
            status: PipelineStatus::Analyzed,
            queue_id: None,
            priority: 0,
            created_at: Utc::now(),
        }
    }

    /// Routes the pipeline through a queue.
    #[must_use]
    pub const fn with_queue(mut self, queue_id: QueueId) -> Self {
        self.queue_id = Some(queue_id);
        self
    }

    /// Sets the admission priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the status.
    #[must_use]
    pub const fn with_status(mut self, status: PipelineStatus) -> Self {
        self.status = status;
        self
    }
}

/// A queue configuration record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineQueue {
    /// Queue ID.
    pub id: QueueId,
    /// Display name.
    pub name: String,
    /// Maximum number of released pipelines running at once.
    pub concurrency: usize,
}

impl PipelineQueue {
    /// Creates a queue configuration.
    #[must_use]
    pub fn new(id: QueueId, name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            id,
            name: name.into(),
            concurrency,
        }
    }
}

/// Storage for pipeline and queue records.
#[async_trait]
pub trait PipelineStore: Send + Sync + std::fmt::Debug {
    /// Gets a pipeline by ID. Returns `None` if it does not exist.
    async fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>>;

    /// Updates a pipeline's status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PipelineNotFound`](crate::error::Error::PipelineNotFound)
    /// if the pipeline does not exist.
    async fn update_status(&self, id: PipelineId, status: PipelineStatus) -> Result<()>;

    /// Lists the IDs of pipelines in any of `statuses`, in ID order.
    async fn list_ids_by_statuses(&self, statuses: &[PipelineStatus]) -> Result<Vec<PipelineId>>;

    /// Gets a queue configuration by ID. Returns `None` if it does not exist.
    async fn get_queue(&self, id: QueueId) -> Result<Option<PipelineQueue>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(PipelineStatus::Success.is_terminal());
        assert!(PipelineStatus::Failed.is_terminal());
        assert!(PipelineStatus::StopByUser.is_terminal());
        assert!(!PipelineStatus::Queue.is_terminal());
        assert!(!PipelineStatus::Running.is_terminal());
    }

    #[test]
    fn status_serializes_camel_case() {
        let json = serde_json::to_string(&PipelineStatus::StopByUser).unwrap();
        assert_eq!(json, "\"stopByUser\"");
    }
}
