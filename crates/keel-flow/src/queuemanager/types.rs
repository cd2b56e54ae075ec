//! Queue records exchanged through the coordination store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use keel_core::{PipelineId, QueueId};

use crate::error::Error;

/// A queue mutation, written under `{prefix}/queue-input/{queue}/{event}` by
/// any process and applied by the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum QueueMutation {
    /// Admit a pipeline.
    #[serde(rename_all = "camelCase")]
    Put {
        /// Pipeline to admit.
        pipeline_id: PipelineId,
        /// Admission priority; higher is released first.
        priority: i64,
    },
    /// Move the listed pending pipelines to the front, in this order.
    #[serde(rename_all = "camelCase")]
    Reorder {
        /// New release order.
        pipeline_ids: Vec<PipelineId>,
    },
    /// Remove a pending pipeline before it is released.
    #[serde(rename_all = "camelCase")]
    PopOut {
        /// Pipeline to remove.
        pipeline_id: PipelineId,
    },
}

/// How a pipeline left its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReleaseOutcome {
    /// Released for dispatch.
    Released,
    /// Removed before release.
    PoppedOut,
}

/// Notice written by the leader under `{prefix}/queue-release/{pipeline}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseNotice {
    /// The pipeline.
    pub pipeline_id: PipelineId,
    /// The queue it left.
    pub queue_id: QueueId,
    /// Released or popped out.
    pub outcome: ReleaseOutcome,
    /// When the leader decided.
    pub time: DateTime<Utc>,
}

impl ReleaseNotice {
    /// Creates a notice stamped now.
    #[must_use]
    pub fn new(pipeline_id: PipelineId, queue_id: QueueId, outcome: ReleaseOutcome) -> Self {
        Self {
            pipeline_id,
            queue_id,
            outcome,
            time: Utc::now(),
        }
    }
}

/// Resolves when the leader releases or pops out an admitted pipeline.
#[derive(Debug)]
pub struct ReleaseHandle {
    pipeline_id: PipelineId,
    rx: oneshot::Receiver<ReleaseNotice>,
}

impl ReleaseHandle {
    pub(crate) fn new(pipeline_id: PipelineId, rx: oneshot::Receiver<ReleaseNotice>) -> Self {
        Self { pipeline_id, rx }
    }

    /// The admitted pipeline.
    #[must_use]
    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    /// Waits for the pipeline to leave its queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the queue manager shuts down first.
    pub async fn released(self) -> Result<ReleaseNotice, Error> {
        self.rx.await.map_err(|_| Error::Cancelled)
    }
}

/// Why a pipeline could not be admitted.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// The pipeline does not exist.
    #[error("pipeline not found: {0}")]
    PipelineNotFound(PipelineId),

    /// The pipeline is not routed through a queue.
    #[error("pipeline {0} has no queue")]
    NoQueue(PipelineId),

    /// The pipeline's queue configuration does not exist.
    #[error("queue not found: {0}")]
    QueueNotFound(QueueId),

    /// The pipeline already reached a terminal status.
    #[error("pipeline {0} already finished")]
    AlreadyFinished(PipelineId),

    /// Reading records or writing the admission event failed.
    #[error("admission failed: {0}")]
    Store(#[source] Error),
}

impl AdmissionError {
    /// Returns true if the caller should retry admission later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::PipelineNotFound(_)
            | Self::NoQueue(_)
            | Self::QueueNotFound(_)
            | Self::AlreadyFinished(_) => false,
        }
    }
}

impl From<Error> for AdmissionError {
    fn from(e: Error) -> Self {
        Self::Store(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_json_shape() {
        let put = QueueMutation::Put {
            pipeline_id: PipelineId::new(42),
            priority: 3,
        };
        let json = serde_json::to_value(&put).unwrap();
        assert_eq!(json, serde_json::json!({"op": "put", "pipelineId": 42, "priority": 3}));

        let parsed: QueueMutation =
            serde_json::from_str(r#"{"op":"reorder","pipelineIds":[3,1,2]}"#).unwrap();
        assert_eq!(
            parsed,
            QueueMutation::Reorder {
                pipeline_ids: vec![PipelineId::new(3), PipelineId::new(1), PipelineId::new(2)]
            }
        );
    }

    #[test]
    fn release_handle_waits_for_notice() {
        let (tx, rx) = oneshot::channel();
        let handle = ReleaseHandle::new(PipelineId::new(1), rx);
        let mut released = tokio_test::task::spawn(handle.released());
        tokio_test::assert_pending!(released.poll());

        tx.send(ReleaseNotice::new(PipelineId::new(1), QueueId::new(2), ReleaseOutcome::Released))
            .unwrap();
        assert!(released.is_woken());
        let notice = tokio_test::assert_ready_ok!(released.poll());
        assert_eq!(notice.queue_id, QueueId::new(2));
    }

    #[test]
    fn release_handle_cancelled_when_sender_dropped() {
        let (tx, rx) = oneshot::channel::<ReleaseNotice>();
        drop(tx);
        let result = tokio_test::block_on(ReleaseHandle::new(PipelineId::new(1), rx).released());
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn retryability() {
        assert!(AdmissionError::Store(Error::storage("timeout")).is_retryable());
        assert!(!AdmissionError::Store(Error::serialization("bad")).is_retryable());
        assert!(!AdmissionError::PipelineNotFound(PipelineId::new(1)).is_retryable());
        assert!(!AdmissionError::QueueNotFound(QueueId::new(1)).is_retryable());
    }
}
