//! Error types for the coordination subsystem.

use keel_core::{PipelineId, QueueId, WorkerId};

/// The result type used throughout keel-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in coordination operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A worker was not registered.
    #[error("worker not found: {worker_id}")]
    WorkerNotFound {
        /// The worker ID that was not found.
        worker_id: WorkerId,
    },

    /// A pipeline is unknown to the persistence layer.
    #[error("pipeline not found: {pipeline_id}")]
    PipelineNotFound {
        /// The pipeline ID that was not found.
        pipeline_id: PipelineId,
    },

    /// A queue configuration is unknown to the persistence layer.
    #[error("queue not found: {queue_id}")]
    QueueNotFound {
        /// The queue ID that was not found.
        queue_id: QueueId,
    },

    /// The operation must run on the elected leader.
    #[error("this process is not the leader")]
    NotLeader,

    /// Required configuration is missing or invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// The operation was cancelled (shutdown or leadership lost).
    #[error("operation cancelled")]
    Cancelled,

    /// An error from keel-core.
    #[error("core error: {0}")]
    Core(#[from] keel_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns true if retrying the same operation later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage { .. } => true,
            Self::Core(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
