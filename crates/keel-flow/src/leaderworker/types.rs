//! Worker, logic task and notification types.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use keel_core::{LogicTaskId, WorkerId};

use crate::error::Result;

/// Registration stage of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    /// Just started; not yet eligible for dispatch.
    Candidate,
    /// Stable; a member of the dispatch ring.
    Official,
}

impl WorkerType {
    /// Key segment and JSON name of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Candidate => "candidate",
            Self::Official => "official",
        }
    }

    /// Parses a key segment.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "candidate" => Some(Self::Candidate),
            "official" => Some(Self::Official),
            _ => None,
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The dispatch-level handle of one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicTask {
    /// Deterministic ID, used as the hash key.
    pub id: LogicTaskId,
    /// Opaque payload stored in the assignment key.
    pub data: Bytes,
}

impl LogicTask {
    /// Creates a logic task.
    #[must_use]
    pub fn new(id: LogicTaskId, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }
}

/// Per-task context handed to a [`TaskHandler`].
///
/// The token is cancelled when the assignment key is deleted (task cancelled
/// or reassigned) or when the worker stops.
#[derive(Debug, Clone)]
pub struct TaskContext {
    worker_id: WorkerId,
    cancel: CancellationToken,
}

impl TaskContext {
    /// Creates a context.
    #[must_use]
    pub fn new(worker_id: WorkerId, cancel: CancellationToken) -> Self {
        Self { worker_id, cancel }
    }

    /// The worker running the task.
    #[must_use]
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Token tied to the assignment key's lifetime.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns true once the task has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes when the task is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// Executes logic tasks assigned to a worker.
///
/// Delivery is at-least-once: a handler may be invoked again for the same
/// task after a crash or failover, and must tolerate that.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Handles one task. Should return promptly once `ctx` is cancelled.
    async fn handle(&self, ctx: TaskContext, task: LogicTask) -> Result<()>;
}

struct FnTaskHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnTaskHandler<F>
where
    F: Fn(TaskContext, LogicTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: TaskContext, task: LogicTask) -> Result<()> {
        (self.0)(ctx, task).await
    }
}

/// Wraps an async closure as a [`TaskHandler`].
///
/// ```rust
/// use keel_flow::leaderworker::handler_fn;
///
/// let handler = handler_fn(|ctx, task| async move {
///     tracing::info!(worker_id = %ctx.worker_id(), logic_task_id = %task.id, "running");
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskContext, LogicTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnTaskHandler(f))
}

/// A participant capable of executing dispatched logic tasks.
#[derive(Clone)]
pub struct Worker {
    /// Opaque unique ID.
    pub id: WorkerId,
    /// Registration stage.
    pub worker_type: WorkerType,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    handlers: Vec<Arc<dyn TaskHandler>>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("worker_type", &self.worker_type)
            .field("created_at", &self.created_at)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl PartialEq for Worker {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.worker_type == other.worker_type
            && self.created_at == other.created_at
    }
}

/// Wire form of a worker registration. Every field is optional so malformed
/// records can be told apart from unreadable ones.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerRecord {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "type")]
    worker_type: Option<WorkerType>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl Worker {
    /// Creates a new local candidate worker with a generated ID.
    #[must_use]
    pub fn new(handlers: Vec<Arc<dyn TaskHandler>>) -> Self {
        Self::with_id(WorkerId::generate(), handlers)
    }

    /// Creates a new local candidate worker with a given ID.
    #[must_use]
    pub fn with_id(id: WorkerId, handlers: Vec<Arc<dyn TaskHandler>>) -> Self {
        Self {
            id,
            worker_type: WorkerType::Candidate,
            created_at: Utc::now(),
            handlers,
        }
    }

    /// Handlers executed for each assigned task, in order.
    #[must_use]
    pub fn handlers(&self) -> &[Arc<dyn TaskHandler>] {
        &self.handlers
    }

    /// Returns a copy of the worker with a different type.
    #[must_use]
    pub fn with_type(&self, worker_type: WorkerType) -> Self {
        Self {
            worker_type,
            ..self.clone()
        }
    }

    /// Serializes the registration record.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn to_json(&self) -> Result<Bytes> {
        let record = WorkerRecord {
            id: Some(self.id.to_string()),
            worker_type: Some(self.worker_type),
            created_at: Some(self.created_at),
        };
        Ok(Bytes::from(serde_json::to_vec(&record)?))
    }

    /// Parses and readiness-checks a registration record read from `key`.
    ///
    /// # Errors
    ///
    /// Returns [`keel_core::Error::InvalidRecord`] for unreadable payloads and
    /// records with missing fields.
    pub fn from_json(key: &str, value: &[u8]) -> keel_core::Result<Self> {
        let record: WorkerRecord = serde_json::from_slice(value)
            .map_err(|e| keel_core::Error::invalid_record(key, e.to_string()))?;
        let id = record
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| keel_core::Error::invalid_record(key, "missing id"))?;
        let id = WorkerId::new(id).map_err(|e| keel_core::Error::invalid_record(key, e.to_string()))?;
        let worker_type = record
            .worker_type
            .ok_or_else(|| keel_core::Error::invalid_record(key, "missing type"))?;
        let created_at = record
            .created_at
            .ok_or_else(|| keel_core::Error::invalid_record(key, "missing createdAt"))?;
        Ok(Self {
            id,
            worker_type,
            created_at,
            handlers: Vec::new(),
        })
    }
}

/// Change in the set of official workers, as seen by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// The full official set after the watch was (re)established.
    Snapshot(Vec<WorkerId>),
    /// A worker became official.
    Added(WorkerId),
    /// A worker left the official set.
    Removed(WorkerId),
}

/// Leader-side task notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// A worker disappeared while owning these tasks; each must be redispatched.
    Orphaned {
        /// The worker that disappeared.
        worker_id: WorkerId,
        /// Every logic task it owned, without duplicates.
        tasks: Vec<LogicTaskId>,
    },
    /// A registered worker released a task (completed or cancelled).
    Finished {
        /// The worker that held the task.
        worker_id: WorkerId,
        /// The released task.
        task: LogicTaskId,
    },
}
