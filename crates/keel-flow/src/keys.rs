//! Coordination-store key layout.
//!
//! ```text
//! {prefix}/worker/type/official/{workerID}                 -> worker registration JSON
//! {prefix}/worker/type/candidate/{workerID}                -> worker registration JSON
//! {prefix}/heartbeat/{workerID}                            -> unix seconds
//! {prefix}/dispatch/worker/{workerID}/task/{logicTaskID}   -> task payload
//! {prefix}/election/{lockKey}                              -> leader instance id
//! {prefix}/queue-input/{queueID}/{eventID}                 -> queue mutation JSON
//! {prefix}/queue-release/{pipelineID}                      -> release notice JSON
//! ```
//!
//! The two queue segments are configurable.

use keel_core::{LogicTaskId, PipelineId, QueueId, WorkerId};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::leaderworker::WorkerType;

/// Builds and parses every key the engine reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
    incoming: String,
    release: String,
}

impl KeyLayout {
    /// Creates a layout with the default queue segments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the prefix is empty.
    pub fn new(prefix: &str) -> Result<Self> {
        Self::with_queue_segments(prefix, "queue-input", "queue-release")
    }

    /// Creates a layout with custom queue segments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the prefix is empty.
    pub fn with_queue_segments(prefix: &str, incoming: &str, release: &str) -> Result<Self> {
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return Err(Error::configuration("coordination key prefix must not be empty"));
        }
        Ok(Self {
            prefix: prefix.to_string(),
            incoming: incoming.to_string(),
            release: release.to_string(),
        })
    }

    /// Creates the layout described by an engine configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the prefix is empty.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::with_queue_segments(
            &config.key_prefix,
            &config.queue.incoming_key_prefix,
            &config.queue.release_key_prefix,
        )
    }

    /// The normalised prefix, without a trailing slash.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Prefix covering both worker types.
    #[must_use]
    pub fn workers_prefix(&self) -> String {
        format!("{}/worker/type/", self.prefix)
    }

    /// Prefix of one worker type.
    #[must_use]
    pub fn worker_type_prefix(&self, worker_type: WorkerType) -> String {
        format!("{}/worker/type/{}/", self.prefix, worker_type.as_str())
    }

    /// Registry key of a worker.
    #[must_use]
    pub fn worker_key(&self, worker_type: WorkerType, id: &WorkerId) -> String {
        format!("{}{id}", self.worker_type_prefix(worker_type))
    }

    /// Parses a registry key into its type and worker ID.
    #[must_use]
    pub fn parse_worker_key(&self, key: &str) -> Option<(WorkerType, WorkerId)> {
        let rest = key.strip_prefix(&self.workers_prefix())?;
        let (kind, id) = rest.split_once('/')?;
        let worker_type = WorkerType::parse(kind)?;
        Some((worker_type, WorkerId::new(id).ok()?))
    }

    /// Prefix of every heartbeat key.
    #[must_use]
    pub fn heartbeat_prefix(&self) -> String {
        format!("{}/heartbeat/", self.prefix)
    }

    /// Heartbeat key of a worker.
    #[must_use]
    pub fn heartbeat_key(&self, id: &WorkerId) -> String {
        format!("{}{id}", self.heartbeat_prefix())
    }

    /// Parses a heartbeat key into its worker ID.
    #[must_use]
    pub fn parse_heartbeat_key(&self, key: &str) -> Option<WorkerId> {
        let id = key.strip_prefix(&self.heartbeat_prefix())?;
        WorkerId::new(id).ok()
    }

    /// Prefix of every assignment key.
    #[must_use]
    pub fn dispatch_prefix(&self) -> String {
        format!("{}/dispatch/worker/", self.prefix)
    }

    /// Prefix of one worker's assignment keys.
    #[must_use]
    pub fn worker_tasks_prefix(&self, id: &WorkerId) -> String {
        format!("{}{id}/task/", self.dispatch_prefix())
    }

    /// Assignment key of a logic task on a worker.
    #[must_use]
    pub fn assignment_key(&self, worker: &WorkerId, task: &LogicTaskId) -> String {
        format!("{}{task}", self.worker_tasks_prefix(worker))
    }

    /// Parses an assignment key into worker and logic task IDs.
    #[must_use]
    pub fn parse_assignment_key(&self, key: &str) -> Option<(WorkerId, LogicTaskId)> {
        let rest = key.strip_prefix(&self.dispatch_prefix())?;
        let (worker, task) = rest.split_once("/task/")?;
        Some((WorkerId::new(worker).ok()?, LogicTaskId::new(task).ok()?))
    }

    /// Election key for a lock name.
    #[must_use]
    pub fn election_key(&self, lock_key: &str) -> String {
        format!("{}/election/{lock_key}", self.prefix)
    }

    /// Prefix of every queue mutation event.
    #[must_use]
    pub fn queue_input_prefix(&self) -> String {
        format!("{}/{}/", self.prefix, self.incoming)
    }

    /// Key of one queue mutation event.
    #[must_use]
    pub fn queue_input_key(&self, queue: QueueId, event_id: &str) -> String {
        format!("{}{queue}/{event_id}", self.queue_input_prefix())
    }

    /// Parses a queue mutation key into queue ID and event ID.
    #[must_use]
    pub fn parse_queue_input_key(&self, key: &str) -> Option<(QueueId, String)> {
        let rest = key.strip_prefix(&self.queue_input_prefix())?;
        let (queue, event) = rest.split_once('/')?;
        if event.is_empty() || event.contains('/') {
            return None;
        }
        Some((queue.parse().ok()?, event.to_string()))
    }

    /// Prefix of every release notice.
    #[must_use]
    pub fn release_prefix(&self) -> String {
        format!("{}/{}/", self.prefix, self.release)
    }

    /// Release notice key of a pipeline.
    #[must_use]
    pub fn release_key(&self, pipeline: PipelineId) -> String {
        format!("{}{pipeline}", self.release_prefix())
    }

    /// Parses a release notice key into its pipeline ID.
    #[must_use]
    pub fn parse_release_key(&self, key: &str) -> Option<PipelineId> {
        key.strip_prefix(&self.release_prefix())?.parse().ok()
    }
}
