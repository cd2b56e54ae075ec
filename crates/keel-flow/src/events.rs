//! Pipeline lifecycle events emitted to the surrounding platform.
//!
//! The engine reports outcomes the platform must surface to users (for
//! example a pipeline that could not be admitted) through an [`EventSink`].
//! Event IDs are ULIDs so envelopes sort chronologically.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use keel_core::{PipelineId, QueueId};

use crate::error::{Error, Result};

/// Event payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEventData {
    /// The pipeline entered dispatch, directly or through a queue.
    Admitted {
        /// The queue the pipeline waited in, if any.
        queue_id: Option<QueueId>,
    },
    /// Admission failed after every attempt; the pipeline was marked failed.
    AdmissionFailed {
        /// Last error observed.
        reason: String,
        /// Attempts made.
        attempts: u32,
    },
}

/// An event about one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEvent {
    /// Unique event identifier (ULID).
    pub id: String,
    /// The pipeline the event is about.
    pub pipeline_id: PipelineId,
    /// When the event was produced.
    pub time: DateTime<Utc>,
    /// Event payload.
    pub data: PipelineEventData,
}

impl PipelineEvent {
    /// Creates an event stamped with a fresh ID and the current time.
    #[must_use]
    pub fn new(pipeline_id: PipelineId, data: PipelineEventData) -> Self {
        Self {
            id: Ulid::new().to_string(),
            pipeline_id,
            time: Utc::now(),
            data,
        }
    }
}

/// Destination for pipeline events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits one event.
    async fn emit(&self, event: PipelineEvent) -> Result<()>;
}

/// Event sink that keeps every event in memory. For tests and the standalone binary.
#[derive(Debug, Default)]
pub struct InMemoryEventSink {
    events: RwLock<Vec<PipelineEvent>>,
}

impl InMemoryEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every event emitted so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn events(&self) -> Result<Vec<PipelineEvent>> {
        Ok(self.events.read().map_err(poison_err)?.clone())
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Core(keel_core::Error::internal("event sink lock poisoned"))
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn emit(&self, event: PipelineEvent) -> Result<()> {
        tracing::info!(pipeline_id = %event.pipeline_id, event = ?event.data, "pipeline event");
        self.events.write().map_err(poison_err)?.push(event);
        Ok(())
    }
}
