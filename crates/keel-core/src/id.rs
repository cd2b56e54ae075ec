//! Strongly-typed identifiers for keel entities.
//!
//! Worker and logic-task identifiers become path segments of coordination-store
//! keys, so they are validated on construction: never empty, never containing
//! `/`. Pipeline and queue identifiers are the numeric IDs issued by the
//! persistence layer.
//!
//! # Example
//!
//! ```rust
//! use keel_core::id::{LogicTaskId, PipelineId, WorkerId};
//!
//! let worker = WorkerId::generate();
//! let task: LogicTaskId = PipelineId::new(7).into();
//!
//! assert!(WorkerId::new("bad/id").is_err());
//! # let _ = (worker, task);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

fn validate_segment(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidInput(format!("{kind} must not be empty")));
    }
    if value.contains('/') {
        return Err(Error::InvalidInput(format!(
            "{kind} '{value}' must not contain '/'"
        )));
    }
    Ok(())
}

/// A unique identifier for a worker process.
///
/// Opaque to the rest of the fleet; generated once per registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerId(String);

impl WorkerId {
    /// Generates a new unique worker ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Creates a worker ID from an existing string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the value is empty or contains `/`.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        validate_segment("worker id", &value)?;
        Ok(Self(value))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WorkerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for WorkerId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<WorkerId> for String {
    fn from(id: WorkerId) -> Self {
        id.0
    }
}

/// The dispatch-level identifier of one unit of work.
///
/// Derived deterministically from the domain identifier, so the same pipeline
/// always hashes to the same ring position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LogicTaskId(String);

impl LogicTaskId {
    /// Creates a logic task ID from a string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the value is empty or contains `/`.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        validate_segment("logic task id", &value)?;
        Ok(Self(value))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Interprets the ID as a pipeline ID, if it is numeric.
    #[must_use]
    pub fn as_pipeline_id(&self) -> Option<PipelineId> {
        self.0.parse().ok()
    }
}

impl fmt::Display for LogicTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for LogicTaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for LogicTaskId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<LogicTaskId> for String {
    fn from(id: LogicTaskId) -> Self {
        id.0
    }
}

impl From<PipelineId> for LogicTaskId {
    fn from(id: PipelineId) -> Self {
        Self(id.to_string())
    }
}

/// Identifier of a pipeline, as issued by the persistence layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(u64);

impl PipelineId {
    /// Wraps a raw pipeline ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PipelineId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|e| Error::InvalidInput(format!("invalid pipeline ID '{s}': {e}")))
    }
}

/// Identifier of a pipeline queue configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(u64);

impl QueueId {
    /// Wraps a raw queue ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|e| Error::InvalidInput(format!("invalid queue ID '{s}': {e}")))
    }
}
