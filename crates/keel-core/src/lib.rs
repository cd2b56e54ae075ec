//! # keel-core
//!
//! Shared primitives for the keel dispatch engine.
//!
//! This crate provides the foundational types used by every keel component:
//!
//! - **Error Types**: Shared error definitions and result types
//! - **Identifiers**: Strongly-typed IDs for workers, logic tasks, pipelines and queues
//! - **Coordination Store**: The linearizable key-value contract the engine is built on,
//!   with an in-memory backend and a resilient prefix-watch actor
//! - **Observability**: Logging initialisation and span helpers
//!
//! ## Example
//!
//! ```rust
//! use keel_core::prelude::*;
//!
//! let worker = WorkerId::generate();
//! let task = LogicTaskId::from(PipelineId::new(42));
//! assert_eq!(task.as_str(), "42");
//! # let _ = worker;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod coord;
pub mod error;
pub mod id;
pub mod observability;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::coord::memory::InMemoryCoordinationStore;
    pub use crate::coord::watch::{PrefixEvent, spawn_prefix_watch};
    pub use crate::coord::{
        Compare, CoordinationStore, KeyValue, LeaseId, SharedStore, Txn, TxnOp, TxnResult,
        WatchEvent, WatchEventKind, WatchStream,
    };
    pub use crate::error::{Error, Result};
    pub use crate::id::{LogicTaskId, PipelineId, QueueId, WorkerId};
}

pub use coord::{CoordinationStore, SharedStore};
pub use error::{Error, Result};
pub use id::{LogicTaskId, PipelineId, QueueId, WorkerId};
