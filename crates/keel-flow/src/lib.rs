//! # keel-flow
//!
//! Leader/worker coordination for the keel pipeline engine.
//!
//! Every process runs the same engine against a shared coordination store;
//! one of them is elected leader. This crate provides:
//!
//! - **Worker registry**: candidate registration, heartbeats, promotion to
//!   official, and leader-driven eviction of dead workers
//! - **Failover**: the leader reports every task a vanished worker owned so
//!   it can be redispatched
//! - **Dispatch**: a bounded-load consistent-hash ring maps each logic task
//!   to exactly one official worker
//! - **Queues**: priority-ordered admission control whose release decisions
//!   are made by the leader alone
//!
//! ## Guarantees
//!
//! - **At most one live assignment** per logic task
//! - **Deterministic placement**: the same worker set always maps a task to
//!   the same worker
//! - **At-least-once execution**: a task owned by a dead worker is
//!   redispatched; handlers must be idempotent
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use keel_core::PipelineId;
//! use keel_core::coord::memory::InMemoryCoordinationStore;
//! use keel_flow::config::EngineConfig;
//! use keel_flow::engine::Engine;
//! use keel_flow::error::Result;
//! use keel_flow::leaderworker::handler_fn;
//! use keel_flow::persistence::Pipeline;
//! use keel_flow::persistence::memory::InMemoryPipelineStore;
//!
//! # async fn run() -> Result<()> {
//! let pipelines = Arc::new(InMemoryPipelineStore::new());
//! pipelines.insert_pipeline(Pipeline::new(PipelineId::new(42)))?;
//!
//! let engine = Engine::builder(
//!     EngineConfig::new("/keel"),
//!     Arc::new(InMemoryCoordinationStore::new()),
//!     pipelines,
//! )
//! .build()?;
//! engine.start();
//! engine
//!     .register_worker(vec![handler_fn(|_ctx, task| async move {
//!         tracing::info!(logic_task_id = %task.id, "running");
//!         Ok(())
//!     })])
//!     .await?;
//! engine.run_pipeline(PipelineId::new(42)).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod dispatcher;
pub mod election;
pub mod engine;
pub mod error;
pub mod events;
pub mod intake;
pub mod keys;
pub mod leaderworker;
pub mod metrics;
pub mod persistence;
pub mod queuemanager;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::dispatcher::{DispatchOutcome, Dispatcher, HashRing};
    pub use crate::election::{Campaign, LeaderElector, LeaderState, StoreLeaderElector};
    pub use crate::engine::{Engine, EngineBuilder};
    pub use crate::error::{Error, Result};
    pub use crate::events::{EventSink, InMemoryEventSink, PipelineEvent, PipelineEventData};
    pub use crate::intake::{IntakeOutcome, PipelineIntake};
    pub use crate::keys::KeyLayout;
    pub use crate::leaderworker::{
        LeaderWorker, LogicTask, MembershipEvent, RegisteredWorker, TaskContext, TaskEvent,
        TaskHandler, Worker, WorkerType, handler_fn,
    };
    pub use crate::metrics::EngineMetrics;
    pub use crate::persistence::{Pipeline, PipelineQueue, PipelineStatus, PipelineStore};
    pub use crate::queuemanager::{AdmissionError, QueueManager, ReleaseHandle, ReleaseNotice};
}
