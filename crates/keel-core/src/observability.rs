//! Observability infrastructure for keel.
//!
//! Initialization helpers and span constructors so every component logs with
//! the same structured fields.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(crate::Error::configuration(format!(
                "unknown log format '{other}'"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `keel_flow=debug`)
///
/// # Example
///
/// ```rust
/// use keel_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for worker-side operations (registration, heartbeat, task handling).
#[must_use]
pub fn worker_span(operation: &str, worker_id: &str) -> Span {
    tracing::info_span!("worker", op = operation, worker_id = worker_id)
}

/// Creates a span for one dispatch of a logic task.
#[must_use]
pub fn dispatch_span(operation: &str, logic_task_id: &str) -> Span {
    tracing::info_span!("dispatch", op = operation, logic_task_id = logic_task_id)
}

/// Creates a span covering one leadership term.
#[must_use]
pub fn leader_span(term: u64) -> Span {
    tracing::info_span!("leader", term = term)
}
