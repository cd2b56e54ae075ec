//! Observability metrics for the coordination subsystem.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `keel_dispatches_total` | Counter | `result` | Dispatch outcomes |
//! | `keel_dispatch_retries_total` | Counter | - | Dispatch attempts that were retried |
//! | `keel_dispatch_duration_seconds` | Histogram | - | Time from submit to assignment |
//! | `keel_tasks_orphaned_total` | Counter | - | Logic tasks orphaned by worker loss |
//! | `keel_workers` | Gauge | `type` | Registered workers by type |
//! | `keel_worker_promotions_total` | Counter | - | Candidate to official promotions |
//! | `keel_workers_evicted_total` | Counter | `reason` | Workers removed from the registry |
//! | `keel_leader_transitions_total` | Counter | `state` | Leadership state changes |
//! | `keel_queue_depth` | Gauge | `queue` | Pipelines waiting in a queue |
//! | `keel_queue_releases_total` | Counter | `queue` | Pipelines released for dispatch |
//! | `keel_cleanup_deleted_keys_total` | Counter | `kind` | Dangling keys removed by cleanup |
//!
//! Every call is a no-op until a recorder is installed through the `metrics`
//! facade.

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Dispatch outcomes.
    pub const DISPATCHES_TOTAL: &str = "keel_dispatches_total";
    /// Counter: Dispatch attempts that were retried.
    pub const DISPATCH_RETRIES_TOTAL: &str = "keel_dispatch_retries_total";
    /// Histogram: Time from submit to assignment in seconds.
    pub const DISPATCH_DURATION_SECONDS: &str = "keel_dispatch_duration_seconds";
    /// Counter: Logic tasks orphaned by worker loss.
    pub const TASKS_ORPHANED_TOTAL: &str = "keel_tasks_orphaned_total";
    /// Gauge: Registered workers by type.
    pub const WORKERS: &str = "keel_workers";
    /// Counter: Candidate to official promotions.
    pub const WORKER_PROMOTIONS_TOTAL: &str = "keel_worker_promotions_total";
    /// Counter: Workers removed from the registry.
    pub const WORKERS_EVICTED_TOTAL: &str = "keel_workers_evicted_total";
    /// Counter: Leadership state changes.
    pub const LEADER_TRANSITIONS_TOTAL: &str = "keel_leader_transitions_total";
    /// Gauge: Pipelines waiting in a queue.
    pub const QUEUE_DEPTH: &str = "keel_queue_depth";
    /// Counter: Pipelines released for dispatch.
    pub const QUEUE_RELEASES_TOTAL: &str = "keel_queue_releases_total";
    /// Counter: Dangling keys removed by the cleanup sweep.
    pub const CLEANUP_DELETED_KEYS_TOTAL: &str = "keel_cleanup_deleted_keys_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Result status (assigned, already_assigned, already_dispatching, cancelled).
    pub const RESULT: &str = "result";
    /// Worker type (candidate, official).
    pub const TYPE: &str = "type";
    /// Eviction reason (stale_heartbeat, malformed).
    pub const REASON: &str = "reason";
    /// Leadership state.
    pub const STATE: &str = "state";
    /// Queue identifier.
    pub const QUEUE: &str = "queue";
    /// Kind of key (heartbeat, assignment).
    pub const KIND: &str = "kind";
}

/// High-level interface for recording coordination metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics;

impl EngineMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records a dispatch outcome.
    pub fn record_dispatch(&self, result: &str) {
        counter!(names::DISPATCHES_TOTAL, labels::RESULT => result.to_string()).increment(1);
    }

    /// Records a dispatch attempt that will be retried.
    pub fn record_dispatch_retry(&self) {
        counter!(names::DISPATCH_RETRIES_TOTAL).increment(1);
    }

    /// Records the time a dispatch took from submit to assignment.
    pub fn observe_dispatch_duration(&self, duration: Duration) {
        histogram!(names::DISPATCH_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Records logic tasks orphaned by the loss of a worker.
    pub fn record_tasks_orphaned(&self, count: usize) {
        counter!(names::TASKS_ORPHANED_TOTAL).increment(count as u64);
    }

    /// Sets the number of registered workers of a type.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_workers(&self, worker_type: &str, count: usize) {
        gauge!(names::WORKERS, labels::TYPE => worker_type.to_string()).set(count as f64);
    }

    /// Records a candidate to official promotion.
    pub fn record_worker_promotion(&self) {
        counter!(names::WORKER_PROMOTIONS_TOTAL).increment(1);
    }

    /// Records a worker removed from the registry.
    pub fn record_worker_evicted(&self, reason: &str) {
        counter!(names::WORKERS_EVICTED_TOTAL, labels::REASON => reason.to_string()).increment(1);
    }

    /// Records a leadership state change.
    pub fn record_leader_transition(&self, state: &str) {
        counter!(names::LEADER_TRANSITIONS_TOTAL, labels::STATE => state.to_string())
            .increment(1);
    }

    /// Sets the number of pipelines waiting in a queue.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        gauge!(names::QUEUE_DEPTH, labels::QUEUE => queue.to_string()).set(depth as f64);
    }

    /// Records a pipeline released from a queue.
    pub fn record_queue_release(&self, queue: &str) {
        counter!(names::QUEUE_RELEASES_TOTAL, labels::QUEUE => queue.to_string()).increment(1);
    }

    /// Records dangling keys deleted by the cleanup sweep.
    pub fn record_cleanup_deleted(&self, kind: &str, count: usize) {
        if count == 0 {
            return;
        }
        counter!(names::CLEANUP_DELETED_KEYS_TOTAL, labels::KIND => kind.to_string())
            .increment(count as u64);
    }
}

/// RAII guard for timing operations.
///
/// Calls `on_drop` with the elapsed duration when dropped, unless disarmed.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Drops the guard without recording.
    pub fn disarm(mut self) {
        self.on_drop = None;
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop(self.start.elapsed());
        }
    }
}
