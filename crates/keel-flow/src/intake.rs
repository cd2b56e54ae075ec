//! Pipeline intake: the caller-facing entry point for running a pipeline.
//!
//! Pipelines routed through a queue are admitted with a bounded number of
//! attempts; pipelines without a queue go straight to the dispatcher. A
//! pipeline that cannot be admitted is marked [`PipelineStatus::Failed`] and
//! an [`PipelineEventData::AdmissionFailed`] event is emitted. Only store I/O
//! retries indefinitely; admission itself never does.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use keel_core::{LogicTaskId, PipelineId};

use crate::config::QueueConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::events::{EventSink, PipelineEvent, PipelineEventData};
use crate::leaderworker::LogicTask;
use crate::persistence::{PipelineStatus, PipelineStore};
use crate::queuemanager::{AdmissionError, QueueManager, ReleaseHandle};

/// What happened to a pipeline handed to [`PipelineIntake::run_pipeline`].
#[derive(Debug)]
pub enum IntakeOutcome {
    /// Admitted into its queue; the handle resolves on release.
    Queued(ReleaseHandle),
    /// No queue: dispatch started directly.
    Dispatched,
    /// The pipeline had already reached a terminal status.
    AlreadyFinished,
    /// Admission failed; the pipeline was marked failed.
    Failed {
        /// Last admission error.
        reason: String,
        /// Attempts made.
        attempts: u32,
    },
}

/// Admits pipelines into queues or dispatches them directly.
pub struct PipelineIntake {
    queues: Arc<QueueManager>,
    dispatcher: Arc<Dispatcher>,
    pipelines: Arc<dyn PipelineStore>,
    events: Arc<dyn EventSink>,
    config: QueueConfig,
}

impl std::fmt::Debug for PipelineIntake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineIntake")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PipelineIntake {
    /// Creates an intake.
    #[must_use]
    pub fn new(
        queues: Arc<QueueManager>,
        dispatcher: Arc<Dispatcher>,
        pipelines: Arc<dyn PipelineStore>,
        events: Arc<dyn EventSink>,
        config: QueueConfig,
    ) -> Self {
        Self {
            queues,
            dispatcher,
            pipelines,
            events,
            config,
        }
    }

    /// Runs a pipeline.
    ///
    /// Direct dispatches keep retrying in the background until `cancel`
    /// fires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PipelineNotFound`] if the pipeline does not exist,
    /// [`Error::Cancelled`] if `cancel` fires between admission attempts, and
    /// a storage error if the pipeline record cannot be read or updated.
    #[tracing::instrument(skip_all, fields(pipeline_id = %pipeline_id))]
    pub async fn run_pipeline(
        &self,
        pipeline_id: PipelineId,
        cancel: &CancellationToken,
    ) -> Result<IntakeOutcome> {
        let pipeline = self
            .pipelines
            .get_pipeline(pipeline_id)
            .await?
            .ok_or(Error::PipelineNotFound { pipeline_id })?;
        if pipeline.status.is_terminal() {
            tracing::info!(status = ?pipeline.status, "pipeline already finished");
            return Ok(IntakeOutcome::AlreadyFinished);
        }

        if pipeline.queue_id.is_none() {
            self.pipelines
                .update_status(pipeline_id, PipelineStatus::Running)
                .await?;
            let task = LogicTask::new(
                LogicTaskId::from(pipeline_id),
                Bytes::from(pipeline_id.to_string()),
            );
            drop(self.dispatcher.submit(task, cancel.clone()));
            self.emit(pipeline_id, PipelineEventData::Admitted { queue_id: None })
                .await;
            return Ok(IntakeOutcome::Dispatched);
        }

        let max_attempts = self.config.max_admission_attempts.max(1);
        let mut attempt = 0;
        let error = loop {
            attempt += 1;
            match self.queues.put_pipeline_into_queue(pipeline_id).await {
                Ok(handle) => {
                    self.emit(
                        pipeline_id,
                        PipelineEventData::Admitted {
                            queue_id: pipeline.queue_id,
                        },
                    )
                    .await;
                    return Ok(IntakeOutcome::Queued(handle));
                }
                Err(AdmissionError::AlreadyFinished(_)) => {
                    return Ok(IntakeOutcome::AlreadyFinished);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    tracing::warn!(attempt, error = %e, "admission failed, retrying");
                }
                Err(e) => break e,
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(self.config.admission_retry_interval) => {}
            }
        };

        let reason = error.to_string();
        tracing::error!(attempts = attempt, error = %reason, "admission failed, marking pipeline failed");
        self.pipelines
            .update_status(pipeline_id, PipelineStatus::Failed)
            .await?;
        self.emit(
            pipeline_id,
            PipelineEventData::AdmissionFailed {
                reason: reason.clone(),
                attempts: attempt,
            },
        )
        .await;
        Ok(IntakeOutcome::Failed {
            reason,
            attempts: attempt,
        })
    }

    async fn emit(&self, pipeline_id: PipelineId, data: PipelineEventData) {
        if let Err(e) = self.events.emit(PipelineEvent::new(pipeline_id, data)).await {
            tracing::warn!(pipeline_id = %pipeline_id, error = %e, "failed to emit pipeline event");
        }
    }
}
