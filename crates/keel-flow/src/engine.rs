//! Engine wiring.
//!
//! [`Engine`] owns one instance of every component and connects them
//! explicitly; nothing is reachable through globals. [`Engine::start`]
//! launches the loops every process runs (membership watch, ring
//! maintenance, release watcher, campaign) and registers the leader
//! callback that runs failover, orphan redispatch and the queue leader loop
//! for the duration of each term.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use ulid::Ulid;

use keel_core::coord::SharedStore;
use keel_core::observability::worker_span;
use keel_core::{LogicTaskId, PipelineId, QueueId, WorkerId};

use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::election::{Campaign, StoreLeaderElector};
use crate::error::{Error, Result};
use crate::events::{EventSink, InMemoryEventSink};
use crate::intake::{IntakeOutcome, PipelineIntake};
use crate::keys::KeyLayout;
use crate::leaderworker::{LeaderWorker, RegisteredWorker, TaskHandler, Worker};
use crate::metrics::EngineMetrics;
use crate::persistence::{PipelineStatus, PipelineStore};
use crate::queuemanager::QueueManager;

/// Builder for an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    store: SharedStore,
    pipelines: Arc<dyn PipelineStore>,
    events: Option<Arc<dyn EventSink>>,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("pipelines", &self.pipelines)
            .finish_non_exhaustive()
    }
}

impl EngineBuilder {
    /// Sets the sink for pipeline events. Defaults to an in-memory sink.
    #[must_use]
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Validates the configuration and constructs every component.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the configuration is invalid.
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        let keys = KeyLayout::from_config(&self.config)?;
        let metrics = EngineMetrics::new();
        let instance_id = self
            .config
            .instance_id
            .clone()
            .unwrap_or_else(|| Ulid::new().to_string());

        let registry = LeaderWorker::new(
            Arc::clone(&self.store),
            keys.clone(),
            self.config.worker.clone(),
            self.config.leader.clone(),
            metrics.clone(),
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            self.config.dispatcher.clone(),
            metrics.clone(),
        );
        let queues = QueueManager::new(
            Arc::clone(&self.store),
            keys.clone(),
            self.config.queue.clone(),
            &self.config.leader,
            Arc::clone(&self.pipelines),
            Arc::clone(&dispatcher),
            metrics.clone(),
        );
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(InMemoryEventSink::new()));
        let intake = PipelineIntake::new(
            Arc::clone(&queues),
            Arc::clone(&dispatcher),
            Arc::clone(&self.pipelines),
            events,
            self.config.queue.clone(),
        );
        let elector = StoreLeaderElector::new(
            Arc::clone(&self.store),
            keys.clone(),
            self.config.leader.lease_ttl,
        );
        let campaign = Campaign::new(
            Arc::new(elector),
            instance_id,
            self.config.leader.clone(),
            metrics,
        );

        Ok(Engine {
            config: self.config,
            keys,
            registry,
            dispatcher,
            queues,
            intake,
            pipelines: self.pipelines,
            campaign,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        })
    }
}

/// One process's coordination engine.
pub struct Engine {
    config: EngineConfig,
    keys: KeyLayout,
    registry: Arc<LeaderWorker>,
    dispatcher: Arc<Dispatcher>,
    queues: Arc<QueueManager>,
    intake: PipelineIntake,
    pipelines: Arc<dyn PipelineStore>,
    campaign: Arc<Campaign>,
    shutdown: CancellationToken,
    started: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("instance_id", &self.campaign.instance_id())
            .field("prefix", &self.keys.prefix())
            .field("state", &self.campaign.state())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Starts building an engine.
    #[must_use]
    pub fn builder(
        config: EngineConfig,
        store: SharedStore,
        pipelines: Arc<dyn PipelineStore>,
    ) -> EngineBuilder {
        EngineBuilder {
            config,
            store,
            pipelines,
            events: None,
        }
    }

    /// Launches the background loops. Calling it again has no effect.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let registry = Arc::clone(&self.registry);
        let dispatcher = Arc::clone(&self.dispatcher);
        let queues = Arc::clone(&self.queues);
        self.campaign.on_leader(move |term| {
            // Subscribed before failover starts so no event of the term is missed.
            let dispatch_events = registry.subscribe_task_events();
            let queue_events = registry.subscribe_task_events();
            let registry = Arc::clone(&registry);
            let dispatcher = Arc::clone(&dispatcher);
            let queues = Arc::clone(&queues);
            async move {
                let orphans = tokio::spawn(
                    dispatcher
                        .run_task_events(dispatch_events, term.clone())
                        .in_current_span(),
                );
                let queue_leader = tokio::spawn(
                    queues
                        .run_as_leader(queue_events, term.clone())
                        .in_current_span(),
                );
                registry.run_as_leader(term).await;
                for handle in [orphans, queue_leader] {
                    if let Err(e) = handle.await {
                        tracing::error!(error = %e, "leader task panicked");
                    }
                }
            }
        });

        let handles = vec![
            tokio::spawn(
                Arc::clone(&self.registry).run_membership_watch(self.shutdown.clone()),
            ),
            tokio::spawn(
                Arc::clone(&self.dispatcher).run_ring_maintenance(self.shutdown.clone()),
            ),
            tokio::spawn(Arc::clone(&self.queues).run_release_watcher(self.shutdown.clone())),
            tokio::spawn(Arc::clone(&self.campaign).run(self.shutdown.clone())),
        ];
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
        tracing::info!(
            instance_id = self.campaign.instance_id(),
            prefix = self.keys.prefix(),
            "engine started"
        );
    }

    /// Registers a local worker running `handlers`.
    ///
    /// If the leader ever evicts the worker, it is registered again under the
    /// same ID as a fresh candidate. The returned handle tracks the first
    /// registration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the engine shuts down before the
    /// worker is registered.
    pub async fn register_worker(
        &self,
        handlers: Vec<Arc<dyn TaskHandler>>,
    ) -> Result<RegisteredWorker> {
        let id = WorkerId::generate();
        let registered = self
            .registry
            .register_candidate_worker(
                Worker::with_id(id.clone(), handlers.clone()),
                self.shutdown.child_token(),
            )
            .await?;

        let registry = Arc::clone(&self.registry);
        let shutdown = self.shutdown.clone();
        let first = registered.clone();
        let supervisor = tokio::spawn(
            async move {
                let mut current = first;
                loop {
                    current.stopped().await;
                    if shutdown.is_cancelled() {
                        return;
                    }
                    tracing::warn!("worker evicted, registering again");
                    match registry
                        .register_candidate_worker(
                            Worker::with_id(id.clone(), handlers.clone()),
                            shutdown.child_token(),
                        )
                        .await
                    {
                        Ok(next) => current = next,
                        Err(Error::Cancelled) => return,
                        Err(e) => {
                            tracing::error!(error = %e, "worker re-registration failed");
                            return;
                        }
                    }
                }
            }
            .instrument(worker_span("supervise", registered.id().as_str())),
        );
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(supervisor);
        Ok(registered)
    }

    /// Runs a pipeline through intake.
    ///
    /// # Errors
    ///
    /// See [`PipelineIntake::run_pipeline`].
    pub async fn run_pipeline(&self, pipeline_id: PipelineId) -> Result<IntakeOutcome> {
        self.intake.run_pipeline(pipeline_id, &self.shutdown).await
    }

    /// Reorders the pending pipelines of a queue.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the mutation cannot be written.
    pub async fn reorder_queue(&self, queue_id: QueueId, pipeline_ids: &[PipelineId]) -> Result<()> {
        self.queues
            .batch_update_pipeline_priority_in_queue(queue_id, pipeline_ids)
            .await
    }

    /// Removes a queued pipeline before release, then cancels any running
    /// assignment of it.
    ///
    /// A running pipeline is marked [`PipelineStatus::StopByUser`] before its
    /// assignment is deleted, so the leader's recovery pass never starts it
    /// again.
    ///
    /// Returns true if the pipeline was queued, running, or had an assignment.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read or written.
    pub async fn cancel_pipeline(&self, pipeline_id: PipelineId) -> Result<bool> {
        let popped = self.queues.pop_out_pipeline_from_queue(pipeline_id).await?;
        let stopped = !popped && self.mark_stopped(pipeline_id).await?;
        let cancelled = self
            .registry
            .cancel_logic_task(&LogicTaskId::from(pipeline_id))
            .await?;
        Ok(popped || stopped || cancelled > 0)
    }

    async fn mark_stopped(&self, pipeline_id: PipelineId) -> Result<bool> {
        let Some(pipeline) = self.pipelines.get_pipeline(pipeline_id).await? else {
            return Ok(false);
        };
        if pipeline.status != PipelineStatus::Running {
            return Ok(false);
        }
        self.pipelines
            .update_status(pipeline_id, PipelineStatus::StopByUser)
            .await?;
        tracing::info!(pipeline_id = %pipeline_id, "running pipeline stopped by user");
        Ok(true)
    }

    /// The configuration the engine was built with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The worker registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<LeaderWorker> {
        &self.registry
    }

    /// The dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The queue manager.
    #[must_use]
    pub fn queues(&self) -> &Arc<QueueManager> {
        &self.queues
    }

    /// The leader campaign.
    #[must_use]
    pub fn campaign(&self) -> &Arc<Campaign> {
        &self.campaign
    }

    /// Returns true while this process leads.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.campaign.is_leader()
    }

    /// Stops every loop and local worker, releasing leadership if held.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(
            &mut *self
                .handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "engine task panicked");
            }
        }
        tracing::info!(instance_id = self.campaign.instance_id(), "engine stopped");
    }
}
