//! Standalone keel cluster.
//!
//! Starts several in-process engines on one in-memory coordination store,
//! registers a worker on each, and runs the pipeline IDs given on the command
//! line. Handy for watching election, dispatch and queue release locally:
//!
//! ```text
//! RUST_LOG=keel_flow=debug keel_standalone --nodes 3 --queued 1 2 3 4
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use keel_core::observability::{LogFormat, init_logging};
use keel_core::{PipelineId, QueueId};
use keel_flow::config::EngineConfig;
use keel_flow::engine::Engine;
use keel_flow::error::{Error, Result};
use keel_flow::intake::IntakeOutcome;
use keel_flow::leaderworker::handler_fn;
use keel_flow::persistence::memory::InMemoryPipelineStore;
use keel_flow::persistence::{Pipeline, PipelineQueue, PipelineStatus, PipelineStore};

const QUEUE: QueueId = QueueId::new(1);

/// Runs pipelines on an in-process keel cluster.
#[derive(Debug, Parser)]
#[command(name = "keel_standalone", version, about)]
struct Args {
    /// Key prefix for every coordination key.
    #[arg(long, env = "KEEL_KEY_PREFIX", default_value = "/keel")]
    prefix: String,

    /// Number of in-process nodes.
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    /// Route pipelines through a queue instead of dispatching them directly.
    #[arg(long)]
    queued: bool,

    /// Concurrency of the queue used with `--queued`.
    #[arg(long, default_value_t = 1)]
    queue_concurrency: usize,

    /// How long each simulated task runs, in milliseconds.
    #[arg(long, default_value_t = 500)]
    task_millis: u64,

    /// Log format: `pretty` or `json`.
    #[arg(long, env = "KEEL_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,

    /// Pipeline IDs to run.
    #[arg(required = true)]
    pipelines: Vec<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    let prefix = args.prefix.clone();
    let config = EngineConfig::from_lookup(|name| {
        if name == "KEEL_KEY_PREFIX" {
            Some(prefix.clone())
        } else {
            std::env::var(name).ok()
        }
    })?;

    let store = Arc::new(keel_core::coord::memory::InMemoryCoordinationStore::new());
    let pipelines = Arc::new(InMemoryPipelineStore::new());
    pipelines.insert_queue(PipelineQueue::new(QUEUE, "standalone", args.queue_concurrency))?;
    let ids: Vec<PipelineId> = args.pipelines.iter().copied().map(PipelineId::new).collect();
    for id in &ids {
        let pipeline = Pipeline::new(*id);
        let pipeline = if args.queued {
            pipeline.with_queue(QUEUE)
        } else {
            pipeline
        };
        pipelines.insert_pipeline(pipeline)?;
    }

    let mut engines = Vec::with_capacity(args.nodes);
    for node in 0..args.nodes.max(1) {
        let mut node_config = config.clone();
        node_config.instance_id = Some(format!("node-{node}"));
        let engine = Engine::builder(node_config, store.clone(), pipelines.clone()).build()?;
        engine.start();

        let backend = Arc::clone(&pipelines);
        let task_time = Duration::from_millis(args.task_millis);
        engine
            .register_worker(vec![handler_fn(move |ctx, task| {
                let backend = Arc::clone(&backend);
                async move {
                    tracing::info!(worker_id = %ctx.worker_id(), logic_task_id = %task.id, "task started");
                    tokio::select! {
                        () = ctx.cancelled() => {
                            tracing::info!(logic_task_id = %task.id, "task cancelled");
                            return Ok(());
                        }
                        () = tokio::time::sleep(task_time) => {}
                    }
                    if let Some(pipeline_id) = task.id.as_pipeline_id() {
                        backend
                            .update_status(pipeline_id, PipelineStatus::Success)
                            .await?;
                    }
                    tracing::info!(logic_task_id = %task.id, "task finished");
                    Ok(())
                }
            })])
            .await?;
        engines.push(engine);
    }

    let Some(submitter) = engines.first() else {
        return Err(Error::configuration("at least one node is required"));
    };
    for id in &ids {
        match submitter.run_pipeline(*id).await? {
            IntakeOutcome::Queued(handle) => {
                tokio::spawn(async move {
                    match handle.released().await {
                        Ok(notice) => tracing::info!(pipeline_id = %notice.pipeline_id, outcome = ?notice.outcome, "left queue"),
                        Err(e) => tracing::warn!(error = %e, "release wait ended"),
                    }
                });
            }
            outcome => tracing::info!(pipeline_id = %id, ?outcome, "pipeline submitted"),
        }
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "failed to listen for ctrl-c");
                }
                break;
            }
            _ = ticker.tick() => {}
        }
        let mut finished = 0;
        for id in &ids {
            if pipelines.status_of(*id)?.is_some_and(PipelineStatus::is_terminal) {
                finished += 1;
            }
        }
        if finished == ids.len() {
            tracing::info!(pipelines = finished, "all pipelines finished");
            break;
        }
    }

    for engine in &engines {
        engine.shutdown().await;
    }
    Ok(())
}
