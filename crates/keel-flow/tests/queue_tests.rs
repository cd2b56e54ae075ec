//! Queue release order through a running engine.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;

use keel_core::coord::CoordinationStore;
use keel_core::coord::memory::InMemoryCoordinationStore;
use keel_core::{PipelineId, QueueId};
use keel_flow::config::EngineConfig;
use keel_flow::engine::Engine;
use keel_flow::intake::IntakeOutcome;
use keel_flow::leaderworker::handler_fn;
use keel_flow::persistence::memory::InMemoryPipelineStore;
use keel_flow::persistence::{Pipeline, PipelineQueue, PipelineStatus, PipelineStore};
use keel_flow::queuemanager::ReleaseOutcome;

const QUEUE: QueueId = QueueId::new(1);
const BLOCKER: PipelineId = PipelineId::new(100);

fn config() -> EngineConfig {
    let mut config = EngineConfig::new("/queues");
    config.dispatcher.retry_interval = Duration::from_millis(20);
    config.dispatcher.retry_jitter = Duration::from_millis(5);
    config.worker.heartbeat_report_interval = Duration::from_millis(20);
    config.worker.candidate_promotion_threshold = Duration::from_millis(40);
    config.worker.liveness_probe_interval = Duration::from_millis(50);
    config.worker.store_retry_interval = Duration::from_millis(10);
    config.leader.lease_ttl = Duration::from_millis(300);
    config.leader.renew_interval = Duration::from_millis(50);
    config.leader.campaign_retry_interval = Duration::from_millis(20);
    config.leader.listing_retry_interval = Duration::from_millis(10);
    config.queue.admission_retry_interval = Duration::from_millis(10);
    config
}

struct Node {
    store: Arc<InMemoryCoordinationStore>,
    pipelines: Arc<InMemoryPipelineStore>,
    engine: Engine,
    started: Arc<Mutex<Vec<PipelineId>>>,
    gate: Arc<Semaphore>,
}

/// One engine with one worker. Tasks record their start, finish with
/// `Success`, and the blocker pipeline waits for a gate permit first.
async fn node() -> Node {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let pipelines = Arc::new(InMemoryPipelineStore::new());
    pipelines
        .insert_queue(PipelineQueue::new(QUEUE, "serial", 1))
        .unwrap();
    let engine = Engine::builder(config(), store.clone(), pipelines.clone())
        .build()
        .unwrap();
    engine.start();

    let started = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Semaphore::new(0));
    let handler = {
        let started = Arc::clone(&started);
        let gate = Arc::clone(&gate);
        let pipelines = Arc::clone(&pipelines);
        handler_fn(move |_ctx, task| {
            let started = Arc::clone(&started);
            let gate = Arc::clone(&gate);
            let pipelines = Arc::clone(&pipelines);
            async move {
                let id = task.id.as_pipeline_id().unwrap();
                started.lock().unwrap().push(id);
                if id == BLOCKER {
                    gate.acquire().await.unwrap().forget();
                }
                pipelines.update_status(id, PipelineStatus::Success).await?;
                Ok(())
            }
        })
    };
    engine
        .register_worker(vec![handler])
        .await
        .unwrap()
        .wait_official()
        .await
        .unwrap();
    Node {
        store,
        pipelines,
        engine,
        started,
        gate,
    }
}

impl Node {
    fn add(&self, id: u64, priority: i64) -> PipelineId {
        let id = PipelineId::new(id);
        self.pipelines
            .insert_pipeline(Pipeline::new(id).with_queue(QUEUE).with_priority(priority))
            .unwrap();
        id
    }

    fn started(&self) -> Vec<PipelineId> {
        self.started.lock().unwrap().clone()
    }

    async fn wait_started(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while self.started().len() < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "only {:?} started",
                self.started()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reordered_queue_releases_in_new_order() {
    let n = node().await;
    n.add(BLOCKER.get(), 0);
    let IntakeOutcome::Queued(handle) = n.engine.run_pipeline(BLOCKER).await.unwrap() else {
        panic!("blocker was not queued");
    };
    assert_eq!(handle.released().await.unwrap().outcome, ReleaseOutcome::Released);
    n.wait_started(1).await;

    let (a, b, c) = (n.add(1, 1), n.add(2, 2), n.add(3, 3));
    for id in [a, b, c] {
        assert!(matches!(
            n.engine.run_pipeline(id).await.unwrap(),
            IntakeOutcome::Queued(_)
        ));
    }
    n.engine.reorder_queue(QUEUE, &[c, a, b]).await.unwrap();

    let input_prefix = n.engine.registry().keys().queue_input_prefix();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !n.store.list(&input_prefix).await.unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "queue inputs not applied");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(n.started(), vec![BLOCKER]);

    n.gate.add_permits(1);
    n.wait_started(4).await;
    assert_eq!(n.started(), vec![BLOCKER, c, a, b]);
    n.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_pipeline_never_runs() {
    let n = node().await;
    n.add(BLOCKER.get(), 0);
    n.engine.run_pipeline(BLOCKER).await.unwrap();
    n.wait_started(1).await;

    let victim = n.add(5, 0);
    let IntakeOutcome::Queued(handle) = n.engine.run_pipeline(victim).await.unwrap() else {
        panic!("pipeline was not queued");
    };
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !n.engine.cancel_pipeline(victim).await.unwrap() {
        assert!(tokio::time::Instant::now() < deadline, "pipeline never queued");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handle.released().await.unwrap().outcome, ReleaseOutcome::PoppedOut);
    assert_eq!(
        n.pipelines.status_of(victim).unwrap(),
        Some(PipelineStatus::StopByUser)
    );

    n.gate.add_permits(1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(n.started(), vec![BLOCKER]);
    n.engine.shutdown().await;
}
