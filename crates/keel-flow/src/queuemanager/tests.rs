use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use keel_core::{LogicTaskId, WorkerId};
use keel_core::coord::CoordinationStore;
use keel_core::coord::memory::InMemoryCoordinationStore;

use super::*;
use crate::config::{DispatcherConfig, WorkerConfig};
use crate::error::Error;
use crate::leaderworker::{LeaderWorker, TaskEvent};
use crate::persistence::memory::InMemoryPipelineStore;
use crate::persistence::{Pipeline, PipelineQueue};

/// Fails exactly one `get_queue` call, the `fail_on`-th, with a storage error.
#[derive(Debug)]
struct FlakyQueueLookups {
    inner: Arc<InMemoryPipelineStore>,
    calls: AtomicUsize,
    fail_on: usize,
}

#[async_trait]
impl PipelineStore for FlakyQueueLookups {
    async fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        self.inner.get_pipeline(id).await
    }

    async fn update_status(&self, id: PipelineId, status: PipelineStatus) -> Result<()> {
        self.inner.update_status(id, status).await
    }

    async fn list_ids_by_statuses(&self, statuses: &[PipelineStatus]) -> Result<Vec<PipelineId>> {
        self.inner.list_ids_by_statuses(statuses).await
    }

    async fn get_queue(&self, id: QueueId) -> Result<Option<PipelineQueue>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            return Err(Error::storage("queue lookup timed out"));
        }
        self.inner.get_queue(id).await
    }
}

const QUEUE: QueueId = QueueId::new(1);

struct Harness {
    store: Arc<InMemoryCoordinationStore>,
    keys: KeyLayout,
    pipelines: Arc<InMemoryPipelineStore>,
    manager: Arc<QueueManager>,
    finished: broadcast::Sender<TaskEvent>,
    cancel: CancellationToken,
}

impl Harness {
    fn new(concurrency: usize) -> Self {
        Self::with_pipeline_store(concurrency, |pipelines| pipelines as Arc<dyn PipelineStore>)
    }

    fn with_pipeline_store(
        concurrency: usize,
        wrap: impl FnOnce(Arc<InMemoryPipelineStore>) -> Arc<dyn PipelineStore>,
    ) -> Self {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let keys = KeyLayout::new("/test").unwrap();
        let leader_config = LeaderConfig {
            listing_retry_interval: Duration::from_millis(10),
            ..LeaderConfig::default()
        };
        let registry = LeaderWorker::new(
            store.clone(),
            keys.clone(),
            WorkerConfig::default(),
            leader_config.clone(),
            EngineMetrics::new(),
        );
        let dispatcher = Dispatcher::new(
            registry,
            DispatcherConfig {
                retry_interval: Duration::from_millis(20),
                retry_jitter: Duration::ZERO,
                ..DispatcherConfig::default()
            },
            EngineMetrics::new(),
        );
        let pipelines = Arc::new(InMemoryPipelineStore::new());
        pipelines
            .insert_queue(PipelineQueue::new(QUEUE, "default", concurrency))
            .unwrap();
        let manager = QueueManager::new(
            store.clone(),
            keys.clone(),
            QueueConfig {
                reload_running_interval: Duration::from_millis(10),
                ..QueueConfig::default()
            },
            &leader_config,
            wrap(pipelines.clone()),
            dispatcher,
            EngineMetrics::new(),
        );
        let (finished, _) = broadcast::channel(64);
        Self {
            store,
            keys,
            pipelines,
            manager,
            finished,
            cancel: CancellationToken::new(),
        }
    }

    fn add(&self, id: u64, priority: i64) -> PipelineId {
        let id = PipelineId::new(id);
        self.pipelines
            .insert_pipeline(Pipeline::new(id).with_queue(QUEUE).with_priority(priority))
            .unwrap();
        id
    }

    fn start_watcher(&self) {
        tokio::spawn(Arc::clone(&self.manager).run_release_watcher(self.cancel.clone()));
    }

    fn start_leader(&self) {
        tokio::spawn(
            Arc::clone(&self.manager).run_as_leader(self.finished.subscribe(), self.cancel.clone()),
        );
    }

    fn finish(&self, id: PipelineId) {
        self.finished
            .send(TaskEvent::Finished {
                worker_id: WorkerId::generate(),
                task: LogicTaskId::from(id),
            })
            .unwrap();
    }

    fn status(&self, id: PipelineId) -> PipelineStatus {
        self.pipelines.status_of(id).unwrap().unwrap()
    }

    async fn wait_status(&self, id: PipelineId, status: PipelineStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.status(id) != status {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {id} to become {status:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_inputs_applied(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self
            .store
            .list(&self.keys.queue_input_prefix())
            .await
            .unwrap()
            .is_empty()
        {
            assert!(tokio::time::Instant::now() < deadline, "queue inputs not applied");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn running_among(&self, ids: &[PipelineId]) -> Vec<PipelineId> {
        ids.iter()
            .copied()
            .filter(|id| self.status(*id) == PipelineStatus::Running)
            .collect()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[tokio::test]
async fn admission_rejects_invalid_pipelines() {
    let h = Harness::new(1);
    let missing = PipelineId::new(404);
    assert!(matches!(
        h.manager.put_pipeline_into_queue(missing).await,
        Err(AdmissionError::PipelineNotFound(id)) if id == missing
    ));

    let unqueued = PipelineId::new(2);
    h.pipelines.insert_pipeline(Pipeline::new(unqueued)).unwrap();
    assert!(matches!(
        h.manager.put_pipeline_into_queue(unqueued).await,
        Err(AdmissionError::NoQueue(_))
    ));

    let orphan = PipelineId::new(3);
    h.pipelines
        .insert_pipeline(Pipeline::new(orphan).with_queue(QueueId::new(99)))
        .unwrap();
    assert!(matches!(
        h.manager.put_pipeline_into_queue(orphan).await,
        Err(AdmissionError::QueueNotFound(q)) if q == QueueId::new(99)
    ));

    let done = h.add(4, 0);
    h.pipelines.update_status(done, PipelineStatus::Success).await.unwrap();
    let err = h.manager.put_pipeline_into_queue(done).await.unwrap_err();
    assert!(matches!(err, AdmissionError::AlreadyFinished(_)));
    assert!(!err.is_retryable());
    assert_eq!(h.manager.waiter_count(done), 0);
}

#[tokio::test]
async fn admission_writes_event_and_marks_queued() {
    let h = Harness::new(1);
    let id = h.add(7, 5);
    let handle = h.manager.put_pipeline_into_queue(id).await.unwrap();
    assert_eq!(handle.pipeline_id(), id);
    assert_eq!(h.status(id), PipelineStatus::Queue);
    assert_eq!(h.manager.waiter_count(id), 1);

    let inputs = h.store.list(&h.keys.queue_input_prefix()).await.unwrap();
    assert_eq!(inputs.len(), 1);
    let mutation: QueueMutation = serde_json::from_slice(&inputs[0].value).unwrap();
    assert_eq!(
        mutation,
        QueueMutation::Put {
            pipeline_id: id,
            priority: 5
        }
    );
}

#[tokio::test]
async fn failed_admission_leaves_no_waiter() {
    let h = Harness::new(1);
    let id = h.add(7, 0);
    h.store.set_unavailable(true);
    let err = h.manager.put_pipeline_into_queue(id).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(h.manager.waiter_count(id), 0);
}

#[tokio::test]
async fn reorder_sets_release_order() {
    let h = Harness::new(1);
    h.start_watcher();
    h.start_leader();

    let blocker = h.add(10, 0);
    let notice = h
        .manager
        .put_pipeline_into_queue(blocker)
        .await
        .unwrap()
        .released()
        .await
        .unwrap();
    assert_eq!(notice.outcome, ReleaseOutcome::Released);
    assert_eq!(h.status(blocker), PipelineStatus::Running);

    let (a, b, c) = (h.add(1, 1), h.add(2, 2), h.add(3, 3));
    for id in [a, b, c] {
        h.manager.put_pipeline_into_queue(id).await.unwrap();
    }
    h.manager
        .batch_update_pipeline_priority_in_queue(QUEUE, &[c, a, b])
        .await
        .unwrap();
    h.wait_inputs_applied().await;
    assert!(h.running_among(&[a, b, c]).is_empty());

    let mut order = Vec::new();
    let mut previous = blocker;
    for _ in 0..3 {
        h.finish(previous);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let next = loop {
            let running: Vec<_> = h
                .running_among(&[a, b, c])
                .into_iter()
                .filter(|id| !order.contains(id))
                .collect();
            if let [next] = running[..] {
                break next;
            }
            assert!(running.len() < 2, "more than one pipeline released at once");
            assert!(tokio::time::Instant::now() < deadline, "no pipeline released");
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        order.push(next);
        previous = next;
    }
    assert_eq!(order, vec![c, a, b]);
}

#[tokio::test]
async fn pop_out_resolves_waiter() {
    let h = Harness::new(1);
    h.start_watcher();
    h.start_leader();

    let blocker = h.add(10, 0);
    h.manager
        .put_pipeline_into_queue(blocker)
        .await
        .unwrap()
        .released()
        .await
        .unwrap();

    let id = h.add(11, 0);
    let handle = h.manager.put_pipeline_into_queue(id).await.unwrap();
    h.wait_inputs_applied().await;
    assert!(h.manager.pop_out_pipeline_from_queue(id).await.unwrap());

    let notice = handle.released().await.unwrap();
    assert_eq!(notice.outcome, ReleaseOutcome::PoppedOut);
    assert_eq!(notice.queue_id, QUEUE);
    assert_eq!(h.status(id), PipelineStatus::StopByUser);

    // No longer queued.
    assert!(!h.manager.pop_out_pipeline_from_queue(id).await.unwrap());
    assert!(!h.manager.pop_out_pipeline_from_queue(blocker).await.unwrap());
}

#[tokio::test]
async fn recovery_counts_running_pipelines() {
    let h = Harness::new(1);
    let running = h.add(1, 0);
    let queued = h.add(2, 0);
    h.pipelines
        .update_status(running, PipelineStatus::Running)
        .await
        .unwrap();
    h.pipelines
        .update_status(queued, PipelineStatus::Queue)
        .await
        .unwrap();

    h.start_leader();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.status(queued), PipelineStatus::Queue);

    h.finish(running);
    h.wait_status(queued, PipelineStatus::Running).await;
}

#[tokio::test]
async fn release_watcher_resolves_existing_notice() {
    let h = Harness::new(1);
    let id = h.add(5, 0);
    let handle = h.manager.put_pipeline_into_queue(id).await.unwrap();

    let notice = ReleaseNotice::new(id, QUEUE, ReleaseOutcome::Released);
    h.store
        .put(
            &h.keys.release_key(id),
            Bytes::from(serde_json::to_vec(&notice).unwrap()),
        )
        .await
        .unwrap();
    h.start_watcher();

    let received = handle.released().await.unwrap();
    assert_eq!(received.pipeline_id, id);
    assert_eq!(received.outcome, ReleaseOutcome::Released);
    assert_eq!(h.manager.waiter_count(id), 0);
}

#[tokio::test]
async fn transient_failure_while_applying_put_is_retried() {
    let h = Harness::with_pipeline_store(1, |inner| {
        Arc::new(FlakyQueueLookups {
            inner,
            calls: AtomicUsize::new(0),
            // The first lookup is admission's own check; the second is the leader's.
            fail_on: 2,
        })
    });
    h.start_watcher();
    h.start_leader();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let id = h.add(7, 0);
    let handle = h.manager.put_pipeline_into_queue(id).await.unwrap();
    let notice = tokio::time::timeout(Duration::from_secs(5), handle.released())
        .await
        .expect("pipeline released after the retry")
        .unwrap();
    assert_eq!(notice.outcome, ReleaseOutcome::Released);
    assert_eq!(h.status(id), PipelineStatus::Running);
    h.wait_inputs_applied().await;
}
