use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use keel_core::coord::CoordinationStore;
use keel_core::coord::memory::InMemoryCoordinationStore;
use keel_core::{LogicTaskId, WorkerId};

use super::registry::format_heartbeat;
use super::*;

fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        heartbeat_report_interval: Duration::from_millis(20),
        allowed_max_continue_lost_contact_times: 3,
        candidate_promotion_threshold: Duration::from_millis(60),
        liveness_probe_interval: Duration::from_millis(20),
        store_retry_interval: Duration::from_millis(10),
    }
}

fn slow_worker_config() -> WorkerConfig {
    WorkerConfig {
        heartbeat_report_interval: Duration::from_secs(1),
        allowed_max_continue_lost_contact_times: 5,
        candidate_promotion_threshold: Duration::from_secs(60),
        liveness_probe_interval: Duration::from_secs(30),
        store_retry_interval: Duration::from_millis(10),
    }
}

fn leader_config() -> LeaderConfig {
    LeaderConfig {
        listing_retry_interval: Duration::from_millis(10),
        cleanup_interval: Duration::from_secs(3600),
        ..LeaderConfig::default()
    }
}

fn setup(config: WorkerConfig) -> (Arc<InMemoryCoordinationStore>, Arc<LeaderWorker>) {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let lw = LeaderWorker::new(
        store.clone(),
        KeyLayout::new("/test").unwrap(),
        config,
        leader_config(),
        EngineMetrics::new(),
    );
    (store, lw)
}

fn wid(id: &str) -> WorkerId {
    WorkerId::new(id).unwrap()
}

fn tid(id: &str) -> LogicTaskId {
    LogicTaskId::new(id).unwrap()
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Writes an official registration and a fresh heartbeat, as a live remote worker would.
async fn put_official(store: &InMemoryCoordinationStore, keys: &KeyLayout, id: &WorkerId) {
    let record = Worker::with_id(id.clone(), Vec::new())
        .with_type(WorkerType::Official)
        .to_json()
        .unwrap();
    store
        .put(&keys.worker_key(WorkerType::Official, id), record)
        .await
        .unwrap();
    store
        .put(&keys.heartbeat_key(id), Bytes::from(format_heartbeat(Utc::now())))
        .await
        .unwrap();
}

async fn next_task_event(rx: &mut broadcast::Receiver<TaskEvent>) -> TaskEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("task event in time")
        .expect("task event channel open")
}

#[tokio::test]
async fn candidate_is_promoted_exactly_once() {
    let (store, lw) = setup(fast_worker_config());
    let cancel = CancellationToken::new();
    let worker = Worker::new(Vec::new());
    let id = worker.id.clone();

    let registered = lw.register_candidate_worker(worker, cancel.clone()).await.unwrap();
    assert_eq!(registered.worker_type(), WorkerType::Candidate);
    let keys = lw.keys().clone();
    assert!(store.get(&keys.worker_key(WorkerType::Candidate, &id)).await.unwrap().is_some());
    assert!(store.get(&keys.heartbeat_key(&id)).await.unwrap().is_some());

    registered.wait_official().await.unwrap();
    assert!(store.get(&keys.worker_key(WorkerType::Candidate, &id)).await.unwrap().is_none());
    let official = lw.get_worker(&id).await.unwrap().expect("official record");
    assert_eq!(official.worker_type, WorkerType::Official);

    // Several promotion thresholds later the worker is still official.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(registered.worker_type(), WorkerType::Official);
    assert!(store.get(&keys.worker_key(WorkerType::Candidate, &id)).await.unwrap().is_none());
    assert!(!registered.is_stopped());
    cancel.cancel();
}

#[tokio::test]
async fn get_worker_reports_absence() {
    let (_store, lw) = setup(slow_worker_config());
    assert!(lw.get_worker(&wid("ghost")).await.unwrap().is_none());
}

#[tokio::test]
async fn list_workers_drops_and_deletes_malformed_records() {
    let (store, lw) = setup(slow_worker_config());
    let keys = lw.keys().clone();
    put_official(&store, &keys, &wid("good")).await;
    let bad_key = keys.worker_key(WorkerType::Official, &wid("bad"));
    store
        .put(&bad_key, Bytes::from_static(br#"{"id":"bad"}"#))
        .await
        .unwrap();

    let listed = lw.list_workers(&[WorkerType::Official]).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, wid("good"));

    wait_until("malformed key deletion", || {
        let store = store.clone();
        let bad_key = bad_key.clone();
        async move { store.get(&bad_key).await.unwrap().is_none() }
    })
    .await;
}

#[tokio::test]
async fn list_workers_evicts_stale_heartbeats() {
    let (store, lw) = setup(slow_worker_config());
    let keys = lw.keys().clone();
    let id = wid("stale");
    put_official(&store, &keys, &id).await;
    let old = Utc::now() - chrono::Duration::seconds(60);
    store
        .put(&keys.heartbeat_key(&id), Bytes::from(format_heartbeat(old)))
        .await
        .unwrap();

    assert!(lw.list_workers(&[WorkerType::Official]).await.unwrap().is_empty());
    wait_until("stale worker removal", || {
        let store = store.clone();
        let key = keys.worker_key(WorkerType::Official, &id);
        let hb = keys.heartbeat_key(&id);
        async move {
            store.get(&key).await.unwrap().is_none() && store.get(&hb).await.unwrap().is_none()
        }
    })
    .await;
}

#[tokio::test]
async fn worker_runs_assigned_task_and_releases_key() {
    let (store, lw) = setup(slow_worker_config());
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |ctx, task| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((ctx.worker_id().clone(), task));
            Ok(())
        }
    });
    let worker = Worker::new(vec![handler]);
    let id = worker.id.clone();
    lw.register_candidate_worker(worker, cancel.clone()).await.unwrap();

    let task = LogicTask::new(tid("42"), Bytes::from_static(b"payload"));
    lw.assign_logic_task_to_worker(&id, &task).await.unwrap();

    let (ran_on, ran) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ran_on, id);
    assert_eq!(ran, task);

    let key = lw.keys().assignment_key(&id, &task.id);
    wait_until("assignment release", || {
        let store = store.clone();
        let key = key.clone();
        async move { store.get(&key).await.unwrap().is_none() }
    })
    .await;
    cancel.cancel();
}

#[tokio::test]
async fn cancel_logic_task_cancels_handler_context() {
    let (_store, lw) = setup(slow_worker_config());
    let cancel = CancellationToken::new();
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let (cancelled_tx, mut cancelled_rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |ctx, _task| {
        let started_tx = started_tx.clone();
        let cancelled_tx = cancelled_tx.clone();
        async move {
            let _ = started_tx.send(());
            ctx.cancelled().await;
            let _ = cancelled_tx.send(());
            Ok(())
        }
    });
    let worker = Worker::new(vec![handler]);
    let id = worker.id.clone();
    lw.register_candidate_worker(worker, cancel.clone()).await.unwrap();

    let task = LogicTask::new(tid("7"), Bytes::new());
    lw.assign_logic_task_to_worker(&id, &task).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), started_rx.recv())
        .await
        .unwrap();

    assert_eq!(lw.find_task_assignments(&task.id).await.unwrap(), vec![id.clone()]);
    assert_eq!(lw.cancel_logic_task(&task.id).await.unwrap(), 1);
    tokio::time::timeout(Duration::from_secs(5), cancelled_rx.recv())
        .await
        .unwrap();
    assert!(lw.find_task_assignments(&task.id).await.unwrap().is_empty());
    cancel.cancel();
}

#[tokio::test]
async fn worker_stops_when_registry_key_disappears() {
    let (store, lw) = setup(fast_worker_config());
    let cancel = CancellationToken::new();
    let worker = Worker::new(Vec::new());
    let id = worker.id.clone();
    let registered = lw.register_candidate_worker(worker, cancel.clone()).await.unwrap();

    let keys = lw.keys().clone();
    store.delete(&keys.worker_key(WorkerType::Candidate, &id)).await.unwrap();
    store.delete(&keys.worker_key(WorkerType::Official, &id)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), registered.stopped())
        .await
        .expect("worker stops after eviction");
    assert!(!cancel.is_cancelled());
}

#[tokio::test]
async fn membership_watch_tracks_official_workers() {
    let (store, lw) = setup(slow_worker_config());
    let keys = lw.keys().clone();
    put_official(&store, &keys, &wid("w1")).await;

    let mut events = lw.subscribe_membership();
    let cancel = CancellationToken::new();
    tokio::spawn(Arc::clone(&lw).run_membership_watch(cancel.clone()));

    let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, MembershipEvent::Snapshot(vec![wid("w1")]));

    put_official(&store, &keys, &wid("w2")).await;
    let added = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(added, MembershipEvent::Added(wid("w2")));

    store
        .delete(&keys.worker_key(WorkerType::Official, &wid("w1")))
        .await
        .unwrap();
    let removed = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(removed, MembershipEvent::Removed(wid("w1")));
    assert_eq!(lw.official_members().unwrap(), vec![wid("w2")]);
    cancel.cancel();
}

#[tokio::test]
async fn leader_orphans_every_task_of_a_removed_worker_once() {
    let (store, lw) = setup(slow_worker_config());
    let keys = lw.keys().clone();
    let (w1, w2) = (wid("w1"), wid("w2"));
    put_official(&store, &keys, &w1).await;
    put_official(&store, &keys, &w2).await;
    for (worker, task) in [(&w1, "1"), (&w2, "2"), (&w2, "3"), (&w2, "4")] {
        lw.assign_logic_task_to_worker(worker, &LogicTask::new(tid(task), Bytes::new()))
            .await
            .unwrap();
    }

    let mut events = lw.subscribe_task_events();
    let term = CancellationToken::new();
    tokio::spawn(Arc::clone(&lw).run_as_leader(term.clone()));
    // Let the coordinator consume its initial snapshots.
    tokio::time::sleep(Duration::from_millis(100)).await;

    lw.remove_worker_keys(&w2).await.unwrap();
    let event = next_task_event(&mut events).await;
    assert_eq!(
        event,
        TaskEvent::Orphaned {
            worker_id: w2.clone(),
            tasks: vec![tid("2"), tid("3"), tid("4")],
        }
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    term.cancel();
}

#[tokio::test]
async fn rebuild_orphans_assignments_of_missing_workers() {
    let (_store, lw) = setup(slow_worker_config());
    lw.assign_logic_task_to_worker(&wid("dead"), &LogicTask::new(tid("9"), Bytes::new()))
        .await
        .unwrap();

    let mut events = lw.subscribe_task_events();
    let term = CancellationToken::new();
    tokio::spawn(Arc::clone(&lw).run_as_leader(term.clone()));

    assert_eq!(
        next_task_event(&mut events).await,
        TaskEvent::Orphaned {
            worker_id: wid("dead"),
            tasks: vec![tid("9")],
        }
    );
    term.cancel();
}

#[tokio::test]
async fn released_assignment_of_live_worker_is_finished() {
    let (store, lw) = setup(slow_worker_config());
    let keys = lw.keys().clone();
    let w1 = wid("w1");
    put_official(&store, &keys, &w1).await;
    lw.assign_logic_task_to_worker(&w1, &LogicTask::new(tid("5"), Bytes::new()))
        .await
        .unwrap();

    let mut events = lw.subscribe_task_events();
    let term = CancellationToken::new();
    tokio::spawn(Arc::clone(&lw).run_as_leader(term.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(lw.delete_assignment(&w1, &tid("5")).await.unwrap());
    assert_eq!(
        next_task_event(&mut events).await,
        TaskEvent::Finished {
            worker_id: w1,
            task: tid("5"),
        }
    );
    term.cancel();
}

#[tokio::test]
async fn cleanup_removes_dangling_keys() {
    let (store, lw) = setup(slow_worker_config());
    let keys = lw.keys().clone();
    let live = wid("live");
    put_official(&store, &keys, &live).await;
    store
        .put(&keys.heartbeat_key(&wid("gone")), Bytes::from_static(b"1"))
        .await
        .unwrap();
    lw.assign_logic_task_to_worker(&wid("gone"), &LogicTask::new(tid("11"), Bytes::new()))
        .await
        .unwrap();
    lw.assign_logic_task_to_worker(&live, &LogicTask::new(tid("12"), Bytes::new()))
        .await
        .unwrap();

    let mut events = lw.subscribe_task_events();
    lw.cleanup_dangling_keys().await.unwrap();

    assert!(store.get(&keys.heartbeat_key(&wid("gone"))).await.unwrap().is_none());
    assert!(store.get(&keys.heartbeat_key(&live)).await.unwrap().is_some());
    assert_eq!(lw.find_task_assignments(&tid("11")).await.unwrap(), Vec::<WorkerId>::new());
    assert_eq!(lw.find_task_assignments(&tid("12")).await.unwrap(), vec![live]);
    assert_eq!(
        next_task_event(&mut events).await,
        TaskEvent::Orphaned {
            worker_id: wid("gone"),
            tasks: vec![tid("11")],
        }
    );
}

#[tokio::test]
async fn liveness_probe_removes_dead_workers_on_the_leader() {
    let (store, lw) = setup(fast_worker_config());
    let keys = lw.keys().clone();
    let id = wid("silent");
    put_official(&store, &keys, &id).await;

    let term = CancellationToken::new();
    tokio::spawn(Arc::clone(&lw).run_as_leader(term.clone()));

    // No heartbeat loop is running for this worker, so it goes stale.
    wait_until("dead worker removal", || {
        let store = store.clone();
        let key = keys.worker_key(WorkerType::Official, &id);
        async move { store.get(&key).await.unwrap().is_none() }
    })
    .await;
    term.cancel();
}

#[tokio::test]
async fn assignment_is_refused_while_another_worker_holds_the_task() {
    let (store, lw) = setup(slow_worker_config());
    let keys = lw.keys().clone();
    let (w1, w2) = (wid("w1"), wid("w2"));
    put_official(&store, &keys, &w1).await;
    put_official(&store, &keys, &w2).await;
    let task = LogicTask::new(tid("13"), Bytes::from_static(b"first"));

    assert!(lw.assign_logic_task_to_worker(&w1, &task).await.unwrap().is_some());
    assert_eq!(lw.assign_logic_task_to_worker(&w2, &task).await.unwrap(), None);
    assert_eq!(lw.find_task_assignments(&task.id).await.unwrap(), vec![w1.clone()]);
    // Rewriting the holder's own key is still allowed.
    assert!(lw.assign_logic_task_to_worker(&w1, &task).await.unwrap().is_some());

    // A leftover key under an unregistered worker blocks the write too.
    let other = LogicTask::new(tid("14"), Bytes::new());
    assert!(lw.assign_logic_task_to_worker(&wid("gone"), &other).await.unwrap().is_some());
    assert_eq!(lw.assign_logic_task_to_worker(&w2, &other).await.unwrap(), None);
    assert_eq!(lw.find_task_assignments(&other.id).await.unwrap(), vec![wid("gone")]);
}
