//! Self-healing prefix watch.
//!
//! [`spawn_prefix_watch`] runs one task per watched prefix. The task
//! subscribes to the prefix, publishes a [`PrefixEvent::Snapshot`] of the
//! current contents, then forwards every change as [`PrefixEvent::Change`].
//! When the underlying stream ends (lag, disconnect, compaction) the task
//! re-subscribes and publishes a fresh snapshot, so a consumer can always
//! reconcile its view against the snapshot instead of trusting that no event
//! was missed.
//!
//! Events are delivered on a bounded channel to a single consumer, which
//! preserves the store's revision order.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{KeyValue, SharedStore, WatchEvent};

/// An event published by a prefix watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefixEvent {
    /// The full contents of the prefix, published each time the watch is
    /// (re)established. Keys absent from a snapshot no longer exist.
    Snapshot(Vec<KeyValue>),
    /// An incremental change.
    Change(WatchEvent),
}

/// Spawns a task that watches `prefix` until `cancel` fires or the receiver
/// is dropped.
///
/// Store failures while (re)establishing are logged and retried after
/// `retry_interval`.
#[must_use]
pub fn spawn_prefix_watch(
    store: SharedStore,
    prefix: impl Into<String>,
    capacity: usize,
    retry_interval: Duration,
    cancel: CancellationToken,
) -> mpsc::Receiver<PrefixEvent> {
    let prefix = prefix.into();
    let (tx, rx) = mpsc::channel(capacity.max(1));

    tokio::spawn(async move {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            // Subscribe before listing so changes racing with the listing are
            // still delivered after the snapshot.
            let mut stream = match store.watch(&prefix).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(%prefix, error = %e, "failed to establish watch, retrying");
                    if sleep_or_cancel(retry_interval, &cancel).await {
                        return;
                    }
                    continue;
                }
            };
            let snapshot = match store.list(&prefix).await {
                Ok(kvs) => kvs,
                Err(e) => {
                    tracing::warn!(%prefix, error = %e, "failed to list prefix, retrying");
                    if sleep_or_cancel(retry_interval, &cancel).await {
                        return;
                    }
                    continue;
                }
            };
            if !send(&tx, PrefixEvent::Snapshot(snapshot), &cancel).await {
                return;
            }

            loop {
                let next = tokio::select! {
                    () = cancel.cancelled() => return,
                    next = stream.next() => next,
                };
                let Some(event) = next else {
                    tracing::debug!(%prefix, "watch stream ended, re-establishing");
                    break;
                };
                if !send(&tx, PrefixEvent::Change(event), &cancel).await {
                    return;
                }
            }
        }
    });

    rx
}

/// Returns false when the consumer is gone or the watch was cancelled.
async fn send(
    tx: &mpsc::Sender<PrefixEvent>,
    event: PrefixEvent,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

/// Returns true if cancelled while sleeping.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::coord::CoordinationStore;
    use crate::coord::memory::InMemoryCoordinationStore;

    async fn expect_snapshot(rx: &mut mpsc::Receiver<PrefixEvent>) -> Vec<String> {
        match rx.recv().await {
            Some(PrefixEvent::Snapshot(kvs)) => kvs.into_iter().map(|kv| kv.key).collect(),
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn publishes_snapshot_then_changes() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        store.put("/w/a", Bytes::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let mut rx = spawn_prefix_watch(
            store.clone(),
            "/w/",
            16,
            Duration::from_millis(10),
            cancel.clone(),
        );
        assert_eq!(expect_snapshot(&mut rx).await, vec!["/w/a"]);

        store.put("/w/b", Bytes::new()).await.unwrap();
        match rx.recv().await {
            Some(PrefixEvent::Change(event)) => {
                assert!(event.is_put());
                assert_eq!(event.kv.key, "/w/b");
            }
            other => panic!("expected change, got {other:?}"),
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn re_establishes_after_lag() {
        let store = Arc::new(InMemoryCoordinationStore::with_watch_capacity(1));
        let cancel = CancellationToken::new();
        let mut rx = spawn_prefix_watch(
            store.clone(),
            "/w/",
            1,
            Duration::from_millis(10),
            cancel.clone(),
        );
        assert!(expect_snapshot(&mut rx).await.is_empty());

        // Overflow the store's broadcast buffer while the consumer is idle.
        for i in 0..8 {
            store.put(&format!("/w/{i}"), Bytes::new()).await.unwrap();
        }

        let mut saw_full_snapshot = false;
        while let Some(event) = rx.recv().await {
            if let PrefixEvent::Snapshot(kvs) = event {
                if kvs.len() == 8 {
                    saw_full_snapshot = true;
                    break;
                }
            }
        }
        assert!(saw_full_snapshot);
        cancel.cancel();
    }

    #[tokio::test]
    async fn retries_while_store_unavailable() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        store.set_unavailable(true);
        let cancel = CancellationToken::new();
        let mut rx = spawn_prefix_watch(
            store.clone(),
            "/w/",
            4,
            Duration::from_millis(5),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.set_unavailable(false);
        assert!(expect_snapshot(&mut rx).await.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancellation_closes_channel() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let cancel = CancellationToken::new();
        let mut rx = spawn_prefix_watch(store, "/w/", 4, Duration::from_millis(5), cancel.clone());
        let _ = rx.recv().await;
        cancel.cancel();
        assert!(rx.recv().await.is_none());
    }
}
