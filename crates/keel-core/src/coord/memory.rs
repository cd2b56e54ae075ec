//! In-memory coordination store for testing and single-process deployments.
//!
//! This module provides [`InMemoryCoordinationStore`], an implementation of
//! [`CoordinationStore`] with etcd-like semantics: a single store-wide
//! revision, revision-ordered watches, and leases.
//!
//! ## Limitations
//!
//! - **NOT suitable for multi-process deployments**: State is local to the process
//! - **No persistence**: All state is lost when the process exits
//! - **Lazy lease expiry**: Expired leases are collected at the start of the next
//!   store operation, not by a background timer
//! - **Lagging watchers are dropped**: A watch stream whose consumer falls more
//!   than the channel capacity behind ends and must be re-established

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{
    Compare, CoordinationStore, KeyValue, LeaseId, Txn, TxnOp, TxnResult, WatchEvent,
    WatchEventKind, WatchStream,
};
use crate::error::{Error, Result};

const DEFAULT_WATCH_CAPACITY: usize = 1024;

#[derive(Debug)]
struct LeaseState {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct State {
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseState>,
    revision: i64,
    next_lease: i64,
}

impl State {
    fn expire_leases(&mut self, now: Instant, events: &mut Vec<WatchEvent>) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            tracing::debug!(lease = %id, "lease expired");
            self.remove_lease(id, events);
        }
    }

    fn remove_lease(&mut self, id: LeaseId, events: &mut Vec<WatchEvent>) {
        let Some(lease) = self.leases.remove(&id) else {
            return;
        };
        let revision = self.revision + 1;
        let mut mutated = false;
        for key in lease.keys {
            mutated |= self.apply_delete(&key, revision, events);
        }
        if mutated {
            self.revision = revision;
        }
    }

    fn check_lease(&self, lease: Option<LeaseId>) -> Result<()> {
        match lease {
            Some(id) if !self.leases.contains_key(&id) => Err(Error::not_found("lease", id)),
            _ => Ok(()),
        }
    }

    fn apply_put(
        &mut self,
        key: &str,
        value: Bytes,
        lease: Option<LeaseId>,
        revision: i64,
        events: &mut Vec<WatchEvent>,
    ) {
        let create_revision = match self.kvs.get(key) {
            Some(existing) => {
                if existing.lease != lease {
                    if let Some(old) = existing.lease.and_then(|id| self.leases.get_mut(&id)) {
                        old.keys.remove(key);
                    }
                }
                existing.create_revision
            }
            None => revision,
        };
        if let Some(new) = lease.and_then(|id| self.leases.get_mut(&id)) {
            new.keys.insert(key.to_string());
        }

        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision,
            mod_revision: revision,
            lease,
        };
        self.kvs.insert(key.to_string(), kv.clone());
        events.push(WatchEvent {
            kind: WatchEventKind::Put,
            kv,
            revision,
        });
    }

    fn apply_delete(&mut self, key: &str, revision: i64, events: &mut Vec<WatchEvent>) -> bool {
        let Some(kv) = self.kvs.remove(key) else {
            return false;
        };
        if let Some(lease) = kv.lease.and_then(|id| self.leases.get_mut(&id)) {
            lease.keys.remove(key);
        }
        events.push(WatchEvent {
            kind: WatchEventKind::Delete,
            kv,
            revision,
        });
        true
    }

    fn compare_holds(&self, compare: &Compare) -> bool {
        match compare {
            Compare::Exists(key) => self.kvs.contains_key(key),
            Compare::Missing(key) => !self.kvs.contains_key(key),
            Compare::ValueEquals(key, value) => {
                self.kvs.get(key).is_some_and(|kv| &kv.value == value)
            }
        }
    }

    fn apply_ops(&mut self, ops: Vec<TxnOp>, events: &mut Vec<WatchEvent>) -> Result<i64> {
        for op in &ops {
            if let TxnOp::Put { lease, .. } = op {
                self.check_lease(*lease)?;
            }
        }

        let revision = self.revision + 1;
        let mut mutated = false;
        for op in ops {
            match op {
                TxnOp::Put { key, value, lease } => {
                    self.apply_put(&key, value, lease, revision, events);
                    mutated = true;
                }
                TxnOp::Delete { key } => {
                    mutated |= self.apply_delete(&key, revision, events);
                }
            }
        }
        if mutated {
            self.revision = revision;
        }
        Ok(self.revision)
    }
}

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("coordination store lock poisoned")
}

/// In-memory coordination store.
///
/// Cloning is not supported; share it behind an `Arc` (see
/// [`SharedStore`](super::SharedStore)).
///
/// ## Example
///
/// ```rust
/// use keel_core::coord::CoordinationStore;
/// use keel_core::coord::memory::InMemoryCoordinationStore;
///
/// # tokio_test::block_on(async {
/// let store = InMemoryCoordinationStore::new();
/// store.put("/keel/heartbeat/w1", "1760000000".into()).await?;
/// assert!(store.get("/keel/heartbeat/w1").await?.is_some());
/// # Ok::<_, keel_core::Error>(())
/// # }).unwrap();
/// ```
#[derive(Debug)]
pub struct InMemoryCoordinationStore {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
    unavailable: AtomicBool,
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_watch_capacity(DEFAULT_WATCH_CAPACITY)
    }

    /// Creates an empty store whose watchers may lag at most `capacity` events.
    #[must_use]
    pub fn with_watch_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Mutex::new(State::default()),
            events,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent operation fail with a transient storage error
    /// (or succeed again when `false`). Existing watch streams are unaffected.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns the current store revision.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn revision(&self) -> Result<i64> {
        self.with_state(|state, _| Ok(state.revision))
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::storage("coordination store unavailable"));
        }
        Ok(())
    }

    /// Runs `f` under the state lock after collecting expired leases, then
    /// publishes the produced events in order while still holding the lock.
    fn with_state<R>(
        &self,
        f: impl FnOnce(&mut State, &mut Vec<WatchEvent>) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let mut events = Vec::new();
        state.expire_leases(Instant::now(), &mut events);
        let result = f(&mut state, &mut events);
        for event in events {
            let _ = self.events.send(event);
        }
        drop(state);
        result
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        self.check_available()?;
        self.with_state(|state, _| Ok(state.kvs.get(key).cloned()))
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<i64> {
        self.check_available()?;
        self.with_state(|state, events| {
            state.apply_ops(
                vec![TxnOp::Put {
                    key: key.to_string(),
                    value,
                    lease: None,
                }],
                events,
            )
        })
    }

    async fn put_with_lease(&self, key: &str, value: Bytes, lease: LeaseId) -> Result<i64> {
        self.check_available()?;
        self.with_state(|state, events| {
            state.apply_ops(
                vec![TxnOp::Put {
                    key: key.to_string(),
                    value,
                    lease: Some(lease),
                }],
                events,
            )
        })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        self.with_state(|state, events| {
            let before = state.revision;
            state.apply_ops(vec![TxnOp::delete(key)], events)?;
            Ok(state.revision != before)
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        self.check_available()?;
        self.with_state(|state, _| {
            Ok(state
                .kvs
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(_, kv)| kv.clone())
                .collect())
        })
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResult> {
        self.check_available()?;
        self.with_state(|state, events| {
            let succeeded = txn.compares.iter().all(|c| state.compare_holds(c));
            let ops = if succeeded { txn.success } else { txn.failure };
            let revision = state.apply_ops(ops, events)?;
            Ok(TxnResult {
                succeeded,
                revision,
            })
        })
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        self.check_available()?;
        // Subscribe under the lock so no event between subscription and the
        // caller's next read can be missed.
        let rx = self.with_state(|_, _| Ok(self.events.subscribe()))?;
        let prefix = prefix.to_string();
        let stream = futures::stream::unfold((rx, prefix), |(mut rx, prefix)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.kv.key.starts_with(&prefix) => {
                        return Some((event, (rx, prefix)));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(%prefix, skipped, "watcher lagged, ending stream");
                        return None;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        self.check_available()?;
        self.with_state(|state, _| {
            state.next_lease += 1;
            let id = LeaseId::new(state.next_lease);
            state.leases.insert(
                id,
                LeaseState {
                    ttl,
                    deadline: Instant::now() + ttl,
                    keys: BTreeSet::new(),
                },
            );
            Ok(id)
        })
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<bool> {
        self.check_available()?;
        self.with_state(|state, _| {
            Ok(match state.leases.get_mut(&lease) {
                Some(l) => {
                    l.deadline = Instant::now() + l.ttl;
                    true
                }
                None => false,
            })
        })
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.check_available()?;
        self.with_state(|state, events| {
            state.remove_lease(lease, events);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn put_get_delete() -> Result<()> {
        let store = InMemoryCoordinationStore::new();
        let rev = store.put("/a", Bytes::from_static(b"1")).await?;
        assert_eq!(rev, 1);

        let kv = store.get("/a").await?.expect("key present");
        assert_eq!(kv.value, Bytes::from_static(b"1"));
        assert_eq!(kv.create_revision, 1);

        store.put("/a", Bytes::from_static(b"2")).await?;
        let kv = store.get("/a").await?.expect("key present");
        assert_eq!(kv.create_revision, 1);
        assert_eq!(kv.mod_revision, 2);

        assert!(store.delete("/a").await?);
        assert!(!store.delete("/a").await?);
        assert!(store.get("/a").await?.is_none());
        assert_eq!(store.revision()?, 3);
        Ok(())
    }

    #[tokio::test]
    async fn list_is_prefix_scoped_and_sorted() -> Result<()> {
        let store = InMemoryCoordinationStore::new();
        store.put("/p/b", Bytes::new()).await?;
        store.put("/p/a", Bytes::new()).await?;
        store.put("/pa", Bytes::new()).await?;
        store.put("/q/a", Bytes::new()).await?;

        let keys: Vec<String> = store.list("/p/").await?.into_iter().map(|kv| kv.key).collect();
        assert_eq!(keys, vec!["/p/a", "/p/b"]);
        Ok(())
    }

    #[tokio::test]
    async fn txn_applies_branch_atomically() -> Result<()> {
        let store = InMemoryCoordinationStore::new();
        store.put("/cand/w1", Bytes::from_static(b"c")).await?;

        let promote = Txn::new()
            .when(Compare::Exists("/cand/w1".into()))
            .then(TxnOp::delete("/cand/w1"))
            .then(TxnOp::put("/off/w1", "o"));
        let result = store.txn(promote.clone()).await?;
        assert!(result.succeeded);
        assert!(store.get("/cand/w1").await?.is_none());
        assert!(store.get("/off/w1").await?.is_some());

        let again = store.txn(promote).await?;
        assert!(!again.succeeded);
        assert_eq!(again.revision, result.revision);
        Ok(())
    }

    #[tokio::test]
    async fn txn_value_compare() -> Result<()> {
        let store = InMemoryCoordinationStore::new();
        store.put("/k", Bytes::from_static(b"me")).await?;

        let guarded = |expected: &'static [u8]| {
            Txn::new()
                .when(Compare::ValueEquals("/k".into(), Bytes::from_static(expected)))
                .then(TxnOp::delete("/k"))
        };
        assert!(!store.txn(guarded(b"other")).await?.succeeded);
        assert!(store.txn(guarded(b"me")).await?.succeeded);
        assert!(store.get("/k").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn watch_delivers_prefix_events_in_order() -> Result<()> {
        let store = InMemoryCoordinationStore::new();
        let mut stream = store.watch("/w/").await?;

        store.put("/w/1", Bytes::from_static(b"x")).await?;
        store.put("/other", Bytes::new()).await?;
        store.delete("/w/1").await?;

        let first = stream.next().await.expect("put event");
        assert!(first.is_put());
        assert_eq!(first.kv.key, "/w/1");
        let second = stream.next().await.expect("delete event");
        assert!(second.is_delete());
        assert_eq!(second.kv.value, Bytes::from_static(b"x"));
        assert!(second.revision > first.revision);
        Ok(())
    }

    #[tokio::test]
    async fn lagging_watch_ends() -> Result<()> {
        let store = InMemoryCoordinationStore::with_watch_capacity(2);
        let mut stream = store.watch("/w/").await?;
        for i in 0..5 {
            store.put(&format!("/w/{i}"), Bytes::new()).await?;
        }
        assert!(stream.next().await.is_none());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expiry_deletes_keys_and_emits_events() -> Result<()> {
        let store = InMemoryCoordinationStore::new();
        let lease = store.grant_lease(Duration::from_secs(10)).await?;
        store
            .put_with_lease("/election/leader", Bytes::from_static(b"n1"), lease)
            .await?;
        let mut stream = store.watch("/election/").await?;

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(store.keep_alive(lease).await?);
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.get("/election/leader").await?.is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("/election/leader").await?.is_none());
        assert!(!store.keep_alive(lease).await?);

        let event = stream.next().await.expect("delete event");
        assert!(event.is_delete());
        Ok(())
    }

    #[tokio::test]
    async fn put_with_unknown_lease_fails() {
        let store = InMemoryCoordinationStore::new();
        let err = store
            .put_with_lease("/k", Bytes::new(), LeaseId::new(99))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(store.get("/k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn revoke_lease_removes_attached_keys() -> Result<()> {
        let store = InMemoryCoordinationStore::new();
        let lease = store.grant_lease(Duration::from_secs(60)).await?;
        store.put_with_lease("/a", Bytes::new(), lease).await?;
        store.put_with_lease("/b", Bytes::new(), lease).await?;
        // Rewriting without the lease detaches the key.
        store.put("/b", Bytes::new()).await?;

        store.revoke_lease(lease).await?;
        assert!(store.get("/a").await?.is_none());
        assert!(store.get("/b").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_store_fails_transiently() {
        let store = InMemoryCoordinationStore::new();
        store.set_unavailable(true);
        let err = store.put("/k", Bytes::new()).await.unwrap_err();
        assert!(err.is_transient());

        store.set_unavailable(false);
        assert!(store.put("/k", Bytes::new()).await.is_ok());
    }
}
