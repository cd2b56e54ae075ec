//! Coordination-store contract.
//!
//! Every piece of shared state in keel lives in a linearizable, watch-capable
//! key-value store (etcd in production). This module defines the subset of
//! that store the engine relies on:
//!
//! - point reads, writes and deletes, optionally bound to a lease
//! - sorted prefix listings
//! - multi-key transactions guarded by existence and value compares
//! - prefix watches delivering events in revision order
//! - leases that expire unless kept alive
//!
//! [`memory::InMemoryCoordinationStore`] implements the contract for tests
//! and single-process deployments. [`watch::spawn_prefix_watch`] turns a raw
//! watch into a self-healing event feed.

pub mod memory;
pub mod watch;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::{Error, Result};

/// A coordination store shared across components.
pub type SharedStore = Arc<dyn CoordinationStore>;

/// A stream of watch events for one prefix.
///
/// The stream ends (`None`) when the store can no longer guarantee delivery,
/// for example because the consumer fell behind. Consumers re-establish it.
pub type WatchStream = BoxStream<'static, WatchEvent>;

/// Identifier of a lease granted by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(i64);

impl LeaseId {
    /// Wraps a raw lease ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A key and its current value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// Full key.
    pub key: String,
    /// Stored value. For delete events, the value before deletion.
    pub value: Bytes,
    /// Revision at which the key was created.
    pub create_revision: i64,
    /// Revision of the last modification.
    pub mod_revision: i64,
    /// Lease the key is attached to, if any.
    pub lease: Option<LeaseId>,
}

impl KeyValue {
    /// Returns the value as UTF-8.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecord`] if the value is not valid UTF-8.
    pub fn value_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.value)
            .map_err(|e| Error::invalid_record(&self.key, format!("value is not UTF-8: {e}")))
    }

    /// Returns the portion of the key after `prefix`, if the key starts with it.
    #[must_use]
    pub fn key_suffix(&self, prefix: &str) -> Option<&str> {
        self.key.strip_prefix(prefix)
    }
}

/// Kind of change carried by a [`WatchEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// The key was created or overwritten.
    Put,
    /// The key was deleted (explicitly or by lease expiry).
    Delete,
}

/// A single change observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Put or delete.
    pub kind: WatchEventKind,
    /// The affected key and value.
    pub kv: KeyValue,
    /// Store revision at which the change was applied.
    pub revision: i64,
}

impl WatchEvent {
    /// Returns true for put events.
    #[must_use]
    pub fn is_put(&self) -> bool {
        self.kind == WatchEventKind::Put
    }

    /// Returns true for delete events.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.kind == WatchEventKind::Delete
    }
}

/// A guard evaluated at the start of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    /// The key must exist.
    Exists(String),
    /// The key must not exist.
    Missing(String),
    /// The key must exist with exactly this value.
    ValueEquals(String, Bytes),
}

/// A mutation applied by a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    /// Writes a key.
    Put {
        /// Key to write.
        key: String,
        /// Value to store.
        value: Bytes,
        /// Optional lease binding.
        lease: Option<LeaseId>,
    },
    /// Deletes a key. Deleting a missing key is not an error.
    Delete {
        /// Key to delete.
        key: String,
    },
}

impl TxnOp {
    /// Builds a put without a lease.
    #[must_use]
    pub fn put(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
            lease: None,
        }
    }

    /// Builds a delete.
    #[must_use]
    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }
}

/// An atomic compare-and-apply transaction.
///
/// If every compare holds, the `success` ops are applied; otherwise the
/// `failure` ops are. Either branch is applied atomically.
///
/// ```rust
/// use keel_core::coord::{Compare, Txn, TxnOp};
///
/// let promote = Txn::new()
///     .when(Compare::Exists("/p/worker/type/candidate/w1".into()))
///     .then(TxnOp::delete("/p/worker/type/candidate/w1"))
///     .then(TxnOp::put("/p/worker/type/official/w1", "{}"));
/// assert_eq!(promote.success.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    /// Guards evaluated before applying.
    pub compares: Vec<Compare>,
    /// Ops applied when every compare holds.
    pub success: Vec<TxnOp>,
    /// Ops applied otherwise.
    pub failure: Vec<TxnOp>,
}

impl Txn {
    /// Creates an empty transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a compare.
    #[must_use]
    pub fn when(mut self, compare: Compare) -> Self {
        self.compares.push(compare);
        self
    }

    /// Adds an op to the success branch.
    #[must_use]
    pub fn then(mut self, op: TxnOp) -> Self {
        self.success.push(op);
        self
    }

    /// Adds an op to the failure branch.
    #[must_use]
    pub fn otherwise(mut self, op: TxnOp) -> Self {
        self.failure.push(op);
        self
    }
}

/// Outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnResult {
    /// Whether every compare held.
    pub succeeded: bool,
    /// Store revision after the transaction.
    pub revision: i64,
}

/// The coordination-store contract.
///
/// Implementations must be linearizable: a write acknowledged to one caller is
/// visible to every subsequent read from any caller. Every applied mutation
/// advances a single store-wide revision, and watches deliver events in
/// revision order.
///
/// Transient failures (network, timeout, unavailability) are reported as
/// [`Error::Storage`]; callers in background loops retry them.
#[async_trait]
pub trait CoordinationStore: Send + Sync + fmt::Debug {
    /// Reads a single key. Returns `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Writes a key, returning the new revision.
    async fn put(&self, key: &str, value: Bytes) -> Result<i64>;

    /// Writes a key bound to a lease; the key is deleted when the lease expires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the lease does not exist or has expired.
    async fn put_with_lease(&self, key: &str, value: Bytes, lease: LeaseId) -> Result<i64>;

    /// Deletes a key. Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Lists every key starting with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Applies a transaction atomically.
    async fn txn(&self, txn: Txn) -> Result<TxnResult>;

    /// Watches every key starting with `prefix` from the current revision on.
    async fn watch(&self, prefix: &str) -> Result<WatchStream>;

    /// Grants a lease with the given time-to-live.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Refreshes a lease. Returns `false` if the lease has already expired.
    async fn keep_alive(&self, lease: LeaseId) -> Result<bool>;

    /// Revokes a lease, deleting every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;
}
