//! Leader election on the coordination store.
//!
//! The [`LeaderElector`] trait is the lease-based primitive: acquire, renew,
//! release, and ask who currently leads. [`StoreLeaderElector`] implements it
//! on a [`CoordinationStore`](keel_core::CoordinationStore) lease, so the
//! election key disappears on its own when the leader stops renewing.
//!
//! [`Campaign`] turns the primitive into the `OnLeader` contract:
//!
//! - callbacks registered with [`Campaign::on_leader`] run on at most one
//!   process at a time
//! - every leadership term gets a fresh cancellation token, cancelled as soon
//!   as the lease is lost or the process shuts down
//! - a new term starts only after every callback of the previous one returned

mod campaign;
mod store;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use campaign::{Campaign, LeaderState};
pub use store::StoreLeaderElector;

/// Result of a leadership acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipResult {
    /// Successfully acquired leadership.
    Acquired {
        /// Lease token that must be used for renewal.
        lease_token: String,
        /// Duration until the lease expires.
        lease_duration: Duration,
    },
    /// Leadership is held by another instance.
    NotLeader {
        /// Identifier of the current leader, if known.
        current_leader: Option<String>,
    },
}

impl LeadershipResult {
    /// Returns true if leadership was acquired.
    #[must_use]
    pub const fn is_leader(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }

    /// Returns the lease token if leadership was acquired.
    #[must_use]
    pub fn lease_token(&self) -> Option<&str> {
        match self {
            Self::Acquired { lease_token, .. } => Some(lease_token),
            Self::NotLeader { .. } => None,
        }
    }
}

/// Result of a lease renewal attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalResult {
    /// Successfully renewed the lease.
    Renewed {
        /// New lease duration.
        lease_duration: Duration,
    },
    /// Lease has expired or the key now belongs to another instance.
    Lost,
    /// The provided lease token is invalid.
    InvalidToken,
}

impl RenewalResult {
    /// Returns true if the lease was successfully renewed.
    #[must_use]
    pub const fn is_renewed(&self) -> bool {
        matches!(self, Self::Renewed { .. })
    }
}

/// Lease-based leader election.
///
/// ## Example Usage
///
/// ```rust,no_run
/// use std::time::Duration;
///
/// use keel_flow::election::{LeaderElector, LeadershipResult};
/// use keel_flow::error::Result;
///
/// async fn lead() {}
///
/// async fn run<L: LeaderElector>(elector: &L, instance_id: &str) -> Result<()> {
///     loop {
///         match elector.try_acquire("leader", instance_id).await? {
///             LeadershipResult::Acquired { lease_token, .. } => {
///                 lead().await;
///                 elector.renew("leader", &lease_token).await?;
///             }
///             LeadershipResult::NotLeader { .. } => {
///                 tokio::time::sleep(Duration::from_secs(2)).await;
///             }
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait LeaderElector: Send + Sync + std::fmt::Debug {
    /// Attempts to acquire leadership for a lock key.
    ///
    /// An instance that still holds the key from an earlier term re-acquires
    /// it under a fresh lease.
    async fn try_acquire(&self, lock_key: &str, instance_id: &str) -> Result<LeadershipResult>;

    /// Renews an existing lease. Must be called before the lease expires.
    async fn renew(&self, lock_key: &str, lease_token: &str) -> Result<RenewalResult>;

    /// Voluntarily releases leadership so another instance can take over
    /// without waiting for the lease to expire.
    ///
    /// Returns `false` if the lease was already gone or held by another instance.
    async fn release(&self, lock_key: &str, lease_token: &str) -> Result<bool>;

    /// Returns the current leader for a lock key, if any.
    async fn current_leader(&self, lock_key: &str) -> Result<Option<String>>;
}
