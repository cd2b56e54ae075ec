//! Leader elector backed by a coordination-store lease.
//!
//! The election key `{prefix}/election/{lock_key}` holds the leader's instance
//! ID and is bound to a lease. Acquisition is a transaction that only writes
//! the key when it is missing; renewal keeps the lease alive and confirms the
//! key still carries our ID under our lease; release revokes the lease, which
//! deletes the key.
//!
//! Lease tokens have the form `{lease}:{instance_id}`.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use keel_core::coord::{Compare, LeaseId, SharedStore, Txn, TxnOp};

use super::{LeaderElector, LeadershipResult, RenewalResult};
use crate::error::Result;
use crate::keys::KeyLayout;

/// Leader elector on a [`CoordinationStore`](keel_core::CoordinationStore).
#[derive(Debug, Clone)]
pub struct StoreLeaderElector {
    store: SharedStore,
    keys: KeyLayout,
    lease_ttl: Duration,
}

fn encode_token(lease: LeaseId, instance_id: &str) -> String {
    format!("{}:{instance_id}", lease.get())
}

fn decode_token(token: &str) -> Option<(LeaseId, &str)> {
    let (lease, instance_id) = token.split_once(':')?;
    if instance_id.is_empty() {
        return None;
    }
    Some((LeaseId::new(lease.parse().ok()?), instance_id))
}

impl StoreLeaderElector {
    /// Creates an elector whose leases live for `lease_ttl` unless renewed.
    #[must_use]
    pub fn new(store: SharedStore, keys: KeyLayout, lease_ttl: Duration) -> Self {
        Self {
            store,
            keys,
            lease_ttl,
        }
    }

    /// Returns true if the election key carries `instance_id` under `lease`.
    async fn holds(&self, key: &str, lease: LeaseId, instance_id: &str) -> Result<bool> {
        Ok(self
            .store
            .get(key)
            .await?
            .is_some_and(|kv| kv.lease == Some(lease) && kv.value == instance_id.as_bytes()))
    }
}

#[async_trait]
impl LeaderElector for StoreLeaderElector {
    async fn try_acquire(&self, lock_key: &str, instance_id: &str) -> Result<LeadershipResult> {
        let key = self.keys.election_key(lock_key);
        let lease = self.store.grant_lease(self.lease_ttl).await?;
        let value = Bytes::from(instance_id.to_string());
        let put = TxnOp::Put {
            key: key.clone(),
            value: value.clone(),
            lease: Some(lease),
        };

        let mut acquired = self
            .store
            .txn(Txn::new().when(Compare::Missing(key.clone())).then(put.clone()))
            .await?
            .succeeded;
        if !acquired {
            // Our own key from an earlier term: move it onto the fresh lease.
            acquired = self
                .store
                .txn(Txn::new().when(Compare::ValueEquals(key.clone(), value)).then(put))
                .await?
                .succeeded;
        }

        if acquired {
            tracing::info!(lock_key, instance_id, lease = %lease, "acquired leadership");
            return Ok(LeadershipResult::Acquired {
                lease_token: encode_token(lease, instance_id),
                lease_duration: self.lease_ttl,
            });
        }

        if let Err(e) = self.store.revoke_lease(lease).await {
            tracing::debug!(error = %e, "failed to revoke unused lease");
        }
        Ok(LeadershipResult::NotLeader {
            current_leader: self.current_leader(lock_key).await?,
        })
    }

    async fn renew(&self, lock_key: &str, lease_token: &str) -> Result<RenewalResult> {
        let Some((lease, instance_id)) = decode_token(lease_token) else {
            return Ok(RenewalResult::InvalidToken);
        };
        if !self.store.keep_alive(lease).await? {
            return Ok(RenewalResult::Lost);
        }
        if !self
            .holds(&self.keys.election_key(lock_key), lease, instance_id)
            .await?
        {
            return Ok(RenewalResult::Lost);
        }
        Ok(RenewalResult::Renewed {
            lease_duration: self.lease_ttl,
        })
    }

    async fn release(&self, lock_key: &str, lease_token: &str) -> Result<bool> {
        let Some((lease, instance_id)) = decode_token(lease_token) else {
            return Ok(false);
        };
        let held = self
            .holds(&self.keys.election_key(lock_key), lease, instance_id)
            .await?;
        self.store.revoke_lease(lease).await?;
        if held {
            tracing::info!(lock_key, instance_id, "released leadership");
        }
        Ok(held)
    }

    async fn current_leader(&self, lock_key: &str) -> Result<Option<String>> {
        let Some(kv) = self.store.get(&self.keys.election_key(lock_key)).await? else {
            return Ok(None);
        };
        Ok(Some(kv.value_str()?.to_string()))
    }
}
