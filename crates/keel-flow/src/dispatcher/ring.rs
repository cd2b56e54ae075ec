//! Consistent hashing with bounded loads.
//!
//! Keys hash into one of `partition_count` partitions. Each member places
//! `replication_factor` virtual nodes on a 64-bit hash circle, and every
//! partition is owned by the first virtual node at or after the partition's
//! hash whose member still has room. A member owns at most
//! `ceil(partition_count / members * load)` partitions, so no member can be
//! overloaded by hash bad luck.
//!
//! The ring is a pure function of its member set and parameters: two rings
//! built from the same members, in any insertion order, locate every key on
//! the same member.

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};

use keel_core::WorkerId;

use crate::config::RingConfig;

/// Hashes bytes to a ring position: the first eight bytes of their SHA-256.
fn hash(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut head = [0_u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Bounded-load consistent-hash ring over official workers.
#[derive(Debug, Clone)]
pub struct HashRing {
    config: RingConfig,
    members: BTreeSet<WorkerId>,
    /// Virtual nodes sorted by position; the member breaks hash ties.
    circle: Vec<(u64, WorkerId)>,
    /// Owner of each partition; empty when the ring has no members.
    partitions: Vec<WorkerId>,
    loads: BTreeMap<WorkerId, usize>,
}

impl HashRing {
    /// Creates an empty ring.
    #[must_use]
    pub fn new(config: RingConfig) -> Self {
        Self {
            config: RingConfig {
                partition_count: config.partition_count.max(1),
                replication_factor: config.replication_factor.max(1),
                load: config.load,
            },
            members: BTreeSet::new(),
            circle: Vec::new(),
            partitions: Vec::new(),
            loads: BTreeMap::new(),
        }
    }

    /// Creates a ring holding `members`.
    #[must_use]
    pub fn with_members(config: RingConfig, members: impl IntoIterator<Item = WorkerId>) -> Self {
        let mut ring = Self::new(config);
        for member in members {
            ring.insert_virtual_nodes(&member);
            ring.members.insert(member);
        }
        ring.distribute();
        ring
    }

    /// Adds a member. Returns false if it was already present.
    pub fn add(&mut self, member: WorkerId) -> bool {
        if self.members.contains(&member) {
            return false;
        }
        self.insert_virtual_nodes(&member);
        self.members.insert(member);
        self.distribute();
        true
    }

    /// Removes a member. Returns false if it was not present.
    pub fn remove(&mut self, member: &WorkerId) -> bool {
        if !self.members.remove(member) {
            return false;
        }
        self.circle.retain(|(_, owner)| owner != member);
        self.distribute();
        true
    }

    /// Replaces the member set. Returns true if it changed.
    pub fn set_members(&mut self, members: impl IntoIterator<Item = WorkerId>) -> bool {
        let members: BTreeSet<WorkerId> = members.into_iter().collect();
        if members == self.members {
            return false;
        }
        *self = Self::with_members(self.config, members);
        true
    }

    /// Returns true if `member` is on the ring.
    #[must_use]
    pub fn contains(&self, member: &WorkerId) -> bool {
        self.members.contains(member)
    }

    /// Current members in ID order.
    pub fn members(&self) -> impl Iterator<Item = &WorkerId> {
        self.members.iter()
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if the ring has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Partition a key hashes into.
    #[must_use]
    pub fn partition_of(&self, key: &[u8]) -> usize {
        let count = self.config.partition_count as u64;
        // The remainder is below partition_count, which is a usize.
        #[allow(clippy::cast_possible_truncation)]
        let partition = (hash(key) % count) as usize;
        partition
    }

    /// Member owning a partition.
    #[must_use]
    pub fn partition_owner(&self, partition: usize) -> Option<&WorkerId> {
        self.partitions.get(partition)
    }

    /// Member responsible for `key`, or `None` if the ring is empty.
    #[must_use]
    pub fn locate_key(&self, key: &[u8]) -> Option<&WorkerId> {
        self.partition_owner(self.partition_of(key))
    }

    /// Maximum number of partitions one member may own.
    #[must_use]
    pub fn max_load(&self) -> usize {
        if self.members.is_empty() {
            return 0;
        }
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let max = ((self.config.partition_count as f64 / self.members.len() as f64)
            * self.config.load)
            .ceil() as usize;
        // Every partition must have an owner even with a load factor <= 1.
        max.max(self.config.partition_count.div_ceil(self.members.len()))
    }

    /// Number of partitions owned by each member.
    #[must_use]
    pub fn load_distribution(&self) -> BTreeMap<WorkerId, usize> {
        self.loads.clone()
    }

    fn insert_virtual_nodes(&mut self, member: &WorkerId) {
        for replica in 0..self.config.replication_factor {
            let position = hash(format!("{member}{replica}").as_bytes());
            self.circle.push((position, member.clone()));
        }
        self.circle.sort_unstable();
    }

    fn distribute(&mut self) {
        self.partitions.clear();
        self.loads = self.members.iter().map(|m| (m.clone(), 0)).collect();
        if self.members.is_empty() {
            return;
        }
        let max_load = self.max_load();

        for partition in 0..self.config.partition_count {
            let position = hash(&(partition as u64).to_le_bytes());
            let start = self.circle.partition_point(|(p, _)| *p < position);
            let owner = self.circle[start..]
                .iter()
                .chain(&self.circle[..start])
                .map(|(_, member)| member)
                .find(|member| self.loads.get(*member).is_some_and(|load| *load < max_load))
                .cloned();
            // Partition indexes must line up with partition numbers.
            let owner = owner.unwrap_or_else(|| {
                tracing::error!(partition, "no ring member below the load bound");
                self.circle[start % self.circle.len()].1.clone()
            });
            if let Some(load) = self.loads.get_mut(&owner) {
                *load += 1;
            }
            self.partitions.push(owner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(partition_count: usize) -> RingConfig {
        RingConfig {
            partition_count,
            replication_factor: 20,
            load: 1.25,
        }
    }

    fn w(id: &str) -> WorkerId {
        WorkerId::new(id).unwrap()
    }

    #[test]
    fn empty_ring_locates_nothing() {
        let ring = HashRing::new(config(7));
        assert!(ring.is_empty());
        assert_eq!(ring.locate_key(b"42"), None);
        assert_eq!(ring.max_load(), 0);
    }

    #[test]
    fn single_member_owns_everything() {
        let ring = HashRing::with_members(config(7), [w("w1")]);
        for key in ["1", "2", "42", "1000"] {
            assert_eq!(ring.locate_key(key.as_bytes()), Some(&w("w1")));
        }
        assert_eq!(ring.load_distribution().get(&w("w1")), Some(&7));
    }

    #[test]
    fn lookups_are_deterministic() {
        let a = HashRing::with_members(config(271), [w("w1"), w("w2"), w("w3")]);
        let b = HashRing::with_members(config(271), [w("w3"), w("w1"), w("w2")]);
        for i in 0..500 {
            let key = i.to_string();
            assert_eq!(a.locate_key(key.as_bytes()), b.locate_key(key.as_bytes()));
            assert_eq!(a.locate_key(key.as_bytes()), a.locate_key(key.as_bytes()));
        }
    }

    #[test]
    fn loads_stay_bounded() {
        let ring = HashRing::with_members(config(271), [w("w1"), w("w2"), w("w3"), w("w4")]);
        let loads = ring.load_distribution();
        assert_eq!(loads.values().sum::<usize>(), 271);
        // ceil(271 / 4 * 1.25)
        assert_eq!(ring.max_load(), 85);
        assert!(loads.values().all(|load| *load <= 85));
    }

    #[test]
    fn removed_member_owns_nothing() {
        let mut ring = HashRing::with_members(config(7), [w("w1"), w("w2"), w("w3")]);
        assert!(ring.remove(&w("w2")));
        assert!(!ring.remove(&w("w2")));
        assert!(!ring.contains(&w("w2")));
        for partition in 0..7 {
            assert_ne!(ring.partition_owner(partition), Some(&w("w2")));
        }
        assert!(ring.add(w("w2")));
        assert!(!ring.add(w("w2")));
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn set_members_rebuilds_only_on_change() {
        let mut ring = HashRing::new(config(7));
        assert!(ring.set_members([w("w1"), w("w2")]));
        assert!(!ring.set_members([w("w2"), w("w1")]));
        assert_eq!(ring.members().cloned().collect::<Vec<_>>(), vec![w("w1"), w("w2")]);
    }

    #[test]
    fn every_partition_has_an_owner() {
        let members: Vec<WorkerId> = (0..9).map(|i| w(&format!("w{i}"))).collect();
        for (partition_count, load) in [(1, 1.25), (5, 0.5), (7, 1.0), (64, 0.1), (271, 1.25)] {
            let cfg = RingConfig {
                partition_count,
                replication_factor: 3,
                load,
            };
            for size in 1..=members.len() {
                let ring = HashRing::with_members(cfg, members[..size].iter().cloned());
                for partition in 0..partition_count {
                    assert!(
                        ring.partition_owner(partition).is_some(),
                        "partition {partition} of {partition_count} unowned with {size} members"
                    );
                }
                assert_eq!(ring.partition_owner(partition_count), None);
                assert_eq!(ring.load_distribution().values().sum::<usize>(), partition_count);
            }
        }
    }
}
