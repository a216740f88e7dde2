//! Static consistent-hash ring geometry.
//!
//! The engine does not manage membership; it only needs to answer two
//! questions about a fixed ring: which vnodes replicate a key, and which
//! vnodes share any replica set with a given vnode (its anti-entropy
//! peers).

use dkv_causal::NodeId;
use sha2::{Digest, Sha256};

/// A fixed ring of vnode positions with a replication factor.
#[derive(Clone, Debug)]
pub struct Ring {
    positions: Vec<NodeId>,
    replication_factor: usize,
}

impl Ring {
    /// Build a ring from vnode positions. Positions are sorted and
    /// deduplicated; the replication factor is clamped to the ring size.
    pub fn new(positions: impl IntoIterator<Item = NodeId>, replication_factor: usize) -> Self {
        let mut positions: Vec<NodeId> = positions.into_iter().collect();
        positions.sort_unstable();
        positions.dedup();
        let replication_factor = replication_factor.clamp(1, positions.len().max(1));
        Ring {
            positions,
            replication_factor,
        }
    }

    /// Number of vnodes on the ring.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// All vnode positions in ring order.
    pub fn positions(&self) -> &[NodeId] {
        &self.positions
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.positions.binary_search(&id).is_ok()
    }

    /// The vnodes that replicate `key`: the key's successor vnode and the
    /// `replication_factor - 1` vnodes clockwise after it.
    pub fn replica_set(&self, key: &[u8]) -> Vec<NodeId> {
        if self.positions.is_empty() {
            return Vec::new();
        }
        let start = match self.positions.binary_search(&hash_key(key)) {
            Ok(i) => i,
            Err(i) => i % self.positions.len(),
        };
        (0..self.replication_factor)
            .map(|offset| self.positions[(start + offset) % self.positions.len()])
            .collect()
    }

    /// The coordinator for `key`: the first vnode of its replica set.
    pub fn coordinator(&self, key: &[u8]) -> Option<NodeId> {
        self.replica_set(key).first().copied()
    }

    /// The vnodes sharing any replica set with `id`: its
    /// `replication_factor - 1` predecessors and successors on the ring.
    ///
    /// For a replication factor of 3 this is exactly 4 peers.
    pub fn peers(&self, id: NodeId) -> Vec<NodeId> {
        let Ok(idx) = self.positions.binary_search(&id) else {
            return Vec::new();
        };
        let n = self.positions.len();
        let span = self.replication_factor - 1;

        let mut peers: Vec<NodeId> = Vec::new();
        for step in 1..=span {
            peers.push(self.positions[(idx + step) % n]);
            peers.push(self.positions[(idx + n - step) % n]);
        }
        peers.retain(|&p| p != id);
        peers.sort_unstable();
        peers.dedup();
        peers
    }
}

fn hash_key(key: &[u8]) -> NodeId {
    let digest = Sha256::digest(key);
    NodeId::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}
