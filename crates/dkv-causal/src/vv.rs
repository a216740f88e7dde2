//! Version vector: a plain node-id to counter map.
//!
//! A version vector summarizes a set of events by tracking the highest
//! counter seen from each node. It is the causal-context half of a dotted
//! causal container and the acknowledgment ledger the engine keeps per peer.

use crate::{Counter, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A version vector tracking the highest counter seen per node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    entries: BTreeMap<NodeId, Counter>,
}

impl VersionVector {
    /// Create an empty version vector.
    pub fn new() -> Self {
        VersionVector {
            entries: BTreeMap::new(),
        }
    }

    /// Create a version vector from `(node, counter)` pairs.
    pub fn from_entries(entries: impl IntoIterator<Item = (NodeId, Counter)>) -> Self {
        VersionVector {
            entries: entries.into_iter().collect(),
        }
    }

    /// Get the counter for a node, 0 when the node is absent.
    pub fn get(&self, node: NodeId) -> Counter {
        self.entries.get(&node).copied().unwrap_or(0)
    }

    /// Record an event: `self[node] := max(self[node], counter)`.
    ///
    /// The entry is materialized even for counter 0, so that `min` ranges
    /// over every node the caller has registered.
    pub fn add(&mut self, node: NodeId, counter: Counter) {
        let entry = self.entries.entry(node).or_insert(0);
        *entry = (*entry).max(counter);
    }

    /// Merge with another vector (pointwise max).
    pub fn merge(&mut self, other: &VersionVector) {
        for (&node, &counter) in &other.entries {
            self.add(node, counter);
        }
    }

    /// The minimum counter across all present entries, `None` when empty.
    pub fn min(&self) -> Option<Counter> {
        self.entries.values().min().copied()
    }

    /// True if for every node, `self[node] >= other[node]`.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other
            .entries
            .iter()
            .all(|(&node, &counter)| self.get(node) >= counter)
    }

    /// Check whether the event `(node, counter)` is covered by this vector.
    pub fn contains(&self, node: NodeId, counter: Counter) -> bool {
        self.get(node) >= counter
    }

    /// Iterate over all entries in node order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, Counter)> + '_ {
        self.entries.iter().map(|(&node, &counter)| (node, counter))
    }

    /// The nodes with an entry.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.keys().copied()
    }

    /// Number of tracked nodes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no node is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keep only entries for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(NodeId, Counter) -> bool) {
        self.entries.retain(|&node, &mut counter| keep(node, counter));
    }
}

impl FromIterator<(NodeId, Counter)> for VersionVector {
    fn from_iter<I: IntoIterator<Item = (NodeId, Counter)>>(iter: I) -> Self {
        VersionVector::from_entries(iter)
    }
}
