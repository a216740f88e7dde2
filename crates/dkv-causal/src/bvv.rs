//! Node clock: a per-node logical clock with gap tracking.
//!
//! Each entry keeps a contiguous `base` (all counters `1..=base` observed)
//! plus the set of counters observed out of order. Whenever `base + 1`
//! lands in the out-of-order set the entry normalizes by sliding the base
//! forward, so the gap set stays small in steady state.

use crate::dcc::Dcc;
use crate::vv::VersionVector;
use crate::{Counter, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One node's entry in a node clock.
///
/// Represents the counter set `{1..=base} ∪ dots`, with every member of
/// `dots` strictly greater than `base + 1` after normalization.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockEntry {
    base: Counter,
    dots: BTreeSet<Counter>,
}

impl ClockEntry {
    /// An empty entry: nothing observed.
    pub fn new() -> Self {
        ClockEntry {
            base: 0,
            dots: BTreeSet::new(),
        }
    }

    /// An entry covering exactly `1..=base`, with no gaps.
    pub fn from_base(base: Counter) -> Self {
        ClockEntry {
            base,
            dots: BTreeSet::new(),
        }
    }

    /// The largest counter below which everything has been observed.
    pub fn base(&self) -> Counter {
        self.base
    }

    /// Check whether a counter has been observed.
    pub fn contains(&self, counter: Counter) -> bool {
        counter <= self.base || self.dots.contains(&counter)
    }

    /// True when the entry has no out-of-order counters.
    pub fn is_contiguous(&self) -> bool {
        self.dots.is_empty()
    }

    /// Observe a counter, normalizing afterwards.
    pub fn add(&mut self, counter: Counter) {
        if counter > self.base {
            self.dots.insert(counter);
            self.normalize();
        }
    }

    /// Advance contiguously and return the newly claimed counter.
    pub fn advance(&mut self) -> Counter {
        let next = self.base + 1;
        self.base = next;
        self.normalize();
        next
    }

    /// Enumerate every observed counter in ascending order.
    pub fn values(&self) -> impl Iterator<Item = Counter> + '_ {
        (1..=self.base).chain(self.dots.iter().copied())
    }

    fn normalize(&mut self) {
        while self.dots.remove(&(self.base + 1)) {
            self.base += 1;
        }
    }
}

/// A mapping of node id to clock entry: the vnode's logical clock.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeClock {
    entries: BTreeMap<NodeId, ClockEntry>,
}

impl NodeClock {
    /// Create an empty clock.
    pub fn new() -> Self {
        NodeClock {
            entries: BTreeMap::new(),
        }
    }

    /// Get a copy of a node's entry, empty when the node is unknown.
    ///
    /// Copies are what go on the wire during anti-entropy, so an owned
    /// entry is the useful shape here.
    pub fn entry(&self, node: NodeId) -> ClockEntry {
        self.entries.get(&node).cloned().unwrap_or_default()
    }

    /// The contiguous base of a node's entry.
    pub fn base_of(&self, node: NodeId) -> Counter {
        self.entries.get(&node).map(|e| e.base()).unwrap_or(0)
    }

    /// Check whether the event `(node, counter)` has been observed.
    pub fn contains(&self, node: NodeId, counter: Counter) -> bool {
        self.entries
            .get(&node)
            .map(|e| e.contains(counter))
            .unwrap_or(false)
    }

    /// Claim the next counter for `node`, advancing its entry contiguously.
    pub fn event(&mut self, node: NodeId) -> Counter {
        self.entries.entry(node).or_default().advance()
    }

    /// Observe a single event.
    pub fn add(&mut self, node: NodeId, counter: Counter) {
        self.entries.entry(node).or_default().add(counter);
    }

    /// Absorb every event a container knows about, live or not.
    pub fn add_dcc(&mut self, dcc: &Dcc) {
        for (node, counter) in dcc.context().iter() {
            self.add(node, counter);
        }
        for (dot, _) in dcc.versions() {
            self.add(dot.node, dot.counter);
        }
    }

    /// Replace a node's entry wholesale.
    ///
    /// Only valid with an entry the node itself reported: the node is the
    /// sole generator of its dots, so its own view is authoritative.
    pub fn store_entry(&mut self, node: NodeId, entry: ClockEntry) {
        self.entries.insert(node, entry);
    }

    /// Project every entry to its contiguous base.
    ///
    /// Nodes with base 0 are omitted; a zero base carries no information.
    pub fn base(&self) -> VersionVector {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.base() > 0)
            .map(|(&node, entry)| (node, entry.base()))
            .collect()
    }

    /// Iterate over all entries in node order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &ClockEntry)> {
        self.entries.iter().map(|(&node, entry)| (node, entry))
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_entry_add_and_normalize() {
        let mut entry = ClockEntry::new();

        entry.add(2);
        entry.add(3);
        assert_eq!(entry.base(), 0);
        assert!(!entry.is_contiguous());

        // 1 arrives, the base slides over the buffered 2 and 3
        entry.add(1);
        assert_eq!(entry.base(), 3);
        assert!(entry.is_contiguous());
    }

    #[test]
    fn test_entry_contains() {
        let mut entry = ClockEntry::from_base(3);
        entry.add(5);

        assert!(entry.contains(1));
        assert!(entry.contains(3));
        assert!(!entry.contains(4));
        assert!(entry.contains(5));
        assert!(!entry.contains(6));
    }

    #[test]
    fn test_entry_values() {
        let mut entry = ClockEntry::from_base(2);
        entry.add(5);
        entry.add(7);

        let values: Vec<_> = entry.values().collect();
        assert_eq!(values, vec![1, 2, 5, 7]);
    }

    #[test]
    fn test_entry_advance_is_contiguous() {
        let mut entry = ClockEntry::new();

        assert_eq!(entry.advance(), 1);
        assert_eq!(entry.advance(), 2);
        assert_eq!(entry.base(), 2);

        // advancing over a buffered counter collapses it into the base
        entry.add(4);
        assert_eq!(entry.advance(), 3);
        assert_eq!(entry.base(), 4);
    }

    #[test]
    fn test_entry_large_gap() {
        let mut entry = ClockEntry::new();

        // a remote context can reference a counter far beyond anything
        // seen locally; the gap must survive intact
        entry.add(10_000);
        assert_eq!(entry.base(), 0);
        assert!(entry.contains(10_000));
        assert!(!entry.contains(9_999));
    }

    #[test]
    fn test_clock_event() {
        let mut clock = NodeClock::new();

        assert_eq!(clock.event(1), 1);
        assert_eq!(clock.event(1), 2);
        assert_eq!(clock.event(2), 1);
        assert_eq!(clock.base_of(1), 2);
        assert_eq!(clock.base_of(2), 1);
    }

    #[test]
    fn test_clock_base_projection() {
        let mut clock = NodeClock::new();
        clock.event(1);
        clock.event(1);
        clock.add(2, 3); // out of order, base stays 0

        let base = clock.base();
        assert_eq!(base.get(1), 2);
        assert_eq!(base.get(2), 0);
        // zero bases are not materialized
        assert_eq!(base.len(), 1);
    }

    #[test]
    fn test_clock_store_entry_replaces() {
        let mut clock = NodeClock::new();
        clock.add(2, 5); // out-of-order knowledge about node 2

        // node 2 reports its own contiguous view
        clock.store_entry(2, ClockEntry::from_base(3));
        assert_eq!(clock.base_of(2), 3);
        assert!(!clock.contains(2, 5));
    }

    proptest! {
        #[test]
        fn entry_represents_exactly_the_added_counters(
            counters in prop::collection::btree_set(1u64..200, 0..40)
        ) {
            let mut entry = ClockEntry::new();
            for &c in &counters {
                entry.add(c);
            }

            let values: BTreeSet<Counter> = entry.values().collect();
            prop_assert_eq!(&values, &counters);

            // normalization invariant: base+1 is never buffered
            prop_assert!(!entry.contains(entry.base() + 1));
            prop_assert!(entry.values().all(|c| entry.contains(c)));
        }

        #[test]
        fn entry_add_order_is_irrelevant(
            counters in prop::collection::vec(1u64..100, 0..30)
        ) {
            let mut forward = ClockEntry::new();
            for &c in &counters {
                forward.add(c);
            }

            let mut backward = ClockEntry::new();
            for &c in counters.iter().rev() {
                backward.add(c);
            }

            prop_assert_eq!(forward, backward);
        }
    }
}
