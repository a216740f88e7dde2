//! Dotted causal container: the per-key unit of causality.
//!
//! A container pairs the currently live, concurrent values (each tagged
//! with the dot of the write that produced it) with a causal context
//! summarizing every event the container knows about, surviving or not.
//! Containers merge with `sync`, a join: commutative, associative and
//! idempotent, so replicas can apply them in any order and still converge.

use crate::vv::VersionVector;
use crate::{Counter, NodeId, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A unique identifier for a single write event.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Dot {
    pub node: NodeId,
    pub counter: Counter,
}

impl Dot {
    pub fn new(node: NodeId, counter: Counter) -> Self {
        Dot { node, counter }
    }
}

/// A dotted causal container.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dcc {
    /// Live concurrent values, one per surviving write event.
    #[serde(with = "version_pairs")]
    versions: BTreeMap<Dot, Value>,
    /// Causal context: every event this container has seen.
    ctx: VersionVector,
}

// Serialize the version map as a list of pairs; struct-typed map keys do
// not survive self-describing formats.
mod version_pairs {
    use super::{Dot, Value};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<Dot, Value>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let pairs: Vec<(&Dot, &Value)> = map.iter().collect();
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<Dot, Value>, D::Error> {
        let pairs: Vec<(Dot, Value)> = Vec::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

impl Dcc {
    /// Create an empty container.
    pub fn new() -> Self {
        Dcc {
            versions: BTreeMap::new(),
            ctx: VersionVector::new(),
        }
    }

    /// The causal context.
    pub fn context(&self) -> &VersionVector {
        &self.ctx
    }

    /// The live values, without their dots.
    pub fn values(&self) -> Vec<&Value> {
        self.versions.values().collect()
    }

    /// The live values with their dots, in dot order.
    pub fn versions(&self) -> impl Iterator<Item = (Dot, &Value)> {
        self.versions.iter().map(|(&dot, value)| (dot, value))
    }

    /// Number of live concurrent values.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// True when the container carries no values and no context.
    ///
    /// A stored container strips down to empty exactly when the node clock
    /// already covers everything it knew, which is the signal to delete
    /// the key from storage.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty() && self.ctx.is_empty()
    }

    /// Record a new write event: insert the dotted value and absorb the
    /// dot into the context.
    pub fn add(&mut self, dot: Dot, value: Value) {
        self.ctx.add(dot.node, dot.counter);
        self.versions.insert(dot, value);
    }

    /// Merge two containers.
    ///
    /// A version survives if both sides hold it, or if one side holds it
    /// and the other side's context does not dominate its dot. The merged
    /// context is the pointwise maximum.
    pub fn sync(&self, other: &Dcc) -> Dcc {
        let mut versions = BTreeMap::new();

        for (dot, value) in &self.versions {
            if other.versions.contains_key(dot) || dot.counter > other.ctx.get(dot.node) {
                versions.insert(*dot, value.clone());
            }
        }
        for (dot, value) in &other.versions {
            if dot.counter > self.ctx.get(dot.node) {
                versions.entry(*dot).or_insert_with(|| value.clone());
            }
        }

        let mut ctx = self.ctx.clone();
        ctx.merge(&other.ctx);

        Dcc { versions, ctx }
    }

    /// Drop every version the client has already observed and absorb the
    /// client's context.
    ///
    /// Applied at write time: it makes a delete meaningful (the observed
    /// siblings disappear) and a put supersede exactly what was read.
    pub fn discard(&mut self, observed: &VersionVector) {
        self.versions
            .retain(|dot, _| dot.counter > observed.get(dot.node));
        self.ctx.merge(observed);
    }

    /// Remove context entries a clock's contiguous frontier already
    /// covers. `frontier` is a node clock's base projection.
    ///
    /// Versions are untouched. The stripped container is what goes to
    /// storage; the dropped entries are recoverable from the clock.
    pub fn strip(&self, frontier: &VersionVector) -> Dcc {
        let mut stripped = self.clone();
        stripped
            .ctx
            .retain(|node, counter| counter > frontier.get(node));
        stripped
    }

    /// Saturate the context with a clock's contiguous frontier.
    ///
    /// Dual of `strip`, applied when a container leaves storage so that
    /// downstream merges see the full causal view.
    pub fn fill(&mut self, frontier: &VersionVector) {
        self.ctx.merge(frontier);
    }
}
