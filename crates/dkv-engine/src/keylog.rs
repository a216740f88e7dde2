//! Keylog: which key each coordinated dot wrote.
//!
//! A vnode appends the written key for every dot it generates; the key at
//! index `i` belongs to dot `base + i + 1`. Once every peer has
//! acknowledged a prefix of dots, that prefix is truncated and the keys
//! in it get a final context strip.

use dkv_causal::{Counter, Key};
use serde::{Deserialize, Serialize};

/// Per-vnode log of coordinated keys, indexed by dot counter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keylog {
    base: Counter,
    keys: Vec<Key>,
}

impl Keylog {
    /// An empty log starting at dot 1.
    pub fn new() -> Self {
        Keylog {
            base: 0,
            keys: Vec::new(),
        }
    }

    /// Counters at or below this have been truncated away.
    pub fn base(&self) -> Counter {
        self.base
    }

    /// Number of keys still held.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when no key is held.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The highest dot counter with a slot in this log.
    pub fn head(&self) -> Counter {
        self.base + self.keys.len() as Counter
    }

    /// Append the key written by the next coordinated dot.
    pub fn push(&mut self, key: Key) {
        self.keys.push(key);
    }

    /// The key written at a dot counter, `None` outside `base..=head`.
    pub fn key_for(&self, counter: Counter) -> Option<&Key> {
        if counter <= self.base || counter > self.head() {
            return None;
        }
        self.keys.get((counter - self.base - 1) as usize)
    }

    /// Drop every slot up to and including counter `upto`, returning the
    /// removed keys. A no-op when `upto` is at or below the base.
    pub fn truncate_upto(&mut self, upto: Counter) -> Vec<Key> {
        if upto <= self.base {
            return Vec::new();
        }
        let drop = ((upto - self.base) as usize).min(self.keys.len());
        let removed: Vec<Key> = self.keys.drain(..drop).collect();
        self.base += removed.len() as Counter;
        removed
    }

    /// Iterate over `(counter, key)` pairs still held.
    pub fn iter(&self) -> impl Iterator<Item = (Counter, &Key)> {
        self.keys
            .iter()
            .enumerate()
            .map(move |(i, key)| (self.base + i as Counter + 1, key))
    }
}
