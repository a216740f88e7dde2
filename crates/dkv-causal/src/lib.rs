pub mod bvv;
pub mod dcc;
pub mod vv;

/// Position of a vnode on the consistent-hash ring.
pub type NodeId = u64;

/// Per-node event counter. Counters start at 1; 0 means "nothing seen".
pub type Counter = u64;

/// Opaque key bytes.
pub type Key = Vec<u8>;

/// Opaque value bytes.
pub type Value = Vec<u8>;
