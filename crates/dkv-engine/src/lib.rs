pub mod actor;
pub mod config;
pub mod error;
pub mod keylog;
pub mod ring;
pub mod stats;
pub mod sync;
pub mod vnode;

pub use actor::{spawn_vnode, VnodeHandle};
pub use config::{Backend, EngineConfig};
pub use error::EngineError;
pub use ring::Ring;
pub use stats::{CountingStats, NoopStats, StatEvent, StatsSink};
pub use sync::{AntiEntropyDriver, SyncOutcome};
pub use vnode::{ReadReply, ReplicaRef, SyncPullReply, Vnode, WriteOp};
