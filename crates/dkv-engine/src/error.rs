//! Error types for the replica engine.

use dkv_causal::NodeId;
use dkv_storage::StorageError;
use thiserror::Error;

/// Errors a vnode command can surface.
///
/// The engine never panics across a command boundary: every handler
/// returns one of these, and callers decide whether to retry, repair or
/// drop. Anti-entropy re-converges anything lost to a transient failure.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error("malformed sync message from {node}: {reason}")]
    Protocol { node: NodeId, reason: String },

    #[error("codec: {0}")]
    Codec(String),

    #[error("vnode terminated")]
    Terminated,
}

impl From<bincode::Error> for EngineError {
    fn from(err: bincode::Error) -> Self {
        EngineError::Codec(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
