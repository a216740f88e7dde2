//! Object storage trait and error kinds.
//!
//! The engine treats its backend as an opaque ordered map from key bytes
//! to dotted causal containers. An absent key is not an error; callers
//! turn `Ok(None)` into whatever empty shape they need.

use dkv_causal::dcc::Dcc;
use dkv_causal::Key;
use thiserror::Error;

/// Errors a storage backend can surface.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("store is closed")]
    Closed,
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Codec(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Pluggable per-vnode object storage.
///
/// Implementations must keep keys ordered so that `fold` iterates
/// deterministically; everything else is up to the backend.
pub trait ObjectStore: Send {
    /// Fetch a key's container. Absent keys are `Ok(None)`.
    fn get(&self, key: &[u8]) -> Result<Option<Dcc>>;

    /// Store a key's container, replacing any previous one.
    fn put(&mut self, key: Key, dcc: Dcc) -> Result<()>;

    /// Remove a key. Removing an absent key is a no-op.
    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// Visit every `(key, container)` pair in key order.
    fn fold(&self, visit: &mut dyn FnMut(&[u8], &Dcc)) -> Result<()>;

    /// Number of stored keys.
    fn len(&self) -> usize;

    /// True when no key is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush buffered writes to the underlying medium.
    fn sync(&mut self) -> Result<()>;

    /// Release the backend. Further operations fail with `Closed`.
    fn close(&mut self) -> Result<()>;
}
