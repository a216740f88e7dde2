//! Durable vnode state.
//!
//! Each vnode persists one opaque record (its serialized clock, keylog and
//! replication ledger) keyed by its ring position. The engine owns the
//! encoding; this layer only moves bytes.

use crate::backend::{Result, StorageError};
use dkv_causal::NodeId;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Single-record-per-vnode durable state.
pub trait StateStore: Send {
    /// Load a vnode's record, `Ok(None)` when it was never saved.
    fn load(&self, vnode: NodeId) -> Result<Option<Vec<u8>>>;

    /// Replace a vnode's record.
    fn save(&mut self, vnode: NodeId, bytes: &[u8]) -> Result<()>;

    /// Flush to the underlying medium.
    fn sync(&mut self) -> Result<()>;

    /// Release the store. Further operations fail with `Closed`.
    fn close(&mut self) -> Result<()>;
}

/// File-backed state store: one file per vnode under a state directory.
///
/// Saves write a temp file and rename it into place, so a record is either
/// the old tuple or the new one, never a torn mix.
pub struct FileStateStore {
    dir: PathBuf,
    closed: bool,
}

impl FileStateStore {
    /// Open (or create) the state directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(FileStateStore { dir, closed: false })
    }

    fn record_path(&self, vnode: NodeId) -> PathBuf {
        self.dir.join(vnode.to_string())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

impl StateStore for FileStateStore {
    fn load(&self, vnode: NodeId) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        match fs::read(self.record_path(vnode)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&mut self, vnode: NodeId, bytes: &[u8]) -> Result<()> {
        self.check_open()?;
        let tmp = self.dir.join(format!("{}.tmp", vnode));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.record_path(vnode))?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.check_open()
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// In-memory state store for tests and ephemeral clusters.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: HashMap<NodeId, Vec<u8>>,
    closed: bool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, vnode: NodeId) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.records.get(&vnode).cloned())
    }

    fn save(&mut self, vnode: NodeId, bytes: &[u8]) -> Result<()> {
        self.check_open()?;
        self.records.insert(vnode, bytes.to_vec());
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.check_open()
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
