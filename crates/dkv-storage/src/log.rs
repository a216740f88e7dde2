//! Log-structured object storage.
//!
//! Writes append length-framed records to a single log file; an in-memory
//! index over the live containers is rebuilt by replaying the log on open.
//! Deletes append tombstones. A torn record at the tail (crash mid-append)
//! ends replay; everything before it is intact.

use crate::backend::{ObjectStore, Result, StorageError};
use dkv_causal::dcc::Dcc;
use dkv_causal::Key;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize)]
enum Record {
    Put { key: Key, dcc: Dcc },
    Delete { key: Key },
}

/// A disk-backed object store with an append-only log.
pub struct LogStore {
    path: PathBuf,
    file: File,
    objects: BTreeMap<Key, Dcc>,
    closed: bool,
}

impl LogStore {
    /// Open (or create) the log at `path` and replay it into the index.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let objects = Self::replay(&file)?;

        Ok(LogStore {
            path,
            file,
            objects,
            closed: false,
        })
    }

    /// The log file this store appends to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn replay(file: &File) -> Result<BTreeMap<Key, Dcc>> {
        let mut objects = BTreeMap::new();
        let mut reader = BufReader::new(file.try_clone()?);

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                // clean end of log, or a torn length prefix
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_le_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                // torn record at the tail: keep what replayed so far
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            match bincode::deserialize::<Record>(&payload)? {
                Record::Put { key, dcc } => {
                    objects.insert(key, dcc);
                }
                Record::Delete { key } => {
                    objects.remove(&key);
                }
            }
        }

        Ok(objects)
    }

    fn append(&mut self, record: &Record) -> Result<()> {
        let payload = bincode::serialize(record)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| StorageError::Codec("record too large".into()))?;
        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(&payload)?;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

impl ObjectStore for LogStore {
    fn get(&self, key: &[u8]) -> Result<Option<Dcc>> {
        self.check_open()?;
        Ok(self.objects.get(key).cloned())
    }

    fn put(&mut self, key: Key, dcc: Dcc) -> Result<()> {
        self.check_open()?;
        self.append(&Record::Put {
            key: key.clone(),
            dcc: dcc.clone(),
        })?;
        self.objects.insert(key, dcc);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.check_open()?;
        if self.objects.remove(key).is_some() {
            self.append(&Record::Delete { key: key.to_vec() })?;
        }
        Ok(())
    }

    fn fold(&self, visit: &mut dyn FnMut(&[u8], &Dcc)) -> Result<()> {
        self.check_open()?;
        for (key, dcc) in &self.objects {
            visit(key, dcc);
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.objects.len()
    }

    fn sync(&mut self) -> Result<()> {
        self.check_open()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.file.sync_data()?;
            self.closed = true;
        }
        Ok(())
    }
}
