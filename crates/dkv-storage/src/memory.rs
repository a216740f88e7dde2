//! In-memory object storage, the default backend.

use crate::backend::{ObjectStore, Result, StorageError};
use dkv_causal::dcc::Dcc;
use dkv_causal::Key;
use std::collections::BTreeMap;

/// An ordered in-memory key to container map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: BTreeMap<Key, Dcc>,
    closed: bool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        MemoryStore {
            objects: BTreeMap::new(),
            closed: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

impl ObjectStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Dcc>> {
        self.check_open()?;
        Ok(self.objects.get(key).cloned())
    }

    fn put(&mut self, key: Key, dcc: Dcc) -> Result<()> {
        self.check_open()?;
        self.objects.insert(key, dcc);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.check_open()?;
        self.objects.remove(key);
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
        self.check_open()
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dkv_causal::dcc::Dot;

    fn container(node: u64, counter: u64, value: &[u8]) -> Dcc {
        let mut dcc = Dcc::new();
        dcc.add(Dot::new(node, counter), value.to_vec());
        dcc
    }

    #[test]
    fn test_memory_store_round_trip() {
        let mut store = MemoryStore::new();
        assert!(store.is_empty());
        assert!(store.get(b"k").unwrap().is_none());

        store.put(b"k".to_vec(), container(1, 1, b"v")).unwrap();
        let got = store.get(b"k").unwrap().unwrap();
        assert_eq!(got.values(), vec![&b"v".to_vec()]);

        store.delete(b"k").unwrap();
        assert!(store.get(b"k").unwrap().is_none());
    }

    #[test]
    fn test_memory_store_fold_is_ordered() {
        let mut store = MemoryStore::new();
        store.put(b"b".to_vec(), container(1, 2, b"2")).unwrap();
        store.put(b"a".to_vec(), container(1, 1, b"1")).unwrap();

        let mut seen = Vec::new();
        store
            .fold(&mut |key, _| seen.push(key.to_vec()))
            .unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_memory_store_closed() {
        let mut store = MemoryStore::new();
        store.close().unwrap();
        assert!(matches!(store.get(b"k"), Err(StorageError::Closed)));
    }
}
