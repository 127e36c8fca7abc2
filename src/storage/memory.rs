//! In-memory store for tests and throwaway chainstates.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;

use super::{KeyValueStore, StorageError, WriteBatch, WriteOp};

#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    fail_writes: AtomicBool,
    batches_written: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every batch fails with a transient backend error and
    /// nothing is applied.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn batches_written(&self) -> usize {
        self.batches_written.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.map.read().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let map = self.map.read();
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend {
                message: "injected write failure".into(),
                transient: true,
            });
        }
        let mut map = self.map.write();
        for op in batch.iter() {
            match op {
                WriteOp::Put { key, value } => {
                    map.insert(key.clone(), value.clone());
                }
                WriteOp::Delete { key } => {
                    map.remove(key);
                }
            }
        }
        self.batches_written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_and_scan() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(b"a:1".to_vec(), b"x".to_vec());
        batch.put(b"a:2".to_vec(), b"y".to_vec());
        batch.put(b"b:1".to_vec(), b"z".to_vec());
        batch.delete(b"a:2".to_vec());
        store.write_batch(&batch).unwrap();

        let scanned = store.scan_prefix(b"a:").unwrap();
        assert_eq!(scanned, vec![(b"a:1".to_vec(), b"x".to_vec())]);
        assert_eq!(store.get(b"b:1").unwrap(), Some(b"z".to_vec()));
    }

    #[test]
    fn test_injected_failure_applies_nothing() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let mut batch = WriteBatch::new();
        batch.put(b"k".to_vec(), b"v".to_vec());
        let err = store.write_batch(&batch).unwrap_err();
        assert!(err.is_transient());
        assert!(store.is_empty());

        store.set_fail_writes(false);
        store.write_batch(&batch).unwrap();
        assert_eq!(store.len(), 1);
    }
}
