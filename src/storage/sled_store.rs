use sled::Db;
use std::path::Path;

use super::{KeyValueStore, StorageError, WriteBatch, WriteOp};

/// Persistent storage backend using sled embedded database
pub struct SledStore {
    db: Db,
}

impl SledStore {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(backend_error)?;
        Ok(Self { db })
    }

    /// Database that is removed when dropped.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(backend_error)?;
        Ok(Self { db })
    }

    pub fn size_on_disk(&self) -> Result<u64, StorageError> {
        self.db.size_on_disk().map_err(backend_error)
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key).map_err(backend_error)?.map(|v| v.to_vec()))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.db
            .scan_prefix(prefix)
            .map(|entry| {
                entry
                    .map(|(k, v)| (k.to_vec(), v.to_vec()))
                    .map_err(backend_error)
            })
            .collect()
    }

    /// Applies the batch atomically, then flushes so the batch survives a crash.
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StorageError> {
        let mut sled_batch = sled::Batch::default();
        for op in batch.iter() {
            match op {
                WriteOp::Put { key, value } => sled_batch.insert(key.as_slice(), value.as_slice()),
                WriteOp::Delete { key } => sled_batch.remove(key.as_slice()),
            }
        }
        self.db.apply_batch(sled_batch).map_err(backend_error)?;
        self.db.flush().map_err(backend_error)?;
        Ok(())
    }
}

fn backend_error(e: sled::Error) -> StorageError {
    match e {
        sled::Error::Corruption { .. } => StorageError::Corruption(e.to_string()),
        sled::Error::Io(ref io) => StorageError::Backend {
            transient: matches!(
                io.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            message: e.to_string(),
        },
        other => StorageError::Backend {
            message: other.to_string(),
            transient: false,
        },
    }
}
