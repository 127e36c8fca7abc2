//! Persistent storage: an ordered key-value store with atomic batches, and the
//! block/undo/index records kept on top of it.
//!
//! Key layout (all in one keyspace, separated by prefix):
//!
//! | key                               | value                     |
//! |-----------------------------------|---------------------------|
//! | `blk:` hash                       | wire-encoded block        |
//! | `und:` hash                       | bincode `BlockUndo`       |
//! | `idx:` hash                       | bincode `StoredIndexEntry`|
//! | `utx:`/`uts:` txid vout(be)       | bincode `Coin`            |
//! | `meta:best:` keyspace             | best block hash           |
//! | `meta:best:txindex`               | tx index best (hash, height) |
//! | `meta:chainstate`                 | active coins keyspace     |
//! | `txi:` txid                       | bincode `TxLocation`      |
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::core::block_index::StoredIndexEntry;
use crate::core::coins::BlockUndo;
use crate::core::types::{self, Block, Hash256, OutPoint};

pub mod coins_db;
pub mod memory;
pub mod sled_store;

pub use coins_db::{CoinsKeyspace, CoinsViewDb};
pub use memory::MemoryStore;
pub use sled_store::SledStore;

pub const PREFIX_BLOCK: &[u8] = b"blk:";
pub const PREFIX_UNDO: &[u8] = b"und:";
pub const PREFIX_INDEX: &[u8] = b"idx:";
pub const PREFIX_COINS: &[u8] = b"utx:";
pub const PREFIX_SNAPSHOT_COINS: &[u8] = b"uts:";
pub const PREFIX_TXINDEX: &[u8] = b"txi:";
pub const META_BEST_PREFIX: &[u8] = b"meta:best:";
pub const META_CHAINSTATE: &[u8] = b"meta:chainstate";

#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend failed. Transient failures may succeed on retry.
    #[error("database error: {message}")]
    Backend { message: String, transient: bool },
    /// A stored record is missing or does not decode.
    #[error("corrupted database: {0}")]
    Corruption(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Backend { transient: true, .. })
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

// ─── Key-value store ─────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Ordered list of writes applied all-or-nothing.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Delete { key: key.into() });
    }

    /// Append every op of `other` after the ops already queued.
    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Ordered key-value store with atomic batched writes.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;
    /// Apply every op or none of them.
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StorageError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.as_ref().get(key)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.as_ref().scan_prefix(prefix)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StorageError> {
        self.as_ref().write_batch(batch)
    }
}

/// Store handle shared by the chainstate, block store and indexes.
pub type SharedStore = Arc<dyn KeyValueStore>;

// ─── Block records ───────────────────────────────────────────────────

/// Block bytes, undo records and block index entries, keyed by block hash.
#[derive(Clone)]
pub struct BlockStore {
    store: SharedStore,
}

impl BlockStore {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Queue the wire encoding of `block`.
    pub fn put_block(&self, batch: &mut WriteBatch, hash: &Hash256, block: &Block) -> Result<(), StorageError> {
        let bytes = types::encode_wire(block)?;
        batch.put(prefixed_key(PREFIX_BLOCK, hash), bytes);
        Ok(())
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, StorageError> {
        match self.store.get(&prefixed_key(PREFIX_BLOCK, hash))? {
            Some(bytes) => types::decode_wire(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Corruption(format!("block {}: {e}", hex::encode(hash)))),
            None => Ok(None),
        }
    }

    pub fn put_undo(&self, batch: &mut WriteBatch, hash: &Hash256, undo: &BlockUndo) -> Result<(), StorageError> {
        batch.put(prefixed_key(PREFIX_UNDO, hash), encode(undo)?);
        Ok(())
    }

    pub fn get_undo(&self, hash: &Hash256) -> Result<Option<BlockUndo>, StorageError> {
        self.get_decoded(&prefixed_key(PREFIX_UNDO, hash))
    }

    pub fn put_index_entry(&self, batch: &mut WriteBatch, entry: &StoredIndexEntry) -> Result<(), StorageError> {
        batch.put(prefixed_key(PREFIX_INDEX, &entry.hash), encode(entry)?);
        Ok(())
    }

    pub fn load_index_entries(&self) -> Result<Vec<StoredIndexEntry>, StorageError> {
        self.store
            .scan_prefix(PREFIX_INDEX)?
            .into_iter()
            .map(|(_, value)| decode(&value))
            .collect()
    }

    pub fn active_keyspace(&self) -> Result<CoinsKeyspace, StorageError> {
        Ok(self
            .get_decoded(META_CHAINSTATE)?
            .unwrap_or(CoinsKeyspace::Primary))
    }

    pub fn set_active_keyspace(&self, batch: &mut WriteBatch, keyspace: CoinsKeyspace) -> Result<(), StorageError> {
        batch.put(META_CHAINSTATE.to_vec(), encode(&keyspace)?);
        Ok(())
    }

    pub fn write(&self, batch: &WriteBatch) -> Result<(), StorageError> {
        self.store.write_batch(batch)
    }

    fn get_decoded<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, StorageError> {
        match self.store.get(key)? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────

pub fn prefixed_key(prefix: &[u8], data: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + data.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(data);
    key
}

/// `<prefix><txid(32)><vout(4, big endian)>` so keys sort by outpoint.
pub fn coin_key(prefix: &[u8], outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 36);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&outpoint.txid);
    key.extend_from_slice(&outpoint.vout.to_be_bytes());
    key
}

pub fn outpoint_from_coin_key(prefix: &[u8], key: &[u8]) -> Result<OutPoint, StorageError> {
    let data = key
        .strip_prefix(prefix)
        .filter(|d| d.len() == 36)
        .ok_or_else(|| StorageError::Corruption(format!("invalid coin key {}", hex::encode(key))))?;
    let mut txid = [0u8; 32];
    txid.copy_from_slice(&data[..32]);
    let mut vout = [0u8; 4];
    vout.copy_from_slice(&data[32..]);
    Ok(OutPoint::new(txid, u32::from_be_bytes(vout)))
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(StorageError::from)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::Corruption(e.to_string()))
}

pub(crate) fn decode_hash(bytes: &[u8]) -> Result<Hash256, StorageError> {
    <Hash256>::try_from(bytes)
        .map_err(|_| StorageError::Corruption(format!("expected 32-byte hash, found {} bytes", bytes.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coin_key_round_trip() {
        let op = OutPoint::new([5u8; 32], 258);
        let key = coin_key(PREFIX_COINS, &op);
        assert_eq!(key.len(), PREFIX_COINS.len() + 36);
        assert_eq!(outpoint_from_coin_key(PREFIX_COINS, &key).unwrap(), op);
        assert!(outpoint_from_coin_key(PREFIX_SNAPSHOT_COINS, &key).is_err());
    }

    #[test]
    fn test_coin_keys_sort_like_outpoints() {
        let a = OutPoint::new([1u8; 32], 255);
        let b = OutPoint::new([1u8; 32], 256);
        let c = OutPoint::new([2u8; 32], 0);
        assert!(a < b && b < c);
        assert!(coin_key(PREFIX_COINS, &a) < coin_key(PREFIX_COINS, &b));
        assert!(coin_key(PREFIX_COINS, &b) < coin_key(PREFIX_COINS, &c));
    }

    #[test]
    fn test_block_store_round_trip() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let blocks = BlockStore::new(store);
        let genesis = crate::core::params::ChainParams::regtest().genesis;
        let hash = genesis.hash();

        let mut batch = WriteBatch::new();
        blocks.put_block(&mut batch, &hash, &genesis).unwrap();
        blocks.write(&batch).unwrap();

        assert_eq!(blocks.get_block(&hash).unwrap(), Some(genesis));
        assert_eq!(blocks.get_block(&[9u8; 32]).unwrap(), None);
        assert_eq!(blocks.active_keyspace().unwrap(), CoinsKeyspace::Primary);
    }

    #[test]
    fn test_transient_classification() {
        let e = StorageError::Backend { message: "busy".into(), transient: true };
        assert!(e.is_transient());
        assert!(!StorageError::Corruption("x".into()).is_transient());
    }
}
