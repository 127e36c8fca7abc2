//! The persistent bottom layer of the UTXO set.
use serde::{Deserialize, Serialize};

use super::{
    coin_key, decode, decode_hash, encode, outpoint_from_coin_key, prefixed_key, SharedStore, StorageError,
    WriteBatch, META_BEST_PREFIX, PREFIX_COINS, PREFIX_SNAPSHOT_COINS,
};
use crate::core::coins::{Coin, CoinsError, CoinsMap, CoinsView};
use crate::core::types::{Hash256, OutPoint, NULL_HASH};

/// Which set of coin keys a chainstate reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoinsKeyspace {
    /// Coins built by connecting every block from genesis
    Primary,
    /// Coins loaded from a UTXO snapshot
    Snapshot,
}

impl CoinsKeyspace {
    pub fn coin_prefix(self) -> &'static [u8] {
        match self {
            CoinsKeyspace::Primary => PREFIX_COINS,
            CoinsKeyspace::Snapshot => PREFIX_SNAPSHOT_COINS,
        }
    }

    pub fn best_block_key(self) -> Vec<u8> {
        prefixed_key(META_BEST_PREFIX, self.name().as_bytes())
    }

    pub fn name(self) -> &'static str {
        match self {
            CoinsKeyspace::Primary => "primary",
            CoinsKeyspace::Snapshot => "snapshot",
        }
    }
}

pub struct CoinsViewDb {
    store: SharedStore,
    keyspace: CoinsKeyspace,
    /// Extra ops written atomically with the next coin flush
    staged: WriteBatch,
}

impl CoinsViewDb {
    pub fn new(store: SharedStore, keyspace: CoinsKeyspace) -> Self {
        Self {
            store,
            keyspace,
            staged: WriteBatch::new(),
        }
    }

    pub fn keyspace(&self) -> CoinsKeyspace {
        self.keyspace
    }

    /// Ride `batch` along with the next [`CoinsView::batch_write`]. Replaces
    /// anything staged earlier; staged ops are kept until a write succeeds.
    pub fn stage(&mut self, batch: WriteBatch) {
        self.staged = batch;
    }

    /// Every coin in this keyspace, in outpoint order.
    pub fn iter_coins(&self) -> Result<Vec<(OutPoint, Coin)>, StorageError> {
        let prefix = self.keyspace.coin_prefix();
        self.store
            .scan_prefix(prefix)?
            .into_iter()
            .map(|(key, value)| Ok((outpoint_from_coin_key(prefix, &key)?, decode(&value)?)))
            .collect()
    }

    /// Delete every coin and the best block marker of this keyspace.
    pub fn wipe(&self) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        for (key, _) in self.store.scan_prefix(self.keyspace.coin_prefix())? {
            batch.delete(key);
        }
        batch.delete(self.keyspace.best_block_key());
        self.store.write_batch(&batch)
    }

    /// Bulk insert coins outside the cache, used when loading a snapshot.
    pub fn write_coins(&self, coins: &[(OutPoint, Coin)]) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        for (outpoint, coin) in coins {
            batch.put(coin_key(self.keyspace.coin_prefix(), outpoint), encode(coin)?);
        }
        self.store.write_batch(&batch)
    }

    pub fn write_best_block(&self, hash: &Hash256) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.put(self.keyspace.best_block_key(), hash.to_vec());
        self.store.write_batch(&batch)
    }
}

impl CoinsView for CoinsViewDb {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StorageError> {
        match self.store.get(&coin_key(self.keyspace.coin_prefix(), outpoint))? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn best_block(&self) -> Result<Hash256, StorageError> {
        match self.store.get(&self.keyspace.best_block_key())? {
            Some(bytes) => decode_hash(&bytes),
            None => Ok(NULL_HASH),
        }
    }

    fn batch_write(&mut self, changes: &CoinsMap, best_block: Hash256) -> Result<(), CoinsError> {
        let prefix = self.keyspace.coin_prefix();
        let mut batch = self.staged.clone();
        for (outpoint, entry) in changes.iter().filter(|(_, e)| e.is_dirty()) {
            let key = coin_key(prefix, outpoint);
            match &entry.coin {
                Some(coin) => batch.put(key, encode(coin)?),
                None => batch.delete(key),
            }
        }
        // Same batch as the coins, so the set always knows its own height
        batch.put(self.keyspace.best_block_key(), best_block.to_vec());

        self.store.write_batch(&batch)?;
        self.staged = WriteBatch::new();
        Ok(())
    }
}
