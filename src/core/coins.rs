//! UTXO set views.
//!
//! A [`CoinsViewCache`] sits above any other [`CoinsView`] (the database, or
//! another cache) and records changes locally until [`CoinsViewCache::flush`]
//! merges them into its parent in one batch. Caches stack: block connection
//! runs in a scratch layer above the chainstate cache so a rejected block
//! leaves nothing behind.
//!
//! Each cache entry carries two flags:
//!
//! * `DIRTY` - the entry differs from the parent and must be written on flush.
//! * `FRESH` - the parent has no unspent coin here, so spending the entry
//!   before a flush can simply erase it.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::core::script;
use crate::core::types::{Hash256, OutPoint, TxOutput, NULL_HASH};
use crate::storage::StorageError;

/// An unspent output with its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub output: TxOutput,
    pub height: u64,
    pub is_coinbase: bool,
}

#[derive(Debug, Error)]
pub enum CoinsError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The view reached a state that correct validation can never produce.
    #[error("{0}")]
    Invariant(String),
}

pub const DIRTY: u8 = 1 << 0;
pub const FRESH: u8 = 1 << 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// `None` marks a spent coin the parent still has to delete.
    pub coin: Option<Coin>,
    pub flags: u8,
}

impl CacheEntry {
    pub fn is_dirty(&self) -> bool {
        self.flags & DIRTY != 0
    }

    pub fn is_fresh(&self) -> bool {
        self.flags & FRESH != 0
    }
}

pub type CoinsMap = HashMap<OutPoint, CacheEntry>;

/// Read access to a UTXO set plus the ability to absorb a child's changes.
pub trait CoinsView {
    /// Look up a coin. Never mutates the view.
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StorageError>;

    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool, StorageError> {
        Ok(self.get_coin(outpoint)?.is_some())
    }

    /// Hash of the block this view is consistent with.
    fn best_block(&self) -> Result<Hash256, StorageError>;

    /// Merge a child's dirty entries and its best block, all or nothing.
    fn batch_write(&mut self, changes: &CoinsMap, best_block: Hash256) -> Result<(), CoinsError>;
}

impl<V: CoinsView + ?Sized> CoinsView for &mut V {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StorageError> {
        (**self).get_coin(outpoint)
    }

    fn best_block(&self) -> Result<Hash256, StorageError> {
        (**self).best_block()
    }

    fn batch_write(&mut self, changes: &CoinsMap, best_block: Hash256) -> Result<(), CoinsError> {
        (**self).batch_write(changes, best_block)
    }
}

pub struct CoinsViewCache<V: CoinsView> {
    base: V,
    cache: CoinsMap,
    best_block: Option<Hash256>,
}

impl<V: CoinsView> CoinsViewCache<V> {
    pub fn new(base: V) -> Self {
        Self {
            base,
            cache: HashMap::new(),
            best_block: None,
        }
    }

    pub fn base(&self) -> &V {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut V {
        &mut self.base
    }

    /// Bring a coin into this layer, returning it if unspent.
    pub fn fetch_coin(&mut self, outpoint: &OutPoint) -> Result<Option<&Coin>, StorageError> {
        if !self.cache.contains_key(outpoint) {
            let Some(coin) = self.base.get_coin(outpoint)? else {
                return Ok(None);
            };
            self.cache.insert(outpoint.clone(), CacheEntry { coin: Some(coin), flags: 0 });
        }
        Ok(self.cache.get(outpoint).and_then(|e| e.coin.as_ref()))
    }

    /// Add a coin. Outputs that can never be spent are skipped.
    ///
    /// Overwriting an unspent coin is only legal with `possible_overwrite`; any
    /// other overwrite means two transactions share a txid.
    pub fn add_coin(&mut self, outpoint: OutPoint, coin: Coin, possible_overwrite: bool) -> Result<(), CoinsError> {
        if script::is_unspendable(&coin.output.script_pubkey) {
            return Ok(());
        }

        let fresh = match self.cache.get(&outpoint) {
            Some(entry) => {
                if entry.coin.is_some() && !possible_overwrite {
                    error!("❌ Attempted to overwrite unspent coin {}", outpoint);
                    return Err(CoinsError::Invariant(format!("overwrite of unspent coin {outpoint}")));
                }
                // A spent marker that was never flushed means the parent may
                // still hold the coin, so the new entry cannot be FRESH.
                !possible_overwrite && !entry.is_dirty()
            }
            None if possible_overwrite => false,
            None => {
                if self.base.have_coin(&outpoint)? {
                    error!("❌ Attempted to overwrite unspent coin {} held by parent view", outpoint);
                    return Err(CoinsError::Invariant(format!("overwrite of unspent coin {outpoint}")));
                }
                true
            }
        };

        let entry = self.cache.entry(outpoint).or_insert(CacheEntry { coin: None, flags: 0 });
        entry.coin = Some(coin);
        entry.flags |= DIRTY;
        if fresh {
            entry.flags |= FRESH;
        }
        Ok(())
    }

    /// Spend a coin, returning what was spent. `Ok(None)` if it does not exist.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, StorageError> {
        if self.fetch_coin(outpoint)?.is_none() {
            return Ok(None);
        }
        let fresh = self.cache.get(outpoint).map_or(false, |e| e.is_fresh());
        if fresh {
            return Ok(self.cache.remove(outpoint).and_then(|e| e.coin));
        }
        let Some(entry) = self.cache.get_mut(outpoint) else {
            return Ok(None);
        };
        entry.flags |= DIRTY;
        Ok(entry.coin.take())
    }

    pub fn have_coin_in_cache(&self, outpoint: &OutPoint) -> bool {
        self.cache.get(outpoint).map_or(false, |e| e.coin.is_some())
    }

    /// Drop an unmodified entry from this layer.
    pub fn uncache(&mut self, outpoint: &OutPoint) {
        if self.cache.get(outpoint).map_or(false, |e| e.flags == 0) {
            self.cache.remove(outpoint);
        }
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = Some(hash);
    }

    /// Push every dirty entry and the best block into the parent.
    ///
    /// On error this layer is left exactly as it was, so the flush can be
    /// retried.
    pub fn flush(&mut self) -> Result<(), CoinsError> {
        let best = self.best_block()?;
        self.base.batch_write(&self.cache, best)?;
        self.cache.clear();
        Ok(())
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.cache.values().filter(|e| e.is_dirty()).count()
    }
}

impl<V: CoinsView> CoinsView for CoinsViewCache<V> {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StorageError> {
        match self.cache.get(outpoint) {
            Some(entry) => Ok(entry.coin.clone()),
            None => self.base.get_coin(outpoint),
        }
    }

    fn best_block(&self) -> Result<Hash256, StorageError> {
        match self.best_block {
            Some(hash) => Ok(hash),
            None => self.base.best_block(),
        }
    }

    fn batch_write(&mut self, changes: &CoinsMap, best_block: Hash256) -> Result<(), CoinsError> {
        // Validate before touching anything so a failure leaves both layers intact
        for (outpoint, child) in changes.iter().filter(|(_, e)| e.is_dirty() && e.is_fresh()) {
            if let Some(parent) = self.cache.get(outpoint) {
                if parent.coin.is_some() {
                    error!("❌ FRESH flag misapplied to coin {} that exists in parent cache", outpoint);
                    return Err(CoinsError::Invariant(format!(
                        "FRESH entry {outpoint} collides with unspent parent coin (child spent: {})",
                        child.coin.is_none()
                    )));
                }
            }
        }

        for (outpoint, child) in changes.iter().filter(|(_, e)| e.is_dirty()) {
            match self.cache.get_mut(outpoint) {
                None => {
                    // Created and spent without the parent ever seeing it
                    if child.is_fresh() && child.coin.is_none() {
                        continue;
                    }
                    self.cache.insert(
                        outpoint.clone(),
                        CacheEntry {
                            coin: child.coin.clone(),
                            flags: DIRTY | (child.flags & FRESH),
                        },
                    );
                }
                Some(parent) => {
                    if parent.is_fresh() && child.coin.is_none() {
                        self.cache.remove(outpoint);
                    } else {
                        parent.coin = child.coin.clone();
                        parent.flags |= DIRTY;
                    }
                }
            }
        }

        self.best_block = Some(best_block);
        Ok(())
    }
}

// ─── Undo log ────────────────────────────────────────────────────────

/// A coin consumed by a block, kept so the block can be disconnected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpentCoin {
    pub outpoint: OutPoint,
    pub coin: Coin,
}

/// Every coin a block spent, in the order the block spent them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndo {
    pub spent: Vec<SpentCoin>,
}

/// An empty view that knows no coins, for tests and throwaway validation.
#[derive(Debug, Default)]
pub struct EmptyCoinsView;

impl CoinsView for EmptyCoinsView {
    fn get_coin(&self, _outpoint: &OutPoint) -> Result<Option<Coin>, StorageError> {
        Ok(None)
    }

    fn best_block(&self) -> Result<Hash256, StorageError> {
        Ok(NULL_HASH)
    }

    fn batch_write(&mut self, _changes: &CoinsMap, _best_block: Hash256) -> Result<(), CoinsError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script::{op_return_script, p2pkh_script};
    use crate::storage::{CoinsKeyspace, CoinsViewDb, KeyValueStore, MemoryStore, SharedStore};
    use std::sync::Arc;

    fn coin(amount: u64) -> Coin {
        Coin {
            output: TxOutput { amount, script_pubkey: p2pkh_script(&[1u8; 32]) },
            height: 1,
            is_coinbase: false,
        }
    }

    fn op(n: u8) -> OutPoint {
        OutPoint::new([n; 32], 0)
    }

    fn db() -> (Arc<MemoryStore>, CoinsViewDb) {
        let mem = Arc::new(MemoryStore::new());
        let shared: SharedStore = mem.clone();
        (mem, CoinsViewDb::new(shared, CoinsKeyspace::Primary))
    }

    #[test]
    fn test_fresh_coin_spent_in_same_layer_is_erased() {
        let (mem, db) = db();
        let mut cache = CoinsViewCache::new(db);
        cache.add_coin(op(1), coin(10), false).unwrap();
        assert_eq!(cache.spend_coin(&op(1)).unwrap(), Some(coin(10)));
        assert_eq!(cache.cache_size(), 0);
        assert_eq!(cache.get_coin(&op(1)).unwrap(), None);

        cache.set_best_block([7u8; 32]);
        cache.flush().unwrap();
        assert!(mem.scan_prefix(b"utx:").unwrap().is_empty());
    }

    #[test]
    fn test_spend_of_parent_coin_deletes_on_flush() {
        let (mem, db) = db();
        let mut cache = CoinsViewCache::new(db);
        cache.add_coin(op(1), coin(10), false).unwrap();
        cache.set_best_block([1u8; 32]);
        cache.flush().unwrap();
        assert_eq!(mem.scan_prefix(b"utx:").unwrap().len(), 1);

        assert_eq!(cache.spend_coin(&op(1)).unwrap(), Some(coin(10)));
        // Spent marker stays until flush
        assert_eq!(cache.cache_size(), 1);
        assert_eq!(cache.get_coin(&op(1)).unwrap(), None);
        cache.set_best_block([2u8; 32]);
        cache.flush().unwrap();
        assert!(mem.scan_prefix(b"utx:").unwrap().is_empty());
        assert_eq!(cache.best_block().unwrap(), [2u8; 32]);
    }

    #[test]
    fn test_overwrite_unspent_is_invariant_violation() {
        let (_mem, db) = db();
        let mut cache = CoinsViewCache::new(db);
        cache.add_coin(op(1), coin(10), false).unwrap();
        assert!(matches!(cache.add_coin(op(1), coin(11), false), Err(CoinsError::Invariant(_))));
        cache.add_coin(op(1), coin(11), true).unwrap();
        assert_eq!(cache.get_coin(&op(1)).unwrap(), Some(coin(11)));
    }

    #[test]
    fn test_overwrite_detected_through_parent() {
        let (_mem, db) = db();
        let mut parent = CoinsViewCache::new(db);
        parent.add_coin(op(3), coin(5), false).unwrap();
        let mut child = CoinsViewCache::new(&mut parent);
        assert!(matches!(child.add_coin(op(3), coin(6), false), Err(CoinsError::Invariant(_))));
    }

    #[test]
    fn test_unspendable_outputs_skipped() {
        let (_mem, db) = db();
        let mut cache = CoinsViewCache::new(db);
        let burn = Coin {
            output: TxOutput { amount: 0, script_pubkey: op_return_script(b"data") },
            height: 1,
            is_coinbase: false,
        };
        cache.add_coin(op(1), burn, false).unwrap();
        assert_eq!(cache.cache_size(), 0);
    }

    #[test]
    fn test_get_coin_does_not_populate_cache() {
        let (_mem, db) = db();
        let mut cache = CoinsViewCache::new(db);
        cache.add_coin(op(1), coin(10), false).unwrap();
        cache.set_best_block([1u8; 32]);
        cache.flush().unwrap();

        assert_eq!(cache.get_coin(&op(1)).unwrap(), Some(coin(10)));
        assert_eq!(cache.cache_size(), 0);
        assert!(cache.fetch_coin(&op(1)).unwrap().is_some());
        assert_eq!(cache.cache_size(), 1);
        cache.uncache(&op(1));
        assert_eq!(cache.cache_size(), 0);
    }

    #[test]
    fn test_child_layer_dropped_leaves_parent_untouched() {
        let (_mem, db) = db();
        let mut parent = CoinsViewCache::new(db);
        parent.add_coin(op(1), coin(10), false).unwrap();
        {
            let mut child = CoinsViewCache::new(&mut parent);
            child.spend_coin(&op(1)).unwrap();
            child.add_coin(op(2), coin(9), false).unwrap();
        }
        assert_eq!(parent.get_coin(&op(1)).unwrap(), Some(coin(10)));
        assert_eq!(parent.get_coin(&op(2)).unwrap(), None);
    }

    #[test]
    fn test_child_flush_merges_into_parent() {
        let (_mem, db) = db();
        let mut parent = CoinsViewCache::new(db);
        parent.add_coin(op(1), coin(10), false).unwrap();
        {
            let mut child = CoinsViewCache::new(&mut parent);
            child.spend_coin(&op(1)).unwrap();
            child.add_coin(op(2), coin(9), false).unwrap();
            child.set_best_block([4u8; 32]);
            child.flush().unwrap();
        }
        // op(1) was FRESH in the parent, so the spend erased it entirely
        assert_eq!(parent.cache_size(), 1);
        assert_eq!(parent.get_coin(&op(2)).unwrap(), Some(coin(9)));
        assert_eq!(parent.best_block().unwrap(), [4u8; 32]);
    }

    #[test]
    fn test_fresh_misapplied_rejected_before_apply() {
        let (_mem, db) = db();
        let mut parent = CoinsViewCache::new(db);
        parent.add_coin(op(1), coin(10), false).unwrap();

        let mut changes = CoinsMap::new();
        changes.insert(op(2), CacheEntry { coin: Some(coin(2)), flags: DIRTY | FRESH });
        changes.insert(op(1), CacheEntry { coin: Some(coin(3)), flags: DIRTY | FRESH });
        assert!(matches!(parent.batch_write(&changes, [9u8; 32]), Err(CoinsError::Invariant(_))));
        assert_eq!(parent.get_coin(&op(2)).unwrap(), None);
        assert_eq!(parent.get_coin(&op(1)).unwrap(), Some(coin(10)));
    }

    #[test]
    fn test_failed_flush_keeps_layer_for_retry() {
        let (mem, db) = db();
        let mut cache = CoinsViewCache::new(db);
        cache.add_coin(op(1), coin(10), false).unwrap();
        cache.set_best_block([5u8; 32]);

        mem.set_fail_writes(true);
        assert!(matches!(cache.flush(), Err(CoinsError::Storage(e)) if e.is_transient()));
        assert_eq!(cache.dirty_count(), 1);

        mem.set_fail_writes(false);
        cache.flush().unwrap();
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(cache.get_coin(&op(1)).unwrap(), Some(coin(10)));
        assert_eq!(cache.base().best_block().unwrap(), [5u8; 32]);
    }

    #[test]
    fn test_readd_after_unflushed_spend_is_not_fresh() {
        let (mem, db) = db();
        let mut cache = CoinsViewCache::new(db);
        cache.add_coin(op(1), coin(10), false).unwrap();
        cache.set_best_block([1u8; 32]);
        cache.flush().unwrap();

        cache.spend_coin(&op(1)).unwrap();
        cache.add_coin(op(1), coin(12), false).unwrap();
        cache.spend_coin(&op(1)).unwrap();
        cache.flush().unwrap();
        // The final spend must still delete the coin from the database
        assert!(mem.scan_prefix(b"utx:").unwrap().is_empty());
    }
}
