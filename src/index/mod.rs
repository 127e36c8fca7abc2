//! Transaction index: where every transaction of the active chain lives.
//!
//! The index follows the chain through [`ChainEvent`]s while it is in sync.
//! When it falls behind (it was attached late, or events arrived while it was
//! not contiguous) [`TxIndex::sync_to`] walks the active chain to catch up.
//! Entries and the index's own best block are written in one batch, so the
//! stored index is always consistent with the best block it records.
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::chainstate::ChainstateManager;
use crate::core::notifications::{ChainEvent, NotificationSink};
use crate::core::types::{Block, Hash256};
use crate::error::ChainError;
use crate::storage::{
    decode, encode, prefixed_key, KeyValueStore, SharedStore, StorageError, WriteBatch, META_BEST_PREFIX, PREFIX_TXINDEX,
};

const INDEX_NAME: &str = "txindex";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxLocation {
    pub block_hash: Hash256,
    pub height: u64,
    /// Position of the transaction inside the block
    pub position: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSummary {
    pub name: &'static str,
    pub synced: bool,
    pub best_block_height: Option<u64>,
}

pub struct TxIndex {
    store: SharedStore,
    /// Last block whose transactions are indexed, `None` before genesis
    best: Mutex<Option<(Hash256, u64)>>,
}

fn best_key() -> Vec<u8> {
    prefixed_key(META_BEST_PREFIX, INDEX_NAME.as_bytes())
}

impl TxIndex {
    pub fn open(store: SharedStore) -> Result<Self, StorageError> {
        let best = match store.get(&best_key())? {
            Some(bytes) => Some(decode::<(Hash256, u64)>(&bytes)?),
            None => None,
        };
        if let Some((hash, height)) = best {
            debug!("🗂️  Tx index resumes at #{} [{}]", height, hex::encode(&hash[..8]));
        }
        Ok(Self {
            store,
            best: Mutex::new(best),
        })
    }

    pub fn lookup(&self, txid: &Hash256) -> Result<Option<TxLocation>, StorageError> {
        match self.store.get(&prefixed_key(PREFIX_TXINDEX, txid))? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn best_block(&self) -> Option<(Hash256, u64)> {
        *self.best.lock()
    }

    /// Index `block` at `height` if it extends the indexed chain. Returns
    /// false when it does not.
    fn apply_connect(&self, block: &Block, height: u64) -> Result<bool, StorageError> {
        let mut best = self.best.lock();
        let extends = match *best {
            None => height == 0,
            Some((hash, h)) => block.header.prev_hash == hash && height == h + 1,
        };
        if !extends {
            return Ok(false);
        }

        let block_hash = block.hash();
        let mut batch = WriteBatch::new();
        for (position, tx) in block.transactions.iter().enumerate() {
            let location = TxLocation {
                block_hash,
                height,
                position: position as u32,
            };
            batch.put(prefixed_key(PREFIX_TXINDEX, &tx.txid()), encode(&location)?);
        }
        batch.put(best_key(), encode(&(block_hash, height))?);
        self.store.write_batch(&batch)?;
        *best = Some((block_hash, height));
        Ok(true)
    }

    /// Remove `block` if it is the indexed tip. Returns false when it is not.
    fn apply_disconnect(&self, block: &Block, height: u64) -> Result<bool, StorageError> {
        let mut best = self.best.lock();
        let block_hash = block.hash();
        if *best != Some((block_hash, height)) {
            return Ok(false);
        }

        let mut batch = WriteBatch::new();
        for tx in &block.transactions {
            batch.delete(prefixed_key(PREFIX_TXINDEX, &tx.txid()));
        }
        let new_best = height.checked_sub(1).map(|h| (block.header.prev_hash, h));
        match &new_best {
            Some(entry) => batch.put(best_key(), encode(entry)?),
            None => batch.delete(best_key()),
        }
        self.store.write_batch(&batch)?;
        *best = new_best;
        Ok(true)
    }

    /// Catch up with the manager's active chain, rewinding past blocks that
    /// left it. Stops between blocks when `cancel` is set.
    pub fn sync_to(&self, manager: &ChainstateManager, cancel: &AtomicBool) -> Result<IndexSummary, ChainError> {
        let mut indexed = 0usize;
        loop {
            if cancel.load(Ordering::SeqCst) {
                info!("⏸️  Tx index sync interrupted after {} blocks", indexed);
                break;
            }

            let next_height = match self.best_block() {
                None => 0,
                Some((hash, height)) if manager.block_at_height(height) == Some(hash) => height + 1,
                Some((hash, height)) => {
                    let block = manager
                        .read_block(&hash)?
                        .ok_or_else(|| StorageError::Corruption(format!("indexed block {} missing", hex::encode(hash))))?;
                    self.apply_disconnect(&block, height)?;
                    debug!("Tx index rewound past #{} [{}]", height, hex::encode(&hash[..8]));
                    continue;
                }
            };

            let Some(hash) = manager.block_at_height(next_height) else {
                break;
            };
            let block = manager
                .read_block(&hash)?
                .ok_or_else(|| StorageError::Corruption(format!("active block {} missing", hex::encode(hash))))?;
            if self.apply_connect(&block, next_height)? {
                indexed += 1;
            }
        }
        if indexed > 0 {
            info!("🗂️  Tx index caught up: {} blocks indexed", indexed);
        }
        Ok(self.summary(manager))
    }

    pub fn summary(&self, manager: &ChainstateManager) -> IndexSummary {
        let best = self.best_block();
        let synced = match (best, manager.best_tip()) {
            (Some((hash, _)), Ok(tip)) => hash == tip.hash,
            _ => false,
        };
        IndexSummary {
            name: INDEX_NAME,
            synced,
            best_block_height: best.map(|(_, h)| h),
        }
    }
}

impl NotificationSink for TxIndex {
    fn notify(&self, event: &ChainEvent) {
        let result = match event {
            ChainEvent::BlockConnected { block, summary } => self.apply_connect(block, summary.height),
            ChainEvent::BlockDisconnected { block, summary } => self.apply_disconnect(block, summary.height),
            ChainEvent::TipChanged { .. } => return,
        };
        match result {
            Ok(true) => {}
            Ok(false) => debug!("Tx index not contiguous with {}, waiting for sync", event.name()),
            Err(e) => warn!("⚠️  Tx index update failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::test_utils::{make_block, TestChain};

    #[test]
    fn test_follows_connects_once_synced() {
        let chain = TestChain::new();
        let index = Arc::new(TxIndex::open(chain.store.clone()).unwrap());
        let summary = index.sync_to(&chain.manager, &AtomicBool::new(false)).unwrap();
        assert!(summary.synced);
        assert_eq!(summary.best_block_height, Some(0));
        chain.manager.register_sink(index.clone());

        let b1 = chain.mine_on_tip(b"b1");
        let location = index.lookup(&b1.transactions[0].txid()).unwrap().unwrap();
        assert_eq!(location, TxLocation { block_hash: b1.hash(), height: 1, position: 0 });
        assert!(index.summary(&chain.manager).synced);
    }

    #[test]
    fn test_late_index_catches_up_and_persists() {
        let chain = TestChain::new();
        let blocks: Vec<Block> = (0..3).map(|i| chain.mine_on_tip(&[b't', i])).collect();

        let index = TxIndex::open(chain.store.clone()).unwrap();
        assert!(!index.summary(&chain.manager).synced);
        index.sync_to(&chain.manager, &AtomicBool::new(false)).unwrap();
        assert_eq!(index.best_block(), Some((blocks[2].hash(), 3)));

        let reopened = TxIndex::open(chain.store.clone()).unwrap();
        assert_eq!(reopened.best_block(), Some((blocks[2].hash(), 3)));
        assert!(reopened.lookup(&blocks[1].transactions[0].txid()).unwrap().is_some());
    }

    #[test]
    fn test_reorg_drops_disconnected_transactions() {
        let chain = TestChain::new();
        let index = Arc::new(TxIndex::open(chain.store.clone()).unwrap());
        index.sync_to(&chain.manager, &AtomicBool::new(false)).unwrap();
        chain.manager.register_sink(index.clone());

        let genesis = chain.params.genesis.header.clone();
        let a = make_block(&chain.params, &genesis, 1, &chain.miner, b"a", vec![], 0, 1);
        chain.submit(&a);
        let b = make_block(&chain.params, &genesis, 1, &chain.miner, b"b", vec![], 0, 2);
        chain.submit(&b);

        assert!(index.lookup(&a.transactions[0].txid()).unwrap().is_none());
        assert_eq!(index.lookup(&b.transactions[0].txid()).unwrap().unwrap().block_hash, b.hash());
    }

    #[test]
    fn test_sync_rewinds_stale_tip() {
        let chain = TestChain::new();
        let b1 = chain.mine_on_tip(b"b1");
        let index = TxIndex::open(chain.store.clone()).unwrap();
        index.sync_to(&chain.manager, &AtomicBool::new(false)).unwrap();

        // Reorg while the index is not listening
        chain.manager.invalidate_block(&b1.hash()).unwrap();
        let summary = index.sync_to(&chain.manager, &AtomicBool::new(false)).unwrap();
        assert!(summary.synced);
        assert_eq!(summary.best_block_height, Some(0));
        assert!(index.lookup(&b1.transactions[0].txid()).unwrap().is_none());
    }
}
