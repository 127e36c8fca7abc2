//! The chainstate manager: owns the block index, the active chain and its
//! coin cache, and serializes every mutation of them behind one lock.
//!
//! Blocks arrive through [`ChainstateManager::process_block`]. After the
//! context-free and contextual checks pass, the block is stored and the
//! manager moves its active chain to the most-work valid candidate. That can
//! mean disconnecting blocks down to a fork point before connecting the new
//! branch. Each connect runs on a scratch coins layer, so a block that fails
//! half way leaves the active set untouched.
//!
//! Undo records, index changes and coin changes are flushed to the store in
//! one atomic batch. A failed flush keeps everything in memory for a retry
//! and never marks a block invalid.
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::core::block_index::{ActiveChain, BlockIndex, BlockStatus, BlockSummary};
use crate::core::checkqueue::CheckQueue;
use crate::core::coins::{BlockUndo, Coin, CoinsView, CoinsViewCache};
use crate::core::notifications::{ChainEvent, NotificationRegistry, NotificationSink};
use crate::core::params::ChainParams;
use crate::core::script::verify_script;
use crate::core::snapshot::{self, SnapshotError, SnapshotMetadata, UtxoStats};
use crate::core::types::{decode_wire, Block, BlockHeader, Hash256, OutPoint, Transaction, NULL_HASH};
use crate::core::validation;
use crate::error::{ChainError, RejectReason};
use crate::mempool::MempoolInterface;
use crate::storage::{BlockStore, CoinsKeyspace, CoinsViewDb, SharedStore, StorageError, WriteBatch};

/// Coins per batch when writing a loaded snapshot into the store.
const SNAPSHOT_WRITE_CHUNK: usize = 10_000;

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Script verification threads. Zero verifies on the calling thread.
    pub script_threads: usize,
    /// Flush the coin cache once it holds more entries than this.
    pub coins_cache_entries: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            script_threads: 0,
            coins_cache_entries: 250_000,
        }
    }
}

/// What the manager is doing right now, readable without the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChainPhase {
    Idle = 0,
    Connecting = 1,
    Disconnecting = 2,
    Flushing = 3,
}

impl ChainPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ChainPhase::Connecting,
            2 => ChainPhase::Disconnecting,
            3 => ChainPhase::Flushing,
            _ => ChainPhase::Idle,
        }
    }
}

/// Where an accepted block ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAcceptance {
    /// On the active chain after activation
    ActiveChain,
    /// Stored and valid so far, but on a branch with less work
    SideChain,
    /// Body already stored
    AlreadyKnown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxAcceptance {
    pub txid: Hash256,
    pub fee: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    /// Blocks whose parent was not known when they were read
    pub orphans: usize,
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReindexSummary {
    pub connected: usize,
    pub interrupted: bool,
}

struct Chainstate {
    coins: CoinsViewCache<CoinsViewDb>,
    chain: ActiveChain,
    keyspace: CoinsKeyspace,
}

struct ManagerState {
    index: BlockIndex,
    active: Chainstate,
    /// Reason each block was last found invalid for
    invalid_reasons: HashMap<Hash256, RejectReason>,
    /// Undo records of connected blocks not yet flushed
    pending_undo: HashMap<Hash256, BlockUndo>,
    /// Transactions of disconnected blocks, offered back to the mempool
    readmit: Vec<Transaction>,
    /// Base of the loaded snapshot; nothing at or below it can be disconnected
    snapshot_base: Option<(Hash256, u64)>,
    /// Set after a fatal error. Every later call fails.
    halted: Option<String>,
}

pub struct ChainstateManager {
    params: ChainParams,
    options: ManagerOptions,
    store: SharedStore,
    blocks: BlockStore,
    state: Mutex<ManagerState>,
    phase: AtomicU8,
    queue: CheckQueue,
    notifications: NotificationRegistry,
    mempool: RwLock<Option<Arc<dyn MempoolInterface>>>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn short(hash: &Hash256) -> String {
    hex::encode(&hash[..8])
}

fn missing(what: &str, hash: &Hash256) -> ChainError {
    ChainError::InternalInvariant(format!("{what} {} missing", hex::encode(hash)))
}

impl ChainstateManager {
    /// Open the chainstate kept in `store`, initializing it at genesis if the
    /// store is empty, and reconnect towards the best stored candidate.
    pub fn open(store: SharedStore, params: ChainParams, options: ManagerOptions) -> Result<Self, ChainError> {
        let blocks = BlockStore::new(store.clone());
        let keyspace = blocks.active_keyspace()?;
        let db = CoinsViewDb::new(store.clone(), keyspace);
        let genesis = params.genesis_hash();

        let entries = blocks.load_index_entries()?;
        let mut index = if entries.is_empty() {
            let index = BlockIndex::new(&params);
            let mut batch = WriteBatch::new();
            blocks.put_block(&mut batch, &genesis, &params.genesis)?;
            for entry in index.dirty_entries() {
                blocks.put_index_entry(&mut batch, &entry)?;
            }
            blocks.write(&batch)?;
            db.write_best_block(&genesis)?;
            info!("🌱 Initialized {} chainstate at genesis [{}]", params.network, short(&genesis));
            index
        } else {
            BlockIndex::from_entries(entries, &params)?
        };
        index.clear_dirty();

        let best = match db.best_block()? {
            hash if hash == NULL_HASH => genesis,
            hash => hash,
        };
        let chain = ActiveChain::from_tip(&index, &best).ok_or_else(|| {
            StorageError::Corruption(format!("coins best block {} is not in the block index", hex::encode(best)))
        })?;
        let snapshot_base = match keyspace {
            CoinsKeyspace::Snapshot => (0..=chain.height())
                .rev()
                .filter_map(|h| chain.at_height(h))
                .filter_map(|h| index.get(&h))
                .find(|node| node.assumed_valid)
                .map(|node| (node.hash, node.height)),
            CoinsKeyspace::Primary => None,
        };

        let manager = Self {
            queue: CheckQueue::new(options.script_threads),
            params,
            options,
            store,
            blocks,
            state: Mutex::new(ManagerState {
                index,
                active: Chainstate {
                    coins: CoinsViewCache::new(db),
                    chain,
                    keyspace,
                },
                invalid_reasons: HashMap::new(),
                pending_undo: HashMap::new(),
                readmit: Vec::new(),
                snapshot_base,
                halted: None,
            }),
            phase: AtomicU8::new(ChainPhase::Idle as u8),
            notifications: NotificationRegistry::new(),
            mempool: RwLock::new(None),
        };

        {
            let mut state = manager.state.lock();
            let result = manager.activate_best_chain(&mut state);
            manager.finish(&mut state, result)?;
            info!(
                "📂 Chainstate open: tip #{} [{}], {} index entries, {} coins keyspace",
                state.active.chain.height(),
                short(&state.active.chain.tip()),
                state.index.len(),
                state.active.keyspace.name()
            );
        }
        Ok(manager)
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn phase(&self) -> ChainPhase {
        ChainPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn register_sink(&self, sink: Arc<dyn NotificationSink>) {
        self.notifications.register(sink);
    }

    /// Attach the pool that gets conflict removals and re-admissions.
    pub fn set_mempool(&self, pool: Arc<dyn MempoolInterface>) {
        *self.mempool.write() = Some(pool);
    }

    // ─── Lock discipline ─────────────────────────────────────────────

    fn lock_running(&self) -> Result<MutexGuard<'_, ManagerState>, ChainError> {
        let state = self.state.lock();
        match &state.halted {
            Some(reason) => Err(ChainError::Halted(reason.clone())),
            None => Ok(state),
        }
    }

    /// Return to idle and halt on a fatal error.
    fn finish<T>(&self, state: &mut ManagerState, result: Result<T, ChainError>) -> Result<T, ChainError> {
        self.set_phase(ChainPhase::Idle);
        if let Err(e) = &result {
            if e.is_fatal() {
                error!("🛑 Chainstate halted: {}", e);
                state.halted = Some(e.to_string());
            }
        }
        result
    }

    fn set_phase(&self, phase: ChainPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    // ─── Block and header submission ─────────────────────────────────

    /// Decode, validate and store a block, then activate the best chain.
    pub fn process_block(&self, bytes: &[u8]) -> Result<BlockAcceptance, ChainError> {
        let block: Block = decode_wire(bytes)
            .map_err(|e| RejectReason::malformed("block-decode").with_detail(e.to_string()))?;
        let mut state = self.lock_running()?;
        let result = self.accept_block(&mut state, block);
        self.finish(&mut state, result)
    }

    /// Validate a header and add it to the index without a body.
    pub fn process_header(&self, header: &BlockHeader) -> Result<BlockSummary, ChainError> {
        let mut state = self.lock_running()?;
        let result = self
            .accept_header(&mut state, header)
            .and_then(|hash| state.index.get(&hash).map(|n| n.summary()).ok_or_else(|| missing("header", &hash)));
        self.finish(&mut state, result)
    }

    fn accept_header(&self, state: &mut ManagerState, header: &BlockHeader) -> Result<Hash256, ChainError> {
        let hash = header.hash();
        if let Some(reason) = state.invalid_reasons.get(&hash) {
            debug!("Header [{}] already known invalid: {}", short(&hash), reason);
            return Err(reason.clone().into());
        }
        if let Some(node) = state.index.get(&hash) {
            if node.status.is_invalid() {
                return Err(RejectReason::invalid_ancestor().into());
            }
            return Ok(hash);
        }

        // Proof-of-work failures are not remembered: anyone can make them
        validation::check_block_header(header, &self.params)?;

        let parent = state
            .index
            .get(&header.prev_hash)
            .ok_or(ChainError::UnknownParent(header.prev_hash))?;
        if parent.status.is_invalid() {
            state.index.add_header(header, &self.params);
            state.invalid_reasons.insert(hash, RejectReason::invalid_ancestor());
            return Err(RejectReason::invalid_ancestor().into());
        }
        if let Err(reason) = validation::contextual_check_header(header, parent, &state.index, &self.params, unix_now()) {
            if reason.is_permanent() {
                state.index.add_header(header, &self.params);
                self.record_invalid(state, &hash, reason.clone());
            }
            return Err(reason.into());
        }

        state
            .index
            .add_header(header, &self.params)
            .ok_or(ChainError::UnknownParent(header.prev_hash))?;
        debug!("🧾 Header [{}] accepted", short(&hash));
        Ok(hash)
    }

    fn accept_block(&self, state: &mut ManagerState, block: Block) -> Result<BlockAcceptance, ChainError> {
        let hash = block.hash();
        if let Some(reason) = state.invalid_reasons.get(&hash) {
            debug!("Block [{}] already known invalid: {}", short(&hash), reason);
            return Err(reason.clone().into());
        }
        if let Some(node) = state.index.get(&hash) {
            if node.status.is_invalid() {
                return Err(RejectReason::invalid_ancestor().into());
            }
            if node.have_data {
                return Ok(BlockAcceptance::AlreadyKnown);
            }
        }

        self.accept_header(state, &block.header)?;

        let body = {
            let parent = state
                .index
                .get(&block.header.prev_hash)
                .ok_or(ChainError::UnknownParent(block.header.prev_hash))?;
            validation::check_block_body(&block, &self.params)
                .and_then(|_| validation::contextual_check_block(&block, parent, &state.index, &self.params))
        };
        if let Err(reason) = body {
            if reason.is_permanent() {
                self.record_invalid(state, &hash, reason.clone());
            } else {
                warn!("⚠️  Block [{}] does not match its header: {}", short(&hash), reason);
            }
            return Err(reason.into());
        }

        // Store the body with its index entry before touching the in-memory index
        let mut entry = state.index.get(&hash).map(|n| n.to_stored()).ok_or_else(|| missing("header", &hash))?;
        entry.have_data = true;
        entry.status = BlockStatus::TreeValid;
        let mut batch = WriteBatch::new();
        self.blocks.put_block(&mut batch, &hash, &block)?;
        self.blocks.put_index_entry(&mut batch, &entry)?;
        self.blocks.write(&batch)?;
        state.index.raise_validity(&hash, BlockStatus::TreeValid);
        state.index.set_have_data(&hash);
        debug!("📦 Stored block [{}] at height {}", short(&hash), entry.height);

        self.activate_best_chain(state)?;

        let node = state.index.get(&hash).ok_or_else(|| missing("block", &hash))?;
        if node.status.is_invalid() {
            let reason = state
                .invalid_reasons
                .get(&hash)
                .cloned()
                .unwrap_or_else(RejectReason::invalid_ancestor);
            return Err(reason.into());
        }
        Ok(if state.active.chain.contains(node) {
            BlockAcceptance::ActiveChain
        } else {
            BlockAcceptance::SideChain
        })
    }

    fn record_invalid(&self, state: &mut ManagerState, hash: &Hash256, reason: RejectReason) {
        warn!("🚫 Block [{}] is invalid: {}", short(hash), reason);
        let descendants = state.index.mark_invalid(hash);
        if !descendants.is_empty() {
            debug!("{} descendant(s) of [{}] marked invalid", descendants.len(), short(hash));
        }
        for d in descendants {
            state.invalid_reasons.insert(d, RejectReason::invalid_ancestor());
        }
        state.invalid_reasons.insert(*hash, reason);
    }

    // ─── Chain activation ────────────────────────────────────────────

    fn activate_best_chain(&self, state: &mut ManagerState) -> Result<(), ChainError> {
        let (steps, _) = self.activate_steps(state, None)?;
        let tip = state.active.chain.tip();
        state.index.prune_candidates(&tip);
        self.readmit_disconnected(state);
        if steps > 0 {
            self.flush_state(state)?;
        }
        Ok(())
    }

    /// Step the active chain toward the best candidate, at most `max_steps`
    /// connects and disconnects when bounded. Returns the steps taken and
    /// whether the best candidate was reached.
    fn activate_steps(&self, state: &mut ManagerState, max_steps: Option<usize>) -> Result<(usize, bool), ChainError> {
        let mut steps = 0usize;
        let budget_spent = |steps: usize| max_steps.map_or(false, |max| steps >= max);

        loop {
            let Some(best) = state.index.find_best_candidate() else {
                return Ok((steps, true));
            };
            let best_hash = best.hash;
            let best_work = best.chain_work.clone();
            let tip_hash = state.active.chain.tip();
            let tip_node = state.index.get(&tip_hash).ok_or_else(|| missing("tip", &tip_hash))?;
            if best_hash == tip_hash || best_work <= tip_node.chain_work {
                return Ok((steps, true));
            }

            let fork = state
                .index
                .find_fork(&tip_hash, &best_hash)
                .ok_or_else(|| ChainError::InternalInvariant("candidate shares no ancestor with the tip".into()))?;
            let fork_height = state.index.get(&fork).map_or(0, |n| n.height);
            if let Some((_, base_height)) = state.snapshot_base {
                if fork_height < base_height {
                    warn!("⚠️  Ignoring candidate [{}] forking below the snapshot base", short(&best_hash));
                    state.index.remove_candidate(&best_hash);
                    continue;
                }
            }
            if fork != tip_hash {
                info!(
                    "🔀 Reorganizing from #{} [{}] to [{}], fork at #{}",
                    state.active.chain.height(),
                    short(&tip_hash),
                    short(&best_hash),
                    fork_height
                );
            }

            while state.active.chain.tip() != fork {
                if budget_spent(steps) {
                    return Ok((steps, false));
                }
                self.disconnect_tip(state)?;
                steps += 1;
            }

            for hash in state.index.path_from(&fork, &best_hash) {
                if budget_spent(steps) {
                    return Ok((steps, false));
                }
                match self.connect_tip(state, &hash) {
                    Ok(()) => steps += 1,
                    Err(ChainError::Rejected(reason)) => {
                        self.record_invalid(state, &hash, reason);
                        break;
                    }
                    Err(e) => return Err(e),
                }
                self.maybe_flush(state)?;
            }
        }
    }

    fn connect_tip(&self, state: &mut ManagerState, hash: &Hash256) -> Result<(), ChainError> {
        self.set_phase(ChainPhase::Connecting);
        let node = state.index.get(hash).ok_or_else(|| missing("block index entry", hash))?;
        let height = node.height;
        if node.prev_hash() != state.active.chain.tip() {
            return Err(ChainError::InternalInvariant(format!(
                "block {} does not extend the active tip",
                hex::encode(hash)
            )));
        }
        let block = Arc::new(self.blocks.get_block(hash)?.ok_or_else(|| {
            StorageError::Corruption(format!("block {} indexed with data but not stored", hex::encode(hash)))
        })?);

        let undo = {
            let mut scratch = CoinsViewCache::new(&mut state.active.coins);
            let undo = validation::connect_block(&block, height, &mut scratch, &self.params, &self.queue)?;
            scratch.flush()?;
            undo
        };

        state.pending_undo.insert(*hash, undo);
        state.active.chain.push(*hash);
        state.index.raise_validity(hash, BlockStatus::ScriptsValid);

        if let Some(pool) = self.mempool.read().as_ref() {
            let spent: Vec<OutPoint> = block
                .transactions
                .iter()
                .filter(|tx| !tx.is_coinbase())
                .flat_map(|tx| tx.inputs.iter().map(|i| i.previous_output.clone()))
                .collect();
            pool.remove_conflicting(&spent);
        }

        let summary = state.index.get(hash).map(|n| n.summary()).ok_or_else(|| missing("block", hash))?;
        info!("✅ Connected block #{} [{}] ({} txs)", height, short(hash), block.transactions.len());
        self.notifications.emit(ChainEvent::BlockConnected { block, summary: summary.clone() });
        self.notifications.emit(ChainEvent::TipChanged { tip: summary });
        Ok(())
    }

    fn disconnect_tip(&self, state: &mut ManagerState) -> Result<(), ChainError> {
        self.set_phase(ChainPhase::Disconnecting);
        let hash = state.active.chain.tip();
        let height = state.active.chain.height();
        if height == 0 {
            return Err(ChainError::InternalInvariant("attempted to disconnect genesis".into()));
        }
        if let Some((_, base_height)) = state.snapshot_base {
            if height <= base_height {
                return Err(SnapshotError::Refused(format!(
                    "block #{height} is covered by the loaded snapshot and has no undo data"
                ))
                .into());
            }
        }

        let block = self.blocks.get_block(&hash)?.ok_or_else(|| missing("active block", &hash))?;
        let undo = match state.pending_undo.get(&hash) {
            Some(undo) => undo.clone(),
            None => self
                .blocks
                .get_undo(&hash)?
                .ok_or_else(|| StorageError::Corruption(format!("undo data for {} missing", hex::encode(hash))))?,
        };
        {
            let mut scratch = CoinsViewCache::new(&mut state.active.coins);
            validation::disconnect_block(&block, &undo, &mut scratch)?;
            scratch.flush()?;
        }

        state.pending_undo.remove(&hash);
        state.active.chain.pop();

        if let Some(pool) = self.mempool.read().as_ref() {
            let created: Vec<OutPoint> = block
                .transactions
                .iter()
                .flat_map(|tx| {
                    let txid = tx.txid();
                    (0..tx.outputs.len()).map(move |vout| OutPoint::new(txid, vout as u32))
                })
                .collect();
            pool.remove_spending_vanished(&created);
        }
        // Older blocks are disconnected later, their transactions go first
        let mut txs: Vec<Transaction> = block.transactions.iter().filter(|tx| !tx.is_coinbase()).cloned().collect();
        txs.append(&mut state.readmit);
        state.readmit = txs;

        let summary = state.index.get(&hash).map(|n| n.summary()).ok_or_else(|| missing("block", &hash))?;
        let new_tip = state.active.chain.tip();
        let tip = state.index.get(&new_tip).map(|n| n.summary()).ok_or_else(|| missing("tip", &new_tip))?;
        info!("↩️  Disconnected block #{} [{}]", height, short(&hash));
        self.notifications.emit(ChainEvent::BlockDisconnected {
            block: Arc::new(block),
            summary,
        });
        self.notifications.emit(ChainEvent::TipChanged { tip });
        Ok(())
    }

    /// Offer transactions from disconnected blocks back to the mempool.
    fn readmit_disconnected(&self, state: &mut ManagerState) {
        if state.readmit.is_empty() {
            return;
        }
        let txs = std::mem::take(&mut state.readmit);
        let Some(pool) = self.mempool.read().clone() else {
            return;
        };
        let total = txs.len();
        let mut readded = 0usize;
        for tx in txs {
            match self.check_mempool_tx(state, &tx) {
                Ok(fee) => {
                    if pool.try_accept_loose(&tx, fee).is_ok() {
                        readded += 1;
                    }
                }
                Err(e) => debug!("Dropped disconnected tx [{}]: {}", short(&tx.txid()), e),
            }
        }
        info!("🔁 Re-admitted {}/{} transactions from disconnected blocks", readded, total);
    }

    // ─── Flushing ────────────────────────────────────────────────────

    fn maybe_flush(&self, state: &mut ManagerState) -> Result<(), ChainError> {
        if state.active.coins.cache_size() > self.options.coins_cache_entries {
            debug!("Coin cache at {} entries, flushing", state.active.coins.cache_size());
            self.flush_state(state)?;
        }
        Ok(())
    }

    /// Write undo records, index changes and coins in one batch.
    fn flush_state(&self, state: &mut ManagerState) -> Result<(), ChainError> {
        self.set_phase(ChainPhase::Flushing);
        let mut batch = WriteBatch::new();
        for (hash, undo) in &state.pending_undo {
            self.blocks.put_undo(&mut batch, hash, undo)?;
        }
        for entry in state.index.dirty_entries() {
            self.blocks.put_index_entry(&mut batch, &entry)?;
        }
        let records = batch.len();
        let coin_changes = state.active.coins.dirty_count();

        state.active.coins.base_mut().stage(batch);
        state.active.coins.set_best_block(state.active.chain.tip());
        if let Err(e) = state.active.coins.flush() {
            error!("❌ Chainstate flush failed, keeping changes for retry: {}", e);
            return Err(e.into());
        }
        state.pending_undo.clear();
        state.index.clear_dirty();
        info!(
            "💾 Flushed chainstate at #{}: {} coin changes, {} records",
            state.active.chain.height(),
            coin_changes,
            records
        );
        Ok(())
    }

    /// Flush everything held in memory.
    pub fn flush(&self) -> Result<(), ChainError> {
        let mut state = self.lock_running()?;
        let result = self.flush_state(&mut state);
        self.finish(&mut state, result)
    }

    // ─── Transactions ────────────────────────────────────────────────

    /// Validate a loose transaction against the active tip and hand it to
    /// the mempool, if one is attached.
    pub fn process_transaction(&self, bytes: &[u8]) -> Result<TxAcceptance, ChainError> {
        let tx: Transaction =
            decode_wire(bytes).map_err(|e| RejectReason::malformed("tx-decode").with_detail(e.to_string()))?;
        let txid = tx.txid();
        let mut state = self.lock_running()?;
        let result = self.check_mempool_tx(&mut state, &tx).and_then(|fee| {
            if let Some(pool) = self.mempool.read().as_ref() {
                pool.try_accept_loose(&tx, fee)?;
            }
            debug!("📨 Accepted tx [{}] (fee {})", short(&txid), fee);
            Ok(TxAcceptance { txid, fee })
        });
        self.finish(&mut state, result)
    }

    /// Full validation of `tx` for inclusion in the next block. Returns the fee.
    pub fn check_transaction_for_mempool(&self, tx: &Transaction) -> Result<u64, ChainError> {
        let mut state = self.lock_running()?;
        let result = self.check_mempool_tx(&mut state, tx);
        self.finish(&mut state, result)
    }

    fn check_mempool_tx(&self, state: &mut ManagerState, tx: &Transaction) -> Result<u64, ChainError> {
        validation::check_transaction(tx)?;
        if tx.is_coinbase() {
            return Err(RejectReason::consensus("coinbase").into());
        }
        let tip = state.active.chain.tip();
        let height = state.active.chain.height() + 1;
        if !validation::is_final_tx(tx, height, state.index.median_time_past(&tip)) {
            return Err(RejectReason::consensus("non-final").into());
        }

        let mut view = CoinsViewCache::new(&mut state.active.coins);
        let inputs = validation::check_tx_inputs(tx, &mut view, height, &self.params)?;
        let flags = validation::script_flags_for_height(height, &self.params);
        for (i, (input, coin)) in tx.inputs.iter().zip(&inputs.spent).enumerate() {
            verify_script(&input.script_sig, &coin.output.script_pubkey, tx, i, flags, coin.output.amount).map_err(
                |e| {
                    RejectReason::consensus("mandatory-script-verify-flag-failed").with_detail(format!("input {i}: {e}"))
                },
            )?;
        }
        Ok(inputs.fee)
    }

    // ─── Operator controls ───────────────────────────────────────────

    /// Treat `hash` and its descendants as invalid, moving the tip off it.
    pub fn invalidate_block(&self, hash: &Hash256) -> Result<(), ChainError> {
        let mut state = self.lock_running()?;
        let result = self.invalidate(&mut state, hash);
        self.finish(&mut state, result)
    }

    fn invalidate(&self, state: &mut ManagerState, hash: &Hash256) -> Result<(), ChainError> {
        let height = state
            .index
            .get(hash)
            .map(|n| n.height)
            .ok_or_else(|| RejectReason::malformed("unknown-block"))?;
        if height == 0 {
            return Err(RejectReason::consensus("genesis-invalidate").into());
        }
        if let Some((_, base_height)) = state.snapshot_base {
            if height <= base_height {
                return Err(SnapshotError::Refused("block is covered by the loaded snapshot".into()).into());
            }
        }

        while state.active.chain.at_height(height) == Some(*hash) {
            self.disconnect_tip(state)?;
        }
        self.record_invalid(state, hash, RejectReason::consensus("invalidated"));
        let tip = state.active.chain.tip();
        state.index.rebuild_candidates(&tip);
        self.activate_best_chain(state)?;
        self.flush_state(state)
    }

    /// Clear invalidity on `hash`, its ancestors and descendants, and activate
    /// again.
    pub fn reconsider_block(&self, hash: &Hash256) -> Result<(), ChainError> {
        let mut state = self.lock_running()?;
        let result = self.reconsider(&mut state, hash);
        self.finish(&mut state, result)
    }

    fn reconsider(&self, state: &mut ManagerState, hash: &Hash256) -> Result<(), ChainError> {
        if !state.index.contains(hash) {
            return Err(RejectReason::malformed("unknown-block").into());
        }
        let changed = state.index.reconsider(hash);
        for h in &changed {
            state.invalid_reasons.remove(h);
        }
        info!("♻️  Reconsidered {} block(s) from [{}]", changed.len(), short(hash));
        self.activate_best_chain(state)?;
        self.flush_state(state)
    }

    /// Rebuild the coin set from genesis using the stored blocks. Holds the
    /// lock for one block at a time and stops early when `cancel` is set.
    pub fn reindex_chainstate(&self, cancel: &AtomicBool) -> Result<ReindexSummary, ChainError> {
        {
            let mut state = self.lock_running()?;
            let result = self.reset_to_genesis(&mut state);
            self.finish(&mut state, result)?;
        }

        let mut summary = ReindexSummary::default();
        loop {
            if cancel.load(Ordering::SeqCst) {
                summary.interrupted = true;
                info!("⏸️  Reindex interrupted after {} blocks", summary.connected);
                break;
            }
            let mut state = self.lock_running()?;
            let result = self.activate_steps(&mut state, Some(1));
            let (steps, done) = self.finish(&mut state, result)?;
            summary.connected += steps;
            if done {
                let tip = state.active.chain.tip();
                state.index.prune_candidates(&tip);
                info!("✅ Reindex complete: {} blocks connected", summary.connected);
                break;
            }
        }
        self.flush()?;
        Ok(summary)
    }

    fn reset_to_genesis(&self, state: &mut ManagerState) -> Result<(), ChainError> {
        if state.active.keyspace == CoinsKeyspace::Snapshot {
            return Err(SnapshotError::Refused("cannot reindex a chainstate loaded from a snapshot".into()).into());
        }
        let genesis = state.index.genesis_hash();
        let db = CoinsViewDb::new(self.store.clone(), CoinsKeyspace::Primary);
        db.wipe()?;
        db.write_best_block(&genesis)?;
        state.active.coins = CoinsViewCache::new(db);
        state.active.chain = ActiveChain::from_tip(&state.index, &genesis).ok_or_else(|| missing("genesis", &genesis))?;
        state.pending_undo.clear();
        state.readmit.clear();
        state.index.reset_script_validity();
        state.index.rebuild_candidates(&genesis);
        self.flush_state(state)?;
        info!("🔄 Coin set wiped, reconnecting {} indexed blocks from genesis", state.index.len() - 1);

        let tip = state.index.get(&genesis).map(|n| n.summary()).ok_or_else(|| missing("genesis", &genesis))?;
        self.notifications.emit(ChainEvent::TipChanged { tip });
        Ok(())
    }

    /// Feed wire-encoded blocks through [`process_block`](Self::process_block).
    /// Rejections and orphans are counted, not returned.
    pub fn import_blocks<I>(&self, blocks: I, cancel: &AtomicBool) -> Result<ImportSummary, ChainError>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let mut summary = ImportSummary::default();
        for bytes in blocks {
            if cancel.load(Ordering::SeqCst) {
                summary.interrupted = true;
                break;
            }
            match self.process_block(&bytes) {
                Ok(BlockAcceptance::AlreadyKnown) => summary.duplicates += 1,
                Ok(_) => summary.accepted += 1,
                Err(ChainError::UnknownParent(_)) => summary.orphans += 1,
                Err(ChainError::Rejected(reason)) => {
                    debug!("Import skipped a block: {}", reason);
                    summary.rejected += 1;
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            "📥 Import {}: {} accepted, {} known, {} rejected, {} orphans",
            if summary.interrupted { "interrupted" } else { "finished" },
            summary.accepted,
            summary.duplicates,
            summary.rejected,
            summary.orphans
        );
        Ok(summary)
    }

    /// [`import_blocks`](Self::import_blocks) on a background thread.
    pub fn spawn_import(
        self: &Arc<Self>,
        blocks: Vec<Vec<u8>>,
        cancel: Arc<AtomicBool>,
    ) -> JoinHandle<Result<ImportSummary, ChainError>> {
        let manager = Arc::clone(self);
        std::thread::spawn(move || manager.import_blocks(blocks, &cancel))
    }

    // ─── Snapshots ───────────────────────────────────────────────────

    /// Write the coin set at the active tip to `path`.
    pub fn export_snapshot(&self, path: &Path) -> Result<SnapshotMetadata, ChainError> {
        let file = File::create(path).map_err(SnapshotError::from)?;
        self.export_snapshot_to(BufWriter::new(file))
    }

    pub fn export_snapshot_to<W: Write>(&self, writer: W) -> Result<SnapshotMetadata, ChainError> {
        let (meta, coins) = {
            let mut state = self.lock_running()?;
            let result = self.collect_snapshot(&mut state);
            self.finish(&mut state, result)?
        };
        snapshot::write_snapshot(writer, &meta, &coins)?;
        info!(
            "📸 Exported snapshot at #{} [{}]: {} coins, digest {}",
            meta.base_height,
            short(&meta.base_hash),
            meta.coin_count,
            hex::encode(meta.digest)
        );
        Ok(meta)
    }

    fn collect_snapshot(&self, state: &mut ManagerState) -> Result<(SnapshotMetadata, Vec<(OutPoint, Coin)>), ChainError> {
        self.flush_state(state)?;
        let coins = state.active.coins.base().iter_coins()?;
        let (digest, count, _) = snapshot::utxo_digest(coins.iter().map(|(o, c)| (o, c)))?;
        let meta = SnapshotMetadata::new(
            self.params.network,
            state.active.chain.tip(),
            state.active.chain.height(),
            count,
            digest,
        );
        Ok((meta, coins))
    }

    /// Load a trusted snapshot from `path` and make it the active chainstate.
    pub fn load_snapshot(&self, path: &Path) -> Result<SnapshotMetadata, ChainError> {
        let file = File::open(path).map_err(SnapshotError::from)?;
        self.load_snapshot_from(BufReader::new(file))
    }

    pub fn load_snapshot_from<R: Read>(&self, reader: R) -> Result<SnapshotMetadata, ChainError> {
        let (meta, coins) = snapshot::read_snapshot(reader)?;
        if meta.network != self.params.network {
            return Err(SnapshotError::WrongNetwork {
                expected: self.params.network,
                found: meta.network,
            }
            .into());
        }
        let trusted = self
            .params
            .assumed_snapshot(&meta.base_hash)
            .ok_or(SnapshotError::Untrusted(meta.base_hash))?;
        if trusted.digest != meta.digest || trusted.height != meta.base_height {
            return Err(SnapshotError::DigestMismatch.into());
        }
        if trusted.coin_count != meta.coin_count {
            return Err(SnapshotError::CoinCountMismatch {
                expected: trusted.coin_count,
                found: meta.coin_count,
            }
            .into());
        }

        let mut state = self.lock_running()?;
        let result = self.activate_snapshot(&mut state, &meta, &coins);
        self.finish(&mut state, result)?;
        Ok(meta)
    }

    fn activate_snapshot(
        &self,
        state: &mut ManagerState,
        meta: &SnapshotMetadata,
        coins: &[(OutPoint, Coin)],
    ) -> Result<(), ChainError> {
        if state.active.keyspace == CoinsKeyspace::Snapshot {
            return Err(SnapshotError::Refused("a snapshot chainstate is already active".into()).into());
        }
        let base = state.index.get(&meta.base_hash).ok_or(SnapshotError::UnknownBase(meta.base_hash))?;
        if base.height != meta.base_height {
            return Err(SnapshotError::Refused(format!(
                "base header is at height {}, snapshot claims {}",
                base.height, meta.base_height
            ))
            .into());
        }
        if base.status.is_invalid() {
            return Err(SnapshotError::Refused("snapshot base is marked invalid".into()).into());
        }
        if state.active.chain.height() >= base.height {
            return Err(SnapshotError::Refused("active chain already reaches the snapshot height".into()).into());
        }

        let staged = CoinsViewDb::new(self.store.clone(), CoinsKeyspace::Snapshot);
        staged.wipe()?;
        for chunk in coins.chunks(SNAPSHOT_WRITE_CHUNK) {
            staged.write_coins(chunk)?;
        }
        let stored = staged.iter_coins()?;
        let (digest, count, _) = snapshot::utxo_digest(stored.iter().map(|(o, c)| (o, c)))?;
        if digest != meta.digest || count != meta.coin_count {
            staged.wipe()?;
            warn!("⚠️  Staged snapshot coins do not match the digest, discarded");
            return Err(SnapshotError::DigestMismatch.into());
        }
        staged.write_best_block(&meta.base_hash)?;

        self.flush_state(state)?;
        state.index.mark_assumed_valid(&meta.base_hash);
        let chain = ActiveChain::from_tip(&state.index, &meta.base_hash).ok_or_else(|| missing("snapshot base", &meta.base_hash))?;

        let mut batch = WriteBatch::new();
        self.blocks.set_active_keyspace(&mut batch, CoinsKeyspace::Snapshot)?;
        for entry in state.index.dirty_entries() {
            self.blocks.put_index_entry(&mut batch, &entry)?;
        }
        self.blocks.write(&batch)?;
        state.index.clear_dirty();

        state.active = Chainstate {
            coins: CoinsViewCache::new(staged),
            chain,
            keyspace: CoinsKeyspace::Snapshot,
        };
        state.snapshot_base = Some((meta.base_hash, meta.base_height));
        state.index.rebuild_candidates(&meta.base_hash);
        state.pending_undo.clear();
        state.readmit.clear();
        CoinsViewDb::new(self.store.clone(), CoinsKeyspace::Primary).wipe()?;
        info!(
            "📸 Loaded snapshot at #{} [{}]: {} coins",
            meta.base_height,
            short(&meta.base_hash),
            meta.coin_count
        );

        let tip = state
            .index
            .get(&meta.base_hash)
            .map(|n| n.summary())
            .ok_or_else(|| missing("snapshot base", &meta.base_hash))?;
        self.notifications.emit(ChainEvent::TipChanged { tip });
        self.activate_best_chain(state)
    }

    /// Count, total and digest of the coin set at the active tip.
    pub fn utxo_stats(&self) -> Result<UtxoStats, ChainError> {
        let mut state = self.lock_running()?;
        let result = self.collect_snapshot(&mut state).map(|(meta, coins)| UtxoStats {
            best_block: meta.base_hash,
            coin_count: meta.coin_count,
            total_amount: coins.iter().map(|(_, c)| c.output.amount as u128).sum(),
            digest: meta.digest,
        });
        self.finish(&mut state, result)
    }

    // ─── Queries ─────────────────────────────────────────────────────

    /// Unspent coin at `outpoint` as of the active tip.
    pub fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainError> {
        let state = self.lock_running()?;
        Ok(state.active.coins.get_coin(outpoint)?)
    }

    pub fn best_tip(&self) -> Result<BlockSummary, ChainError> {
        let state = self.lock_running()?;
        let tip = state.active.chain.tip();
        state.index.get(&tip).map(|n| n.summary()).ok_or_else(|| missing("tip", &tip))
    }

    /// Whether `hash` is the tip of a fully validated chain.
    pub fn is_valid_chain_tip(&self, hash: &Hash256) -> bool {
        let state = self.state.lock();
        match state.index.get(hash) {
            Some(node) => {
                node.status == BlockStatus::ScriptsValid && state.index.children_of(hash).iter().all(|child| {
                    state
                        .index
                        .get(child)
                        .map_or(true, |c| c.status != BlockStatus::ScriptsValid)
                })
            }
            None => false,
        }
    }

    pub fn block_summary(&self, hash: &Hash256) -> Option<BlockSummary> {
        self.state.lock().index.get(hash).map(|n| n.summary())
    }

    /// Hash of the active block at `height`.
    pub fn block_at_height(&self, height: u64) -> Option<Hash256> {
        self.state.lock().active.chain.at_height(height)
    }

    pub fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainError> {
        Ok(self.blocks.get_block(hash)?)
    }

    /// Every leaf of the block tree.
    pub fn tips(&self) -> Vec<BlockSummary> {
        self.state.lock().index.tips().into_iter().map(|n| n.summary()).collect()
    }

    /// Difficulty the next block on the active tip must carry.
    pub fn next_difficulty(&self) -> u32 {
        let state = self.state.lock();
        state
            .index
            .expected_difficulty(&state.active.chain.tip(), &self.params)
            .unwrap_or(self.params.initial_difficulty)
    }

    pub fn median_time_past(&self) -> u64 {
        let state = self.state.lock();
        state.index.median_time_past(&state.active.chain.tip())
    }

    pub fn reject_reason(&self, hash: &Hash256) -> Option<RejectReason> {
        self.state.lock().invalid_reasons.get(hash).cloned()
    }

    pub fn is_halted(&self) -> bool {
        self.state.lock().halted.is_some()
    }
}
