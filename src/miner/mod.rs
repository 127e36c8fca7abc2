//! Block templates on the active tip, and the nonce search that turns a
//! template into a block.
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::core::chainstate::ChainstateManager;
use crate::core::types::{Block, BlockHeader, Transaction, NULL_HASH};
use crate::error::ChainError;
use crate::mempool::Mempool;
use crate::pow::{self, PowAlgorithm};

/// Room left in a template for the coinbase transaction.
const COINBASE_RESERVE: usize = 1_000;

/// How many nonces to try between timestamp refreshes
const TIMESTAMP_REFRESH_INTERVAL: u64 = 10_000;

/// Mining configuration
#[derive(Debug, Clone)]
pub struct MinerConfig {
    /// Locking script of the coinbase output
    pub payout_script: Vec<u8>,
    /// Extra bytes after the height in the coinbase script
    pub coinbase_tag: Vec<u8>,
    /// Number of mining threads
    pub threads: usize,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            payout_script: Vec::new(),
            coinbase_tag: b"forgekernel".to_vec(),
            threads: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub block: Block,
    pub height: u64,
    pub fees: u64,
}

/// Build a block on the active tip with as many pooled transactions as still
/// validate, highest fee rate first.
pub fn create_block_template(
    manager: &ChainstateManager,
    mempool: Option<&Mempool>,
    config: &MinerConfig,
) -> Result<BlockTemplate, ChainError> {
    let params = manager.params();
    let tip = manager.best_tip()?;
    let height = tip.height + 1;

    // Wall clock, but always past the median of recent blocks
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let timestamp = now.max(manager.median_time_past() + 1);

    let mut total_fees: u64 = 0;
    let mut selected: Vec<Transaction> = Vec::new();
    let mut block_size = COINBASE_RESERVE;
    let mut claimed = HashSet::new();

    let pending = mempool.map(|pool| pool.get_pending()).unwrap_or_default();
    for tx in pending {
        let tx_size = tx.size();
        if block_size + tx_size > params.max_block_size {
            continue;
        }
        if selected.len() + 1 >= params.max_txs_per_block {
            break;
        }
        if tx.inputs.iter().any(|i| claimed.contains(&i.previous_output)) {
            continue;
        }
        // Only transactions whose inputs are confirmed; pooled parents are not chained
        let fee = match manager.check_transaction_for_mempool(&tx) {
            Ok(fee) => fee,
            Err(e) => {
                debug!("Leaving tx [{}] out of template: {}", hex::encode(&tx.txid()[..8]), e);
                continue;
            }
        };
        claimed.extend(tx.inputs.iter().map(|i| i.previous_output.clone()));
        total_fees += fee;
        block_size += tx_size;
        selected.push(tx);
    }

    let coinbase = Transaction::new_coinbase(
        height,
        params.block_reward(height) + total_fees,
        config.payout_script.clone(),
        &config.coinbase_tag,
    );
    let mut transactions = vec![coinbase];
    transactions.extend(selected);

    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_hash: tip.hash,
            merkle_root: NULL_HASH,
            timestamp,
            difficulty_target: manager.next_difficulty(),
            nonce: 0,
        },
        transactions,
    };
    block.header.merkle_root = block.compute_merkle_root();

    Ok(BlockTemplate {
        block,
        height,
        fees: total_fees,
    })
}

/// Result of a mining attempt
#[derive(Debug)]
pub enum MineResult {
    Found(Block),
    Cancelled,
}

fn expected_hashes(difficulty: u32) -> f64 {
    2f64.powi(difficulty as i32)
}

/// Mine a block (single-threaded)
pub fn mine_block(mut block: Block, algorithm: PowAlgorithm, stop: &AtomicBool) -> MineResult {
    let mut hashes: u64 = 0;
    let start = std::time::Instant::now();
    let difficulty = block.header.difficulty_target;

    info!(
        "⛏️  Mining on [{}] (difficulty: {} bits, ~{:.0} expected hashes, {})...",
        hex::encode(&block.header.prev_hash[..8]),
        difficulty,
        expected_hashes(difficulty),
        algorithm.name(),
    );

    loop {
        if stop.load(Ordering::Relaxed) {
            return MineResult::Cancelled;
        }

        if pow::meets_difficulty(&block.header, algorithm) {
            let elapsed = start.elapsed().as_secs_f64();
            let hashrate = if elapsed > 0.0 { hashes as f64 / elapsed } else { 0.0 };
            info!(
                "⛏️  Block mined! nonce={} hash={} time={:.2}s hashrate={:.1} H/s",
                block.header.nonce,
                hex::encode(block.header.hash()),
                elapsed,
                hashrate,
            );
            return MineResult::Found(block);
        }

        block.header.nonce = block.header.nonce.wrapping_add(1);
        hashes += 1;

        if hashes % TIMESTAMP_REFRESH_INTERVAL == 0 {
            debug!("  {} hashes, {:.0}s elapsed", hashes, start.elapsed().as_secs_f64());
            // Stay inside the future-time window on long searches
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            block.header.timestamp = block.header.timestamp.max(now);
        }
    }
}

/// Multi-threaded mining (splits nonce space across threads)
pub fn mine_block_parallel(block: Block, algorithm: PowAlgorithm, threads: usize, stop: Arc<AtomicBool>) -> MineResult {
    if threads <= 1 {
        return mine_block(block, algorithm, &stop);
    }

    let difficulty = block.header.difficulty_target;
    info!(
        "⛏️  Mining on [{}] (difficulty: {} bits, ~{:.0} expected hashes, {} threads)...",
        hex::encode(&block.header.prev_hash[..8]),
        difficulty,
        expected_hashes(difficulty),
        threads,
    );

    let nonce_range_size = u64::MAX / threads as u64;
    let (tx, rx) = std::sync::mpsc::channel();
    let start = std::time::Instant::now();
    // Private flag so a find stops the siblings without touching the caller's
    let found = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let mut thread_block = block.clone();
            let stop = stop.clone();
            let found = found.clone();
            let tx = tx.clone();
            let start_nonce = i as u64 * nonce_range_size;

            std::thread::spawn(move || {
                let mut nonce = start_nonce;
                let end_nonce = start_nonce + nonce_range_size;

                while nonce < end_nonce {
                    if stop.load(Ordering::Relaxed) || found.load(Ordering::Relaxed) {
                        return;
                    }

                    thread_block.header.nonce = nonce;
                    if pow::meets_difficulty(&thread_block.header, algorithm) {
                        found.store(true, Ordering::Relaxed);
                        let _ = tx.send(thread_block);
                        return;
                    }

                    nonce += 1;
                }
            })
        })
        .collect();

    drop(tx);

    let result = rx.recv();
    found.store(true, Ordering::Relaxed);
    for handle in handles {
        let _ = handle.join();
    }

    match result {
        Ok(mined_block) => {
            info!(
                "⛏️  Block mined! hash={} time={:.2}s",
                hex::encode(mined_block.header.hash()),
                start.elapsed().as_secs_f64(),
            );
            MineResult::Found(mined_block)
        }
        Err(_) => MineResult::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chainstate::BlockAcceptance;
    use crate::core::script::p2pkh_script;
    use crate::core::test_utils::{key, pay_to, spend, TestChain};
    use crate::core::types::{encode_wire, OutPoint};

    fn config_for(chain: &TestChain) -> MinerConfig {
        MinerConfig {
            payout_script: p2pkh_script(&chain.miner.pubkey_hash()),
            ..MinerConfig::default()
        }
    }

    #[test]
    fn test_create_block_template() {
        let chain = TestChain::new();
        let template = create_block_template(&chain.manager, None, &config_for(&chain)).unwrap();

        assert_eq!(template.height, 1);
        assert_eq!(template.block.header.prev_hash, chain.params.genesis_hash());
        assert_eq!(template.block.transactions.len(), 1);
        assert!(template.block.transactions[0].is_coinbase());
        assert_eq!(template.fees, 0);
        assert!(template.block.validate_merkle_root());
    }

    #[test]
    fn test_mined_template_is_accepted() {
        let chain = TestChain::new();
        let template = create_block_template(&chain.manager, None, &config_for(&chain)).unwrap();
        let stop = AtomicBool::new(false);

        match mine_block(template.block, chain.params.pow_algorithm, &stop) {
            MineResult::Found(block) => {
                let bytes = encode_wire(&block).unwrap();
                assert_eq!(chain.manager.process_block(&bytes).unwrap(), BlockAcceptance::ActiveChain);
            }
            MineResult::Cancelled => panic!("should not be cancelled"),
        }
    }

    #[test]
    fn test_template_takes_valid_pool_transactions() {
        let chain = TestChain::new();
        let b1 = chain.mine_on_tip(b"b1");
        let c = OutPoint::new(b1.transactions[0].txid(), 0);
        let value = chain.manager.get_coin(&c).unwrap().unwrap().output.amount;

        let pool = Mempool::new(10, 0);
        let good = spend(&chain.miner, &[(c.clone(), value)], vec![pay_to(&key(3), value - 700)]);
        let missing = spend(&chain.miner, &[(OutPoint::new([4u8; 32], 1), 10)], vec![pay_to(&key(3), 5)]);
        pool.add_with_fee(good.clone(), 700).unwrap();
        pool.add_with_fee(missing, 5).unwrap();

        let template = create_block_template(&chain.manager, Some(&pool), &config_for(&chain)).unwrap();
        assert_eq!(template.fees, 700);
        assert_eq!(template.block.transactions.len(), 2);
        assert_eq!(template.block.transactions[1], good);
        let reward = chain.params.block_reward(2);
        assert_eq!(template.block.transactions[0].outputs[0].amount, reward + 700);

        let stop = Arc::new(AtomicBool::new(false));
        let MineResult::Found(block) = mine_block_parallel(template.block, chain.params.pow_algorithm, 2, stop) else {
            panic!("should not be cancelled");
        };
        assert_eq!(chain.submit(&block), BlockAcceptance::ActiveChain);
    }

    #[test]
    fn test_stop_flag_cancels() {
        let chain = TestChain::new();
        let mut template = create_block_template(&chain.manager, None, &config_for(&chain)).unwrap();
        template.block.header.difficulty_target = 255;
        let stop = AtomicBool::new(true);
        assert!(matches!(
            mine_block(template.block, chain.params.pow_algorithm, &stop),
            MineResult::Cancelled
        ));
    }
}
