//! Consensus rules.
//!
//! Context-free checks look at a header, transaction or block on its own.
//! Contextual checks need the parent in the block index. Connecting a block
//! applies it to a UTXO view and produces the undo record that disconnecting
//! it later consumes.
//!
//! Every expected rejection comes back as a [`RejectReason`] value; only
//! storage failures and broken invariants surface as other [`ChainError`]s.
use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error};

use crate::core::block_index::{BlockIndex, BlockIndexNode};
use crate::core::checkqueue::{CheckQueue, ScriptCheck};
use crate::core::coins::{BlockUndo, Coin, CoinsView, CoinsViewCache, SpentCoin};
use crate::core::params::{ChainParams, LOCKTIME_THRESHOLD, MAX_FUTURE_BLOCK_TIME, MAX_MONEY, MAX_TX_SIZE, SEQUENCE_FINAL};
use crate::core::script::{self, ScriptFlags, MAX_SCRIPT_SIZE};
use crate::core::types::{Block, BlockHeader, OutPoint, Transaction};
use crate::error::{ChainError, RejectReason};
use crate::pow;

const MIN_COINBASE_SCRIPT: usize = 2;
const MAX_COINBASE_SCRIPT: usize = 100;

// ─── Context-free checks ─────────────────────────────────────────────

pub fn check_transaction(tx: &Transaction) -> Result<(), RejectReason> {
    if tx.inputs.is_empty() {
        return Err(RejectReason::malformed("bad-txns-vin-empty"));
    }
    if tx.outputs.is_empty() {
        return Err(RejectReason::malformed("bad-txns-vout-empty"));
    }
    if tx.size() > MAX_TX_SIZE {
        return Err(RejectReason::resource("bad-txns-oversize"));
    }

    let mut total: u64 = 0;
    for output in &tx.outputs {
        if output.amount > MAX_MONEY {
            return Err(RejectReason::consensus("bad-txns-vout-toolarge"));
        }
        total = total
            .checked_add(output.amount)
            .filter(|t| *t <= MAX_MONEY)
            .ok_or_else(|| RejectReason::consensus("bad-txns-txouttotal-toolarge"))?;
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(&input.previous_output) {
            return Err(RejectReason::consensus("bad-txns-inputs-duplicate"));
        }
        if input.script_sig.len() > MAX_SCRIPT_SIZE {
            return Err(RejectReason::resource("bad-txns-script-size"));
        }
    }

    if tx.is_coinbase() {
        let len = tx.inputs[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT..=MAX_COINBASE_SCRIPT).contains(&len) {
            return Err(RejectReason::malformed("bad-cb-length"));
        }
    } else if tx.inputs.iter().any(|i| i.previous_output.is_null()) {
        return Err(RejectReason::malformed("bad-txns-prevout-null"));
    }
    Ok(())
}

pub fn check_block_header(header: &BlockHeader, params: &ChainParams) -> Result<(), RejectReason> {
    if header.difficulty_target < params.min_difficulty || header.difficulty_target > params.max_difficulty {
        return Err(RejectReason::consensus("bad-diffbits")
            .with_detail(format!("difficulty {} outside network bounds", header.difficulty_target)));
    }
    if !pow::meets_difficulty(header, params.pow_algorithm) {
        return Err(RejectReason::consensus("high-hash"));
    }
    Ok(())
}

pub fn check_block(block: &Block, params: &ChainParams) -> Result<(), RejectReason> {
    check_block_header(&block.header, params)?;
    check_block_body(block, params)
}

/// Context-free checks of everything but the header's proof of work.
pub fn check_block_body(block: &Block, params: &ChainParams) -> Result<(), RejectReason> {
    if block.transactions.is_empty() {
        return Err(RejectReason::malformed("bad-blk-length"));
    }
    if block.transactions.len() > params.max_txs_per_block {
        return Err(RejectReason::resource("bad-blk-txcount"));
    }
    if block.size() > params.max_block_size {
        return Err(RejectReason::resource("bad-blk-size"));
    }

    if !block.validate_merkle_root() {
        return Err(RejectReason::malformed("bad-txnmrklroot"));
    }
    // Duplicating the tail of an odd level leaves the root unchanged
    let mut wtxids = HashSet::with_capacity(block.transactions.len());
    if !block.transactions.iter().all(|tx| wtxids.insert(tx.wtxid())) {
        return Err(RejectReason::malformed("bad-txns-duplicate"));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(RejectReason::consensus("bad-cb-missing"));
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(RejectReason::consensus("bad-cb-multiple"));
    }

    let mut spent = HashSet::new();
    for tx in &block.transactions {
        check_transaction(tx)?;
        if tx.is_coinbase() {
            continue;
        }
        for input in &tx.inputs {
            if !spent.insert(&input.previous_output) {
                return Err(RejectReason::consensus("bad-txns-inputs-duplicate")
                    .with_detail(format!("{} spent twice in block", input.previous_output)));
            }
        }
    }
    Ok(())
}

// ─── Contextual checks ───────────────────────────────────────────────

/// Checks of a header against its parent. `now` is the local clock in seconds.
pub fn contextual_check_header(
    header: &BlockHeader,
    parent: &BlockIndexNode,
    index: &BlockIndex,
    params: &ChainParams,
    now: u64,
) -> Result<(), RejectReason> {
    let mtp = index.median_time_past(&parent.hash);
    if header.timestamp <= mtp {
        return Err(RejectReason::consensus("time-too-old")
            .with_detail(format!("timestamp {} <= median time past {}", header.timestamp, mtp)));
    }
    if header.timestamp > now + MAX_FUTURE_BLOCK_TIME {
        return Err(RejectReason::consensus("time-too-new"));
    }

    if !params.no_retargeting {
        if let Some(expected) = index.expected_difficulty(&parent.hash, params) {
            if header.difficulty_target != expected {
                return Err(RejectReason::consensus("bad-diffbits")
                    .with_detail(format!("expected {}, got {}", expected, header.difficulty_target)));
            }
        }
    }
    Ok(())
}

pub fn contextual_check_block(
    block: &Block,
    parent: &BlockIndexNode,
    index: &BlockIndex,
    params: &ChainParams,
) -> Result<(), RejectReason> {
    let height = parent.height + 1;
    let lock_time_cutoff = if height >= params.deployments.mtp_locktime_height {
        index.median_time_past(&parent.hash)
    } else {
        block.header.timestamp
    };
    if !block.transactions.iter().all(|tx| is_final_tx(tx, height, lock_time_cutoff)) {
        return Err(RejectReason::consensus("bad-txns-nonfinal"));
    }

    if height >= params.deployments.coinbase_height_height {
        let prefix = script::coinbase_height_prefix(height);
        let starts_with_height = block
            .transactions
            .first()
            .and_then(|cb| cb.inputs.first())
            .map_or(false, |input| input.script_sig.starts_with(&prefix));
        if !starts_with_height {
            return Err(RejectReason::consensus("bad-cb-height"));
        }
    }
    Ok(())
}

/// A transaction is final once its lock time has passed, or if every input
/// opted out with a final sequence number.
pub fn is_final_tx(tx: &Transaction, height: u64, block_time: u64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let cutoff = if tx.lock_time < LOCKTIME_THRESHOLD { height } else { block_time };
    if (tx.lock_time as u64) < cutoff {
        return true;
    }
    tx.inputs.iter().all(|i| i.sequence == SEQUENCE_FINAL)
}

/// Script rules enforced for blocks at `height`.
pub fn script_flags_for_height(height: u64, params: &ChainParams) -> ScriptFlags {
    let d = &params.deployments;
    let mut flags = ScriptFlags::NONE;
    for (activation, flag) in [
        (d.strict_enc_height, ScriptFlags::STRICT_ENC),
        (d.sighash_v1_height, ScriptFlags::SIGHASH_V1),
        (d.resource_limits_height, ScriptFlags::RESOURCE_LIMITS),
        (d.checklocktime_height, ScriptFlags::CHECKLOCKTIME),
        (d.cleanstack_height, ScriptFlags::CLEANSTACK),
    ] {
        if height >= activation {
            flags |= flag;
        }
    }
    flags
}

// ─── Inputs ──────────────────────────────────────────────────────────

/// What a transaction's inputs resolve to.
#[derive(Debug, Clone)]
pub struct InputsSummary {
    pub fee: u64,
    /// Coins spent, one per input in input order
    pub spent: Vec<Coin>,
}

/// Resolve and check a non-coinbase transaction's inputs against `view`,
/// warming them into its cache. Scripts are not run here.
pub fn check_tx_inputs<V: CoinsView>(
    tx: &Transaction,
    view: &mut CoinsViewCache<V>,
    spend_height: u64,
    params: &ChainParams,
) -> Result<InputsSummary, ChainError> {
    if tx.is_coinbase() {
        return Err(RejectReason::consensus("bad-tx-coinbase").into());
    }

    let mut value_in: u64 = 0;
    let mut spent = Vec::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        let Some(coin) = view.fetch_coin(&input.previous_output)?.cloned() else {
            return Err(RejectReason::consensus("bad-txns-inputs-missingorspent")
                .with_detail(input.previous_output.to_string())
                .into());
        };
        if coin.is_coinbase && spend_height.saturating_sub(coin.height) < params.coinbase_maturity {
            return Err(RejectReason::consensus("bad-txns-premature-spend-of-coinbase")
                .with_detail(format!("coin from height {} spent at {}", coin.height, spend_height))
                .into());
        }
        value_in = value_in
            .checked_add(coin.output.amount)
            .filter(|v| coin.output.amount <= MAX_MONEY && *v <= MAX_MONEY)
            .ok_or_else(|| RejectReason::consensus("bad-txns-inputvalues-outofrange"))?;
        spent.push(coin);
    }

    let value_out = tx
        .total_output()
        .ok_or_else(|| RejectReason::consensus("bad-txns-txouttotal-toolarge"))?;
    if value_in < value_out {
        return Err(RejectReason::consensus("bad-txns-in-belowout")
            .with_detail(format!("in {} < out {}", value_in, value_out))
            .into());
    }
    Ok(InputsSummary {
        fee: value_in - value_out,
        spent,
    })
}

// ─── Connect / disconnect ────────────────────────────────────────────

/// Apply `block` at `height` to `view`.
///
/// Run this against a scratch layer: on error the view holds partial changes
/// and must be dropped.
pub fn connect_block<V: CoinsView>(
    block: &Arc<Block>,
    height: u64,
    view: &mut CoinsViewCache<V>,
    params: &ChainParams,
    queue: &CheckQueue,
) -> Result<BlockUndo, ChainError> {
    let flags = script_flags_for_height(height, params);
    let mut undo = BlockUndo::default();
    let mut fees: u64 = 0;
    let mut checks = Vec::new();

    for (tx_index, tx) in block.transactions.iter().enumerate() {
        let txid = tx.txid();
        for vout in 0..tx.outputs.len() {
            if view.have_coin(&OutPoint::new(txid, vout as u32))? {
                return Err(RejectReason::consensus("bad-txns-BIP30")
                    .with_detail(format!("tx {} overwrites an unspent output", hex::encode(txid)))
                    .into());
            }
        }

        if !tx.is_coinbase() {
            let inputs = check_tx_inputs(tx, view, height, params)?;
            fees = fees
                .checked_add(inputs.fee)
                .filter(|f| *f <= MAX_MONEY)
                .ok_or_else(|| RejectReason::consensus("bad-txns-accumulated-fee-outofrange"))?;

            for (input_index, (input, coin)) in tx.inputs.iter().zip(inputs.spent).enumerate() {
                checks.push(ScriptCheck {
                    tx_index,
                    input_index,
                    script_pubkey: coin.output.script_pubkey.clone(),
                    spent_value: coin.output.amount,
                });
                if view.spend_coin(&input.previous_output)?.is_none() {
                    error!("❌ Coin {} vanished between check and spend", input.previous_output);
                    return Err(ChainError::InternalInvariant(format!(
                        "coin {} vanished between check and spend",
                        input.previous_output
                    )));
                }
                undo.spent.push(SpentCoin {
                    outpoint: input.previous_output.clone(),
                    coin,
                });
            }
        }

        for (vout, output) in tx.outputs.iter().enumerate() {
            let coin = Coin {
                output: output.clone(),
                height,
                is_coinbase: tx.is_coinbase(),
            };
            view.add_coin(OutPoint::new(txid, vout as u32), coin, false)?;
        }
    }

    let check_count = checks.len();
    queue.verify(block, checks, flags).map_err(|failure| match failure.error {
        // Not the block's fault, and its checks did not all run
        script::ScriptError::WorkerLost => ChainError::InternalInvariant(format!(
            "script checks from tx {} input {} went unreported",
            failure.tx_index, failure.input_index
        )),
        error => RejectReason::consensus("mandatory-script-verify-flag-failed")
            .with_detail(format!("tx {} input {}: {}", failure.tx_index, failure.input_index, error))
            .into(),
    })?;

    let reward = params.block_reward(height);
    let coinbase_out = block.transactions[0].total_output().unwrap_or(u64::MAX);
    if coinbase_out > reward.saturating_add(fees) {
        return Err(RejectReason::consensus("bad-cb-amount")
            .with_detail(format!("coinbase pays {} > subsidy {} + fees {}", coinbase_out, reward, fees))
            .into());
    }

    view.set_best_block(block.hash());
    debug!(
        "🔗 Connected block #{} ({} txs, {} script checks, fees {})",
        height,
        block.transactions.len(),
        check_count,
        fees
    );
    Ok(undo)
}

/// Undo `block` on `view` using its undo record.
///
/// Any mismatch between the block, the undo record and the view means the
/// stored state is corrupt and is reported as an invariant violation.
pub fn disconnect_block<V: CoinsView>(
    block: &Block,
    undo: &BlockUndo,
    view: &mut CoinsViewCache<V>,
) -> Result<(), ChainError> {
    let expected: usize = block
        .transactions
        .iter()
        .filter(|tx| !tx.is_coinbase())
        .map(|tx| tx.inputs.len())
        .sum();
    if expected != undo.spent.len() {
        return Err(ChainError::InternalInvariant(format!(
            "undo record for {} has {} coins, block spends {}",
            hex::encode(block.hash()),
            undo.spent.len(),
            expected
        )));
    }

    let mut cursor = undo.spent.len();
    for tx in block.transactions.iter().rev() {
        let txid = tx.txid();
        for (vout, output) in tx.outputs.iter().enumerate() {
            if script::is_unspendable(&output.script_pubkey) {
                continue;
            }
            let outpoint = OutPoint::new(txid, vout as u32);
            match view.spend_coin(&outpoint)? {
                Some(coin) if coin.output == *output => {}
                _ => {
                    error!("❌ Output {} missing while disconnecting", outpoint);
                    return Err(ChainError::InternalInvariant(format!(
                        "output {outpoint} missing or altered while disconnecting"
                    )));
                }
            }
        }

        if tx.is_coinbase() {
            continue;
        }
        for input in tx.inputs.iter().rev() {
            cursor -= 1;
            let restored = &undo.spent[cursor];
            if restored.outpoint != input.previous_output {
                return Err(ChainError::InternalInvariant(format!(
                    "undo record out of order at {}",
                    input.previous_output
                )));
            }
            view.add_coin(restored.outpoint.clone(), restored.coin.clone(), true)?;
        }
    }

    view.set_best_block(block.header.prev_hash);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::coins::EmptyCoinsView;
    use crate::core::params::COIN;
    use crate::core::test_utils::{coinbase_tx, key, make_block, pay_to, regtest_params, spend};
    use crate::core::types::{TxInput, TxOutput};
    use crate::error::RejectKind;

    fn genesis_header() -> BlockHeader {
        regtest_params().genesis.header
    }

    #[test]
    fn test_check_transaction_rejects_structural_faults() {
        let k = key(1);
        let mut tx = spend(&k, &[(OutPoint::new([1u8; 32], 0), 10)], vec![pay_to(&k, 5)]);
        assert!(check_transaction(&tx).is_ok());

        let mut dup = tx.clone();
        dup.inputs.push(dup.inputs[0].clone());
        assert_eq!(check_transaction(&dup).unwrap_err().code, "bad-txns-inputs-duplicate");

        tx.outputs[0].amount = MAX_MONEY + 1;
        assert_eq!(check_transaction(&tx).unwrap_err().code, "bad-txns-vout-toolarge");

        let mut null = spend(&k, &[(OutPoint::new([1u8; 32], 0), 10)], vec![pay_to(&k, 5)]);
        null.inputs.push(TxInput { previous_output: OutPoint::null(), script_sig: vec![], sequence: 0 });
        assert_eq!(check_transaction(&null).unwrap_err().kind, RejectKind::Malformed);

        let empty = Transaction { version: 1, inputs: vec![], outputs: vec![], lock_time: 0 };
        assert_eq!(check_transaction(&empty).unwrap_err().code, "bad-txns-vin-empty");
    }

    #[test]
    fn test_coinbase_script_length_bounds() {
        let k = key(1);
        let mut cb = coinbase_tx(1, 50 * COIN, &k, b"");
        assert!(check_transaction(&cb).is_ok());
        cb.inputs[0].script_sig = vec![0x51];
        assert_eq!(check_transaction(&cb).unwrap_err().code, "bad-cb-length");
        cb.inputs[0].script_sig = vec![0x51; 101];
        assert_eq!(check_transaction(&cb).unwrap_err().code, "bad-cb-length");
    }

    #[test]
    fn test_check_block_merkle_and_duplicates() {
        let params = regtest_params();
        let k = key(2);
        let tx_a = spend(&k, &[(OutPoint::new([9u8; 32], 0), 10)], vec![pay_to(&k, 5)]);
        let tx_b = spend(&k, &[(OutPoint::new([9u8; 32], 1), 10)], vec![pay_to(&k, 5)]);
        let block = make_block(&params, &genesis_header(), 1, &k, b"a", vec![tx_a, tx_b.clone()], 10, 0);
        assert!(check_block(&block, &params).is_ok());

        let mut bad_root = block.clone();
        bad_root.header.merkle_root = [7u8; 32];
        let reason = check_block(&bad_root, &params).unwrap_err();
        assert!(reason.is_mutation());

        // Repeating the odd tail keeps the merkle root
        let mut dup = block.clone();
        dup.transactions.push(tx_b);
        assert_eq!(dup.compute_merkle_root(), block.header.merkle_root);
        let reason = check_block(&dup, &params).unwrap_err();
        assert_eq!(reason.code, "bad-txns-duplicate");
        assert!(!reason.is_permanent());
    }

    #[test]
    fn test_check_block_in_block_double_spend() {
        let params = regtest_params();
        let k = key(3);
        let prev = OutPoint::new([5u8; 32], 0);
        let a = spend(&k, &[(prev.clone(), 10)], vec![pay_to(&k, 4)]);
        let b = spend(&k, &[(prev, 10)], vec![pay_to(&k, 3)]);
        let block = make_block(&params, &genesis_header(), 1, &k, b"x", vec![a, b], 0, 0);
        let reason = check_block(&block, &params).unwrap_err();
        assert_eq!(reason.kind, RejectKind::ConsensusViolation);
        assert_eq!(reason.code, "bad-txns-inputs-duplicate");
    }

    #[test]
    fn test_check_block_coinbase_placement() {
        let params = regtest_params();
        let k = key(4);
        let mut block = make_block(&params, &genesis_header(), 1, &k, b"x", vec![], 0, 0);
        block.transactions.push(coinbase_tx(1, 1, &k, b"second"));
        block.header.merkle_root = block.compute_merkle_root();
        crate::core::test_utils::mine_header(&mut block.header, &params);
        assert_eq!(check_block(&block, &params).unwrap_err().code, "bad-cb-multiple");
    }

    #[test]
    fn test_pow_below_declared_difficulty() {
        let params = regtest_params();
        let k = key(5);
        let mut block = make_block(&params, &genesis_header(), 1, &k, b"x", vec![], 0, 12);
        assert!(check_block_header(&block.header, &params).is_ok());
        // Find a nonce that misses the target
        while pow::meets_difficulty(&block.header, params.pow_algorithm) {
            block.header.nonce += 1;
        }
        assert_eq!(check_block_header(&block.header, &params).unwrap_err().code, "high-hash");
    }

    #[test]
    fn test_is_final_tx() {
        let k = key(6);
        let mut tx = spend(&k, &[(OutPoint::new([1u8; 32], 0), 10)], vec![pay_to(&k, 5)]);
        tx.lock_time = 100;
        tx.inputs[0].sequence = 0;
        assert!(!is_final_tx(&tx, 100, 0));
        assert!(is_final_tx(&tx, 101, 0));
        tx.inputs[0].sequence = SEQUENCE_FINAL;
        assert!(is_final_tx(&tx, 1, 0));

        tx.lock_time = LOCKTIME_THRESHOLD + 10;
        tx.inputs[0].sequence = 0;
        assert!(!is_final_tx(&tx, 1_000_000, (LOCKTIME_THRESHOLD + 10) as u64));
        assert!(is_final_tx(&tx, 1, (LOCKTIME_THRESHOLD + 11) as u64));
    }

    #[test]
    fn test_script_flags_follow_activation_heights() {
        let mut params = ChainParams::main();
        params.deployments.sighash_v1_height = 10;
        let before = script_flags_for_height(9, &params);
        let after = script_flags_for_height(10, &params);
        assert!(!before.contains(ScriptFlags::SIGHASH_V1));
        assert!(after.contains(ScriptFlags::SIGHASH_V1));
        assert!(before.contains(ScriptFlags::STRICT_ENC));
        assert_eq!(script_flags_for_height(0, &regtest_params()), ScriptFlags::ALL);
    }

    #[test]
    fn test_connect_disconnect_restores_view() {
        let params = regtest_params();
        let queue = CheckQueue::new(0);
        let k = key(7);
        let mut base = CoinsViewCache::new(EmptyCoinsView);

        let b1 = Arc::new(make_block(&params, &genesis_header(), 1, &k, b"b1", vec![], 0, 0));
        connect_block(&b1, 1, &mut base, &params, &queue).unwrap();
        let cb_out = OutPoint::new(b1.transactions[0].txid(), 0);
        assert!(base.have_coin(&cb_out).unwrap());

        let reward = params.block_reward(1);
        let tx = spend(&k, &[(cb_out.clone(), reward)], vec![pay_to(&k, reward - 1_000)]);
        let b2 = Arc::new(make_block(&params, &b1.header, 2, &k, b"b2", vec![tx.clone()], 1_000, 0));

        let before: Vec<_> = [cb_out.clone(), OutPoint::new(tx.txid(), 0)]
            .iter()
            .map(|op| base.get_coin(op).unwrap())
            .collect();
        let undo = {
            let mut scratch = CoinsViewCache::new(&mut base);
            let undo = connect_block(&b2, 2, &mut scratch, &params, &queue).unwrap();
            scratch.flush().unwrap();
            undo
        };
        assert_eq!(undo.spent.len(), 1);
        assert!(!base.have_coin(&cb_out).unwrap());
        assert!(base.have_coin(&OutPoint::new(tx.txid(), 0)).unwrap());

        disconnect_block(&b2, &undo, &mut base).unwrap();
        let after: Vec<_> = [cb_out, OutPoint::new(tx.txid(), 0)]
            .iter()
            .map(|op| base.get_coin(op).unwrap())
            .collect();
        assert_eq!(before, after);
        assert_eq!(base.best_block().unwrap(), b1.hash());
    }

    #[test]
    fn test_connect_rejects_missing_input_without_side_effects() {
        let params = regtest_params();
        let queue = CheckQueue::new(0);
        let k = key(8);
        let mut base = CoinsViewCache::new(EmptyCoinsView);
        let tx = spend(&k, &[(OutPoint::new([3u8; 32], 0), 10)], vec![pay_to(&k, 5)]);
        let block = Arc::new(make_block(&params, &genesis_header(), 1, &k, b"m", vec![tx], 5, 0));

        let mut scratch = CoinsViewCache::new(&mut base);
        let err = connect_block(&block, 1, &mut scratch, &params, &queue).unwrap_err();
        assert_eq!(err.reject_reason().unwrap().code, "bad-txns-inputs-missingorspent");
        drop(scratch);
        assert_eq!(base.cache_size(), 0);
    }

    #[test]
    fn test_connect_rejects_premature_coinbase_spend() {
        let mut params = regtest_params();
        params.coinbase_maturity = 5;
        let queue = CheckQueue::new(0);
        let k = key(9);
        let mut base = CoinsViewCache::new(EmptyCoinsView);
        let b1 = Arc::new(make_block(&params, &genesis_header(), 1, &k, b"b1", vec![], 0, 0));
        connect_block(&b1, 1, &mut base, &params, &queue).unwrap();

        let reward = params.block_reward(1);
        let tx = spend(&k, &[(OutPoint::new(b1.transactions[0].txid(), 0), reward)], vec![pay_to(&k, 1)]);
        let b2 = Arc::new(make_block(&params, &b1.header, 2, &k, b"b2", vec![tx], 0, 0));
        let err = connect_block(&b2, 2, &mut CoinsViewCache::new(&mut base), &params, &queue).unwrap_err();
        assert_eq!(err.reject_reason().unwrap().code, "bad-txns-premature-spend-of-coinbase");
    }

    #[test]
    fn test_connect_rejects_excess_coinbase_and_bad_signature() {
        let params = regtest_params();
        let queue = CheckQueue::new(2);
        let k = key(10);
        let mut base = CoinsViewCache::new(EmptyCoinsView);
        let b1 = Arc::new(make_block(&params, &genesis_header(), 1, &k, b"b1", vec![], 0, 0));
        connect_block(&b1, 1, &mut base, &params, &queue).unwrap();
        let cb_out = OutPoint::new(b1.transactions[0].txid(), 0);
        let reward = params.block_reward(1);

        // Claims one more unit than subsidy plus fees
        let greedy = Arc::new(make_block(&params, &b1.header, 2, &k, b"g", vec![], 1, 0));
        let err = connect_block(&greedy, 2, &mut CoinsViewCache::new(&mut base), &params, &queue).unwrap_err();
        assert_eq!(err.reject_reason().unwrap().code, "bad-cb-amount");

        // Signed by the wrong key
        let thief = key(11);
        let tx = spend(&thief, &[(cb_out, reward)], vec![pay_to(&thief, reward)]);
        let forged = Arc::new(make_block(&params, &b1.header, 2, &thief, b"f", vec![tx], 0, 0));
        let err = connect_block(&forged, 2, &mut CoinsViewCache::new(&mut base), &params, &queue).unwrap_err();
        assert_eq!(err.reject_reason().unwrap().code, "mandatory-script-verify-flag-failed");
    }

    #[test]
    fn test_unspendable_outputs_skipped_on_connect_and_disconnect() {
        let params = regtest_params();
        let queue = CheckQueue::new(0);
        let k = key(12);
        let mut base = CoinsViewCache::new(EmptyCoinsView);
        let mut block = make_block(&params, &genesis_header(), 1, &k, b"r", vec![], 0, 0);
        block.transactions[0].outputs.push(TxOutput {
            amount: 0,
            script_pubkey: script::op_return_script(b"note"),
        });
        block.header.merkle_root = block.compute_merkle_root();
        crate::core::test_utils::mine_header(&mut block.header, &params);
        let block = Arc::new(block);

        let undo = connect_block(&block, 1, &mut base, &params, &queue).unwrap();
        assert_eq!(base.cache_size(), 1);
        disconnect_block(&block, &undo, &mut base).unwrap();
        assert_eq!(base.get_coin(&OutPoint::new(block.transactions[0].txid(), 0)).unwrap(), None);
        assert_eq!(base.best_block().unwrap(), block.header.prev_hash);
    }

    #[test]
    fn test_disconnect_with_mismatched_undo_is_invariant() {
        let params = regtest_params();
        let k = key(13);
        let mut base = CoinsViewCache::new(EmptyCoinsView);
        let tx = spend(&k, &[(OutPoint::new([3u8; 32], 0), 10)], vec![pay_to(&k, 5)]);
        let block = make_block(&params, &genesis_header(), 1, &k, b"u", vec![tx], 5, 0);
        let err = disconnect_block(&block, &BlockUndo::default(), &mut base).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(base.cache_size(), 0);
    }
}
