//! What the chainstate needs from a transaction pool, and a fee-rate sorted
//! pool implementing it.
use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::core::types::{Hash256, OutPoint, Transaction};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("transaction {} already in pool", hex::encode(.0))]
    Duplicate(Hash256),
    #[error("pool full ({0} transactions)")]
    Full(usize),
    #[error("fee {fee} below minimum {min}")]
    FeeTooLow { fee: u64, min: u64 },
    #[error("input {0} already spent by a pooled transaction")]
    Conflict(OutPoint),
}

/// Calls the chainstate makes into the pool while it holds its lock.
pub trait MempoolInterface: Send + Sync {
    /// Drop pooled transactions spending any of `spent`. Called after a block
    /// connects with every outpoint the block consumed.
    fn remove_conflicting(&self, spent: &[OutPoint]);

    /// Drop pooled transactions spending any of `vanished`. Called after a
    /// block disconnects with every outpoint the block had created.
    fn remove_spending_vanished(&self, vanished: &[OutPoint]);

    /// Admit a transaction the chainstate already validated against its tip.
    fn try_accept_loose(&self, tx: &Transaction, fee: u64) -> Result<(), PolicyError>;
}

// ─── Mempool (Fee-Rate Sorted) ──────────────────────────────────────

struct MempoolEntry {
    tx: Transaction,
    fee: u64,
    /// Fee rate in base units per byte (fee / tx_size)
    fee_rate: f64,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<Hash256, MempoolEntry>,
    /// Which pooled transaction spends each outpoint
    spent_by: HashMap<OutPoint, Hash256>,
}

impl PoolState {
    /// Remove every transaction spending one of `outpoints`. Returns how many went.
    fn remove_spenders(&mut self, outpoints: &[OutPoint]) -> usize {
        let doomed: Vec<Hash256> = outpoints.iter().filter_map(|o| self.spent_by.get(o).copied()).collect();
        for txid in &doomed {
            self.remove(txid);
        }
        doomed.len()
    }

    fn remove(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        for input in &entry.tx.inputs {
            self.spent_by.remove(&input.previous_output);
        }
        Some(entry)
    }
}

pub struct Mempool {
    state: Mutex<PoolState>,
    max_size: usize,
    min_fee: u64,
}

impl Mempool {
    pub fn new(max_size: usize, min_fee: u64) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            max_size,
            min_fee,
        }
    }

    /// Add a pre-validated transaction with a known fee
    pub fn add_with_fee(&self, tx: Transaction, fee: u64) -> Result<Hash256, PolicyError> {
        let txid = tx.txid();
        let mut state = self.state.lock();
        if state.entries.contains_key(&txid) {
            return Err(PolicyError::Duplicate(txid));
        }
        if state.entries.len() >= self.max_size {
            return Err(PolicyError::Full(self.max_size));
        }
        if fee < self.min_fee {
            return Err(PolicyError::FeeTooLow { fee, min: self.min_fee });
        }
        if let Some(input) = tx.inputs.iter().find(|i| state.spent_by.contains_key(&i.previous_output)) {
            return Err(PolicyError::Conflict(input.previous_output.clone()));
        }

        for input in &tx.inputs {
            state.spent_by.insert(input.previous_output.clone(), txid);
        }
        let size = tx.size();
        let fee_rate = if size > 0 { fee as f64 / size as f64 } else { 0.0 };
        state.entries.insert(txid, MempoolEntry { tx, fee, fee_rate });
        Ok(txid)
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.state.lock().entries.contains_key(txid)
    }

    pub fn remove(&self, txid: &Hash256) -> Option<Transaction> {
        self.state.lock().remove(txid).map(|e| e.tx)
    }

    /// Get pending transactions sorted by fee rate (highest first)
    pub fn get_pending(&self) -> Vec<Transaction> {
        self.get_pending_with_fees().into_iter().map(|(tx, _, _)| tx).collect()
    }

    pub fn get_pending_with_fees(&self) -> Vec<(Transaction, u64, f64)> {
        let state = self.state.lock();
        let mut entries: Vec<&MempoolEntry> = state.entries.values().collect();
        entries.sort_by(|a, b| b.fee_rate.partial_cmp(&a.fee_rate).unwrap_or(std::cmp::Ordering::Equal));
        entries.into_iter().map(|e| (e.tx.clone(), e.fee, e.fee_rate)).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }
}

impl MempoolInterface for Mempool {
    fn remove_conflicting(&self, spent: &[OutPoint]) {
        let removed = self.state.lock().remove_spenders(spent);
        if removed > 0 {
            debug!("🧹 Removed {} pooled transaction(s) spending confirmed outputs", removed);
        }
    }

    fn remove_spending_vanished(&self, vanished: &[OutPoint]) {
        let removed = self.state.lock().remove_spenders(vanished);
        if removed > 0 {
            debug!("🧹 Removed {} pooled transaction(s) spending disconnected outputs", removed);
        }
    }

    fn try_accept_loose(&self, tx: &Transaction, fee: u64) -> Result<(), PolicyError> {
        self.add_with_fee(tx.clone(), fee).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{TxInput, TxOutput};

    fn tx(prev: u8, outputs: usize) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::new([prev; 32], 0),
                script_sig: vec![],
                sequence: u32::MAX,
            }],
            outputs: (0..outputs)
                .map(|_| TxOutput { amount: 10, script_pubkey: vec![0x51] })
                .collect(),
            lock_time: 0,
        }
    }

    #[test]
    fn test_sorted_by_fee_rate() {
        let pool = Mempool::new(10, 0);
        pool.add_with_fee(tx(1, 1), 100).unwrap();
        pool.add_with_fee(tx(2, 1), 900).unwrap();
        pool.add_with_fee(tx(3, 1), 500).unwrap();
        let fees: Vec<u64> = pool.get_pending_with_fees().iter().map(|(_, f, _)| *f).collect();
        assert_eq!(fees, vec![900, 500, 100]);
    }

    #[test]
    fn test_policy_rejections() {
        let pool = Mempool::new(2, 50);
        assert_eq!(pool.add_with_fee(tx(1, 1), 10), Err(PolicyError::FeeTooLow { fee: 10, min: 50 }));
        let first = pool.add_with_fee(tx(1, 1), 60).unwrap();
        assert_eq!(pool.add_with_fee(tx(1, 1), 60), Err(PolicyError::Duplicate(first)));
        assert!(matches!(pool.add_with_fee(tx(1, 2), 60), Err(PolicyError::Conflict(_))));
        pool.add_with_fee(tx(2, 1), 60).unwrap();
        assert_eq!(pool.add_with_fee(tx(3, 1), 60), Err(PolicyError::Full(2)));
    }

    #[test]
    fn test_remove_conflicting_frees_outpoints() {
        let pool = Mempool::new(10, 0);
        pool.add_with_fee(tx(1, 1), 1).unwrap();
        pool.add_with_fee(tx(2, 1), 1).unwrap();
        pool.remove_conflicting(&[OutPoint::new([1u8; 32], 0), OutPoint::new([9u8; 32], 0)]);
        assert_eq!(pool.len(), 1);
        // The outpoint is free again
        pool.try_accept_loose(&tx(1, 2), 1).unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_remove_spending_vanished() {
        let pool = Mempool::new(10, 0);
        let keep = pool.add_with_fee(tx(1, 1), 1).unwrap();
        let gone = pool.add_with_fee(tx(2, 1), 1).unwrap();
        pool.remove_spending_vanished(&[OutPoint::new([2u8; 32], 0), OutPoint::new([2u8; 32], 1)]);
        assert!(pool.contains(&keep));
        assert!(!pool.contains(&gone));
    }
}
