use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::script;
use crate::crypto::{self, txid};

/// A 32-byte hash used throughout the system
pub type Hash256 = [u8; 32];

/// Null hash (all zeros) used for genesis block's prev_hash and coinbase prevouts
pub const NULL_HASH: Hash256 = [0u8; 32];

/// Upper bound on any single wire object handed to the decoder.
pub const MAX_WIRE_SIZE: u64 = 8 * 1024 * 1024;

// ─── Transaction Types ───────────────────────────────────────────────

/// Reference to a previous transaction output.
///
/// Ordering is by txid then output index, which matches the byte order of the
/// persisted coin keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, vout: u32) -> Self {
        Self { txid, vout }
    }

    /// The prevout every coinbase input carries.
    pub fn null() -> Self {
        Self {
            txid: NULL_HASH,
            vout: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid == NULL_HASH && self.vout == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(self.txid), self.vout)
    }
}

/// Transaction input - spends a previous output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxInput {
    pub previous_output: OutPoint,
    /// Unlocking script (push-only)
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

/// Transaction output - creates a new spendable output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxOutput {
    pub amount: u64,
    /// Locking script
    pub script_pubkey: Vec<u8>,
}

/// A complete transaction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// Create a coinbase transaction paying `reward` to `script_pubkey`.
    ///
    /// The unlocking script starts with the block height so that coinbases at
    /// different heights never share a txid.
    pub fn new_coinbase(height: u64, reward: u64, script_pubkey: Vec<u8>, extra: &[u8]) -> Self {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                script_sig: script::coinbase_script_sig(height, extra),
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput {
                amount: reward,
                script_pubkey,
            }],
            lock_time: 0,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    /// Sum of output amounts, `None` on overflow.
    pub fn total_output(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.amount))
    }

    /// Identifier used by outpoints. Excludes unlocking scripts.
    pub fn txid(&self) -> Hash256 {
        txid::txid_v1(self)
    }

    /// Identifier covering unlocking scripts. Used for relay deduplication
    /// and for the block merkle commitment.
    pub fn wtxid(&self) -> Hash256 {
        txid::wtxid_v1(self)
    }

    pub fn size(&self) -> usize {
        bincode::serialized_size(self).unwrap_or(u64::MAX) as usize
    }
}

// ─── Block Types ─────────────────────────────────────────────────────

/// Block header
///
/// `difficulty_target` is the number of leading zero BITS required in the
/// proof-of-work hash. Each extra bit doubles the expected number of hashes,
/// so a header contributes `2^difficulty_target` units of chain work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u64,
    /// Number of leading zero bits required in the PoW hash
    pub difficulty_target: u32,
    pub nonce: u64,
}

impl BlockHeader {
    pub const ENCODED_LEN: usize = 4 + 32 + 32 + 8 + 4 + 8;

    /// Fixed little-endian encoding fed to both the id hash and the PoW hash.
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..36].copy_from_slice(&self.prev_hash);
        buf[36..68].copy_from_slice(&self.merkle_root);
        buf[68..76].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[76..80].copy_from_slice(&self.difficulty_target.to_le_bytes());
        buf[80..88].copy_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    /// Block identifier (double SHA-256 of the header encoding).
    ///
    /// The PoW hash is computed separately by the network's
    /// [`PowAlgorithm`](crate::pow::PowAlgorithm), which may be memory-hard.
    pub fn hash(&self) -> Hash256 {
        crypto::double_sha256(&self.encode())
    }
}

impl fmt::Display for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block [{}] prev={} diff={} ts={}",
            hex::encode(self.hash()),
            hex::encode(&self.prev_hash[..8]),
            self.difficulty_target,
            self.timestamp,
        )
    }
}

/// A complete block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Compute the merkle root over the block's wtxids.
    pub fn compute_merkle_root(&self) -> Hash256 {
        let leaves: Vec<Hash256> = self.transactions.iter().map(|tx| tx.wtxid()).collect();
        merkle_root(leaves)
    }

    pub fn validate_merkle_root(&self) -> bool {
        self.header.merkle_root == self.compute_merkle_root()
    }

    pub fn size(&self) -> usize {
        bincode::serialized_size(self).unwrap_or(u64::MAX) as usize
    }
}

/// Pairwise double SHA-256 tree, duplicating the last hash on odd levels.
pub fn merkle_root(mut hashes: Vec<Hash256>) -> Hash256 {
    if hashes.is_empty() {
        return NULL_HASH;
    }

    while hashes.len() > 1 {
        if hashes.len() % 2 != 0 {
            let last = hashes[hashes.len() - 1];
            hashes.push(last);
        }

        hashes = hashes
            .chunks(2)
            .map(|pair| {
                let mut combined = [0u8; 64];
                combined[..32].copy_from_slice(&pair[0]);
                combined[32..].copy_from_slice(&pair[1]);
                crypto::double_sha256(&combined)
            })
            .collect();
    }

    hashes[0]
}

// ─── Wire Encoding ───────────────────────────────────────────────────

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_WIRE_SIZE)
}

/// Encode a wire object (fixed-width integers, same layout as storage).
pub fn encode_wire<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    wire_options().serialize(value)
}

/// Decode a wire object. Trailing bytes and oversized input are rejected.
pub fn decode_wire<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    wire_options().deserialize(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::COIN;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: NULL_HASH,
            merkle_root: NULL_HASH,
            timestamp: 1_700_000_000,
            difficulty_target: 8,
            nonce: 0,
        }
    }

    #[test]
    fn test_coinbase_transaction() {
        let tx = Transaction::new_coinbase(5, 50 * COIN, vec![0x51], b"");
        assert!(tx.is_coinbase());
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.total_output(), Some(50 * COIN));
    }

    #[test]
    fn test_coinbase_txids_differ_by_height() {
        let a = Transaction::new_coinbase(1, 50 * COIN, vec![0x51], b"");
        let b = Transaction::new_coinbase(2, 50 * COIN, vec![0x51], b"");
        assert_ne!(a.txid(), b.txid());
    }

    #[test]
    fn test_txid_ignores_unlocking_script() {
        let mut tx = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::new([7u8; 32], 0),
                script_sig: vec![0x01, 0xAA],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput { amount: 10, script_pubkey: vec![0x51] }],
            lock_time: 0,
        };
        let txid = tx.txid();
        let wtxid = tx.wtxid();
        assert_ne!(txid, wtxid);

        tx.inputs[0].script_sig = vec![0x01, 0xBB];
        assert_eq!(tx.txid(), txid);
        assert_ne!(tx.wtxid(), wtxid);
    }

    #[test]
    fn test_total_output_overflow() {
        let tx = Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![
                TxOutput { amount: u64::MAX, script_pubkey: vec![] },
                TxOutput { amount: 1, script_pubkey: vec![] },
            ],
            lock_time: 0,
        };
        assert_eq!(tx.total_output(), None);
    }

    #[test]
    fn test_header_hash_changes_with_nonce() {
        let mut header = sample_header();
        let before = header.hash();
        header.nonce += 1;
        assert_ne!(before, header.hash());
    }

    #[test]
    fn test_merkle_root_single_tx() {
        let tx = Transaction::new_coinbase(0, 5_000_000_000, vec![0x51], b"");
        let block = Block {
            header: sample_header(),
            transactions: vec![tx.clone()],
        };
        assert_eq!(block.compute_merkle_root(), tx.wtxid());
    }

    #[test]
    fn test_merkle_odd_level_duplicates_last() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        assert_eq!(merkle_root(vec![a, b, c]), merkle_root(vec![a, b, c, c]));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let block = Block {
            header: sample_header(),
            transactions: vec![Transaction::new_coinbase(1, 1, vec![0x51], b"")],
        };
        let mut bytes = encode_wire(&block).unwrap();
        assert_eq!(decode_wire::<Block>(&bytes).unwrap(), block);
        bytes.push(0);
        assert!(decode_wire::<Block>(&bytes).is_err());
    }
}
