use crate::core::types::{Hash256, Transaction};
use crate::crypto::double_sha256;

/// Canonical encoding for TXID that EXCLUDES script_sig (unlocking data),
/// except on the null prevout of a coinbase where the unlocking script carries
/// the block height and must keep coinbase txids unique.
///
/// v1 encoding:
/// TAG || version || inputs(outpoint+sequence) || outputs(amount+script_pubkey) || lock_time
pub fn txid_v1(tx: &Transaction) -> Hash256 {
    encode(tx, b"EQF_TXID_V1", false)
}

/// WTXID includes script_sig on every input.
/// Used for relay uniqueness and as the merkle leaf.
pub fn wtxid_v1(tx: &Transaction) -> Hash256 {
    encode(tx, b"EQF_WTXID_V1", true)
}

fn encode(tx: &Transaction, tag: &[u8], with_unlocking: bool) -> Hash256 {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(tag);

    buf.extend_from_slice(&tx.version.to_le_bytes());

    buf.extend_from_slice(&(tx.inputs.len() as u32).to_le_bytes());
    for i in &tx.inputs {
        buf.extend_from_slice(&i.previous_output.txid);
        buf.extend_from_slice(&i.previous_output.vout.to_le_bytes());
        buf.extend_from_slice(&i.sequence.to_le_bytes());
        if with_unlocking || i.previous_output.is_null() {
            buf.extend_from_slice(&(i.script_sig.len() as u32).to_le_bytes());
            buf.extend_from_slice(&i.script_sig);
        }
    }

    buf.extend_from_slice(&(tx.outputs.len() as u32).to_le_bytes());
    for o in &tx.outputs {
        buf.extend_from_slice(&o.amount.to_le_bytes());
        buf.extend_from_slice(&(o.script_pubkey.len() as u32).to_le_bytes());
        buf.extend_from_slice(&o.script_pubkey);
    }

    buf.extend_from_slice(&tx.lock_time.to_le_bytes());
    double_sha256(&buf)
}
