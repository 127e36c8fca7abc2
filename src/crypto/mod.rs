//! Cryptographic primitives for EquiForge.
//!
//! EquiForge uses **Ed25519** signatures for transaction authorization and
//! double SHA-256 for identifiers and the merkle commitment.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::core::types::{Hash256, Transaction};

pub mod txid;

/// Holds an Ed25519 signing key and its verifying key.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self { signing_key, verifying_key }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        let verifying_key = signing_key.verifying_key();
        Self { signing_key, verifying_key }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Hash committed to by P2PKH locking scripts for this key.
    pub fn pubkey_hash(&self) -> Hash256 {
        pubkey_hash(&self.public_key_bytes())
    }

    /// Sign a 32-byte hash.
    pub fn sign_hash(&self, hash: &Hash256) -> [u8; 64] {
        self.signing_key.sign(hash).to_bytes()
    }
}

/// Verify an Ed25519 signature. Expects a 32-byte pubkey and a 64-byte signature.
pub fn verify_signature(pubkey: &[u8], msg: &[u8], signature: &[u8]) -> bool {
    let Ok(pubkey) = <&[u8; 32]>::try_from(pubkey) else {
        return false;
    };
    let Ok(signature) = <&[u8; 64]>::try_from(signature) else {
        return false;
    };
    let Ok(vk) = VerifyingKey::from_bytes(pubkey) else {
        return false;
    };
    vk.verify(msg, &Signature::from_bytes(signature)).is_ok()
}

pub fn sha256(data: &[u8]) -> Hash256 {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

pub fn double_sha256(data: &[u8]) -> Hash256 {
    sha256(&sha256(data))
}

/// Deterministic "pubkey hash": double-SHA256(pubkey), which is what the
/// `OP_HASH256` step of a P2PKH script recomputes.
pub fn pubkey_hash(pubkey: &[u8]) -> Hash256 {
    double_sha256(pubkey)
}

/// Signature hash algorithm version selected by the script flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SighashVersion {
    /// Original algorithm, does not commit to the amount being spent
    V0,
    /// Commits to the spent amount
    V1,
}

/// Canonical signing hash for a transaction input.
///
/// Explicit byte encoding with domain separation. `script_code` is the locking
/// script of the output being spent; `spent_value` is only committed by v1.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    spent_value: u64,
    version: SighashVersion,
) -> Hash256 {
    let tag: &[u8] = match version {
        SighashVersion::V0 => b"EQF_TXSIG_V0",
        SighashVersion::V1 => b"EQF_TXSIG_V1",
    };

    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(tag);
    buf.extend_from_slice(&tx.version.to_le_bytes());

    buf.extend_from_slice(&(tx.inputs.len() as u32).to_le_bytes());
    for input in &tx.inputs {
        buf.extend_from_slice(&input.previous_output.txid);
        buf.extend_from_slice(&input.previous_output.vout.to_le_bytes());
        buf.extend_from_slice(&input.sequence.to_le_bytes());
    }

    buf.extend_from_slice(&(input_index as u32).to_le_bytes());
    buf.extend_from_slice(&(script_code.len() as u32).to_le_bytes());
    buf.extend_from_slice(script_code);
    if version == SighashVersion::V1 {
        buf.extend_from_slice(&spent_value.to_le_bytes());
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
