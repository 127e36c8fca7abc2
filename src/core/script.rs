//! Script interpreter for EquiForge.
//!
//! Scripts decode into a closed set of [`Instruction`]s and run on a stack of
//! byte strings. The standard locking script is P2PKH-like:
//!
//! script_pubkey: OP_DUP OP_HASH256 <pubkey_hash32> OP_EQUALVERIFY OP_CHECKSIG
//! script_sig:    <sig64> <pubkey32>
//!
//! Historical rule tightenings are switched on per block height through
//! [`ScriptFlags`].
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::params::{LOCKTIME_THRESHOLD, SEQUENCE_FINAL};
use crate::core::types::{Hash256, Transaction};
use crate::crypto::{self, SighashVersion};

pub const MAX_SCRIPT_SIZE: usize = 10_000;
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;
pub const MAX_OPS_PER_SCRIPT: usize = 201;
pub const MAX_STACK_SIZE: usize = 1000;

/// Numeric operands are at most 4 bytes, lock-time operands 5.
const MAX_NUM_SIZE: usize = 4;
const MAX_LOCKTIME_NUM_SIZE: usize = 5;

// ─── Opcode bytes ────────────────────────────────────────────────────

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_NOP: u8 = 0x61;
pub const OP_IF: u8 = 0x63;
pub const OP_NOTIF: u8 = 0x64;
pub const OP_ELSE: u8 = 0x67;
pub const OP_ENDIF: u8 = 0x68;
pub const OP_VERIFY: u8 = 0x69;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DROP: u8 = 0x75;
pub const OP_DUP: u8 = 0x76;
pub const OP_SWAP: u8 = 0x7c;
pub const OP_SIZE: u8 = 0x82;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_1ADD: u8 = 0x8b;
pub const OP_NOT: u8 = 0x91;
pub const OP_ADD: u8 = 0x93;
pub const OP_SUB: u8 = 0x94;
pub const OP_NUMEQUAL: u8 = 0x9c;
pub const OP_LESSTHAN: u8 = 0x9f;
pub const OP_GREATERTHAN: u8 = 0xa0;
pub const OP_SHA256: u8 = 0xa8;
/// Double SHA-256, matching the 32-byte pubkey hash
pub const OP_HASH256: u8 = 0xaa;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;

// ─── Flags ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct ScriptFlags(u32);

impl ScriptFlags {
    pub const NONE: Self = Self(0);
    /// Signature and key encodings must be exact; a failing non-empty signature is an error
    pub const STRICT_ENC: Self = Self(1 << 0);
    /// Signature hash commits to the spent amount
    pub const SIGHASH_V1: Self = Self(1 << 1);
    /// Op count, stack depth and element size caps
    pub const RESOURCE_LIMITS: Self = Self(1 << 2);
    /// OP_CHECKLOCKTIMEVERIFY is enforced instead of acting as a NOP
    pub const CHECKLOCKTIME: Self = Self(1 << 3);
    /// Exactly one stack element may remain
    pub const CLEANSTACK: Self = Self(1 << 4);

    pub const ALL: Self = Self(0b1_1111);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ScriptFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ScriptFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("script exceeds {MAX_SCRIPT_SIZE} bytes")]
    ScriptSize,
    #[error("push runs past end of script")]
    BadPush,
    #[error("push exceeds {MAX_SCRIPT_ELEMENT_SIZE} bytes")]
    PushSize,
    #[error("more than {MAX_OPS_PER_SCRIPT} operations")]
    OpCount,
    #[error("stack exceeds {MAX_STACK_SIZE} elements")]
    StackSize,
    #[error("invalid opcode 0x{0:02x}")]
    BadOpcode(u8),
    #[error("OP_RETURN executed")]
    OpReturn,
    #[error("unbalanced conditional")]
    UnbalancedConditional,
    #[error("operation on empty stack")]
    InvalidStackOperation,
    #[error("OP_VERIFY failed")]
    Verify,
    #[error("OP_EQUALVERIFY failed")]
    EqualVerify,
    #[error("OP_CHECKSIGVERIFY failed")]
    CheckSigVerify,
    #[error("numeric operand out of range")]
    NumOverflow,
    #[error("non-canonical signature encoding")]
    SigEncoding,
    #[error("non-canonical public key encoding")]
    PubkeyEncoding,
    #[error("signature check failed with non-empty signature")]
    NullFail,
    #[error("negative lock time")]
    NegativeLockTime,
    #[error("lock time requirement not satisfied")]
    UnsatisfiedLockTime,
    #[error("unlocking script is not push-only")]
    SigPushOnly,
    #[error("stack not clean after execution")]
    CleanStack,
    #[error("script evaluated to false")]
    EvalFalse,
    #[error("input index out of range")]
    InputIndex,
    /// A verification worker exited without reporting its checks.
    #[error("script check worker lost before reporting")]
    WorkerLost,
}

// ─── Instructions ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Nop,
    If,
    NotIf,
    Else,
    EndIf,
    Verify,
    Return,
    Drop,
    Dup,
    Swap,
    Size,
    Equal,
    EqualVerify,
    Add1,
    Not,
    Add,
    Sub,
    NumEqual,
    LessThan,
    GreaterThan,
    Sha256,
    Hash256,
    CheckSig,
    CheckSigVerify,
    CheckLockTimeVerify,
    Invalid(u8),
}

impl Opcode {
    fn from_byte(byte: u8) -> Self {
        match byte {
            OP_NOP => Opcode::Nop,
            OP_IF => Opcode::If,
            OP_NOTIF => Opcode::NotIf,
            OP_ELSE => Opcode::Else,
            OP_ENDIF => Opcode::EndIf,
            OP_VERIFY => Opcode::Verify,
            OP_RETURN => Opcode::Return,
            OP_DROP => Opcode::Drop,
            OP_DUP => Opcode::Dup,
            OP_SWAP => Opcode::Swap,
            OP_SIZE => Opcode::Size,
            OP_EQUAL => Opcode::Equal,
            OP_EQUALVERIFY => Opcode::EqualVerify,
            OP_1ADD => Opcode::Add1,
            OP_NOT => Opcode::Not,
            OP_ADD => Opcode::Add,
            OP_SUB => Opcode::Sub,
            OP_NUMEQUAL => Opcode::NumEqual,
            OP_LESSTHAN => Opcode::LessThan,
            OP_GREATERTHAN => Opcode::GreaterThan,
            OP_SHA256 => Opcode::Sha256,
            OP_HASH256 => Opcode::Hash256,
            OP_CHECKSIG => Opcode::CheckSig,
            OP_CHECKSIGVERIFY => Opcode::CheckSigVerify,
            OP_CHECKLOCKTIMEVERIFY => Opcode::CheckLockTimeVerify,
            other => Opcode::Invalid(other),
        }
    }

    fn is_conditional(self) -> bool {
        matches!(self, Opcode::If | Opcode::NotIf | Opcode::Else | Opcode::EndIf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Push(Vec<u8>),
    Op(Opcode),
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Push(data) => write!(f, "<{}>", hex::encode(data)),
            Instruction::Op(op) => write!(f, "{:?}", op),
        }
    }
}

/// Decode script bytes into instructions.
pub fn parse_script(script: &[u8]) -> Result<Vec<Instruction>, ScriptError> {
    let mut out = Vec::new();
    let mut pc = 0usize;

    while pc < script.len() {
        let byte = script[pc];
        pc += 1;

        let push_len = match byte {
            OP_0 => Some(0),
            0x01..=0x4b => Some(byte as usize),
            OP_PUSHDATA1 => {
                let len = *script.get(pc).ok_or(ScriptError::BadPush)? as usize;
                pc += 1;
                Some(len)
            }
            OP_PUSHDATA2 => {
                let bytes = script.get(pc..pc + 2).ok_or(ScriptError::BadPush)?;
                pc += 2;
                Some(u16::from_le_bytes([bytes[0], bytes[1]]) as usize)
            }
            _ => None,
        };

        if let Some(len) = push_len {
            let data = script.get(pc..pc + len).ok_or(ScriptError::BadPush)?;
            pc += len;
            out.push(Instruction::Push(data.to_vec()));
            continue;
        }

        let ins = match byte {
            OP_1NEGATE => Instruction::Push(encode_num(-1)),
            OP_1..=OP_16 => Instruction::Push(encode_num((byte - OP_1 + 1) as i64)),
            _ => Instruction::Op(Opcode::from_byte(byte)),
        };
        out.push(ins);
    }

    Ok(out)
}

// ─── Stack value coercions ───────────────────────────────────────────

/// Little-endian sign-magnitude encoding, minimal length.
pub fn encode_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut out = Vec::with_capacity(9);
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let last = out.len() - 1;
    if out[last] & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        out[last] |= 0x80;
    }
    out
}

pub fn decode_num(bytes: &[u8], max_len: usize) -> Result<i64, ScriptError> {
    if bytes.len() > max_len {
        return Err(ScriptError::NumOverflow);
    }
    let Some((&last, _)) = bytes.split_last() else {
        return Ok(0);
    };
    let mut result: i64 = 0;
    for (i, b) in bytes.iter().enumerate() {
        result |= (*b as i64) << (8 * i);
    }
    if last & 0x80 != 0 {
        let sign_bit = 0x80i64 << (8 * (bytes.len() - 1));
        return Ok(-(result & !sign_bit));
    }
    Ok(result)
}

/// Any non-zero byte is true, except a lone sign bit in the last byte (negative zero).
pub fn cast_to_bool(bytes: &[u8]) -> bool {
    for (i, b) in bytes.iter().enumerate() {
        if *b != 0 {
            return !(i == bytes.len() - 1 && *b == 0x80);
        }
    }
    false
}

fn bool_bytes(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

// ─── Interpreter ─────────────────────────────────────────────────────

struct Interpreter<'a> {
    tx: &'a Transaction,
    input_index: usize,
    flags: ScriptFlags,
    spent_value: u64,
    script_code: &'a [u8],
    stack: Vec<Vec<u8>>,
}

impl<'a> Interpreter<'a> {
    fn pop(&mut self) -> Result<Vec<u8>, ScriptError> {
        self.stack.pop().ok_or(ScriptError::InvalidStackOperation)
    }

    fn top(&self) -> Result<&Vec<u8>, ScriptError> {
        self.stack.last().ok_or(ScriptError::InvalidStackOperation)
    }

    fn pop_num(&mut self) -> Result<i64, ScriptError> {
        let bytes = self.pop()?;
        decode_num(&bytes, MAX_NUM_SIZE)
    }

    fn execute(&mut self, instructions: &[Instruction]) -> Result<(), ScriptError> {
        let limits = self.flags.contains(ScriptFlags::RESOURCE_LIMITS);
        let mut exec: Vec<bool> = Vec::new();
        let mut op_count = 0usize;

        for ins in instructions {
            let executing = !exec.contains(&false);

            match ins {
                Instruction::Push(data) => {
                    if limits && data.len() > MAX_SCRIPT_ELEMENT_SIZE {
                        return Err(ScriptError::PushSize);
                    }
                    if executing {
                        self.stack.push(data.clone());
                    }
                }
                Instruction::Op(op) => {
                    op_count += 1;
                    if limits && op_count > MAX_OPS_PER_SCRIPT {
                        return Err(ScriptError::OpCount);
                    }
                    if let Opcode::Invalid(byte) = op {
                        if executing {
                            return Err(ScriptError::BadOpcode(*byte));
                        }
                    } else if op.is_conditional() {
                        self.conditional(*op, executing, &mut exec)?;
                    } else if executing {
                        self.step(*op)?;
                    }
                }
            }

            if limits && self.stack.len() > MAX_STACK_SIZE {
                return Err(ScriptError::StackSize);
            }
        }

        if !exec.is_empty() {
            return Err(ScriptError::UnbalancedConditional);
        }
        Ok(())
    }

    fn conditional(&mut self, op: Opcode, executing: bool, exec: &mut Vec<bool>) -> Result<(), ScriptError> {
        match op {
            Opcode::If | Opcode::NotIf => {
                let mut value = false;
                if executing {
                    let top = self.stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                    value = cast_to_bool(&top);
                    if op == Opcode::NotIf {
                        value = !value;
                    }
                }
                exec.push(value);
            }
            Opcode::Else => {
                let last = exec.last_mut().ok_or(ScriptError::UnbalancedConditional)?;
                *last = !*last;
            }
            Opcode::EndIf => {
                exec.pop().ok_or(ScriptError::UnbalancedConditional)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn step(&mut self, op: Opcode) -> Result<(), ScriptError> {
        match op {
            Opcode::Nop => {}
            Opcode::Verify => {
                if !cast_to_bool(&self.pop()?) {
                    return Err(ScriptError::Verify);
                }
            }
            Opcode::Return => return Err(ScriptError::OpReturn),
            Opcode::Drop => {
                self.pop()?;
            }
            Opcode::Dup => {
                let top = self.top()?.clone();
                self.stack.push(top);
            }
            Opcode::Swap => {
                let n = self.stack.len();
                if n < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                self.stack.swap(n - 1, n - 2);
            }
            Opcode::Size => {
                let len = self.top()?.len() as i64;
                self.stack.push(encode_num(len));
            }
            Opcode::Equal | Opcode::EqualVerify => {
                let a = self.pop()?;
                let b = self.pop()?;
                if op == Opcode::EqualVerify {
                    if a != b {
                        return Err(ScriptError::EqualVerify);
                    }
                } else {
                    self.stack.push(bool_bytes(a == b));
                }
            }
            Opcode::Add1 => {
                let n = self.pop_num()?;
                self.stack.push(encode_num(n + 1));
            }
            Opcode::Not => {
                let n = self.pop_num()?;
                self.stack.push(bool_bytes(n == 0));
            }
            Opcode::Add | Opcode::Sub | Opcode::NumEqual | Opcode::LessThan | Opcode::GreaterThan => {
                let b = self.pop_num()?;
                let a = self.pop_num()?;
                let result = match op {
                    Opcode::Add => encode_num(a + b),
                    Opcode::Sub => encode_num(a - b),
                    Opcode::NumEqual => bool_bytes(a == b),
                    Opcode::LessThan => bool_bytes(a < b),
                    _ => bool_bytes(a > b),
                };
                self.stack.push(result);
            }
            Opcode::Sha256 => {
                let data = self.pop()?;
                self.stack.push(crypto::sha256(&data).to_vec());
            }
            Opcode::Hash256 => {
                let data = self.pop()?;
                self.stack.push(crypto::double_sha256(&data).to_vec());
            }
            Opcode::CheckSig | Opcode::CheckSigVerify => {
                let pubkey = self.pop()?;
                let sig = self.pop()?;
                let ok = self.check_sig(&sig, &pubkey)?;
                if op == Opcode::CheckSigVerify {
                    if !ok {
                        return Err(ScriptError::CheckSigVerify);
                    }
                } else {
                    self.stack.push(bool_bytes(ok));
                }
            }
            Opcode::CheckLockTimeVerify => {
                if self.flags.contains(ScriptFlags::CHECKLOCKTIME) {
                    let lock = decode_num(self.top()?, MAX_LOCKTIME_NUM_SIZE)?;
                    if lock < 0 {
                        return Err(ScriptError::NegativeLockTime);
                    }
                    if !self.check_lock_time(lock) {
                        return Err(ScriptError::UnsatisfiedLockTime);
                    }
                }
            }
            Opcode::If | Opcode::NotIf | Opcode::Else | Opcode::EndIf | Opcode::Invalid(_) => {}
        }
        Ok(())
    }

    fn check_sig(&self, sig: &[u8], pubkey: &[u8]) -> Result<bool, ScriptError> {
        if sig.is_empty() {
            return Ok(false);
        }
        let strict = self.flags.contains(ScriptFlags::STRICT_ENC);
        if sig.len() != 64 {
            return if strict { Err(ScriptError::SigEncoding) } else { Ok(false) };
        }
        if pubkey.len() != 32 {
            return if strict { Err(ScriptError::PubkeyEncoding) } else { Ok(false) };
        }

        let version = if self.flags.contains(ScriptFlags::SIGHASH_V1) {
            SighashVersion::V1
        } else {
            SighashVersion::V0
        };
        let sighash = crypto::signature_hash(self.tx, self.input_index, self.script_code, self.spent_value, version);
        let ok = crypto::verify_signature(pubkey, &sighash, sig);
        if !ok && strict {
            return Err(ScriptError::NullFail);
        }
        Ok(ok)
    }

    fn check_lock_time(&self, lock: i64) -> bool {
        let tx_lock = self.tx.lock_time as i64;
        let threshold = LOCKTIME_THRESHOLD as i64;
        let same_kind = (tx_lock < threshold && lock < threshold) || (tx_lock >= threshold && lock >= threshold);
        if !same_kind || lock > tx_lock {
            return false;
        }
        // A final input would let the transaction bypass its own lock time
        self.tx.inputs[self.input_index].sequence != SEQUENCE_FINAL
    }
}

/// Run `script_sig` then `script_pubkey` for input `input_index` of `tx`.
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    tx: &Transaction,
    input_index: usize,
    flags: ScriptFlags,
    spent_value: u64,
) -> Result<(), ScriptError> {
    if input_index >= tx.inputs.len() {
        return Err(ScriptError::InputIndex);
    }
    if script_sig.len() > MAX_SCRIPT_SIZE || script_pubkey.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }

    let unlocking = parse_script(script_sig)?;
    if unlocking.iter().any(|ins| matches!(ins, Instruction::Op(_))) {
        return Err(ScriptError::SigPushOnly);
    }
    let locking = parse_script(script_pubkey)?;

    let mut interp = Interpreter {
        tx,
        input_index,
        flags,
        spent_value,
        script_code: script_pubkey,
        stack: Vec::new(),
    };
    interp.execute(&unlocking)?;
    interp.execute(&locking)?;

    match interp.stack.last() {
        Some(top) if cast_to_bool(top) => {}
        _ => return Err(ScriptError::EvalFalse),
    }
    if flags.contains(ScriptFlags::CLEANSTACK) && interp.stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }
    Ok(())
}

// ─── Builders ────────────────────────────────────────────────────────

/// Append a minimal push of `data`.
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0 => script.push(OP_0),
        len @ 1..=0x4b => script.push(len as u8),
        len @ 0x4c..=0xff => {
            script.push(OP_PUSHDATA1);
            script.push(len as u8);
        }
        len => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(len as u16).to_le_bytes());
        }
    }
    script.extend_from_slice(data);
}

/// Standard locking script for a 32-byte pubkey hash.
pub fn p2pkh_script(pubkey_hash: &Hash256) -> Vec<u8> {
    let mut s = Vec::with_capacity(37);
    s.push(OP_DUP);
    s.push(OP_HASH256);
    push_data(&mut s, pubkey_hash);
    s.push(OP_EQUALVERIFY);
    s.push(OP_CHECKSIG);
    s
}

/// Unlocking script for a P2PKH output.
pub fn p2pkh_script_sig(sig64: &[u8; 64], pubkey32: &[u8; 32]) -> Vec<u8> {
    let mut s = Vec::with_capacity(98);
    push_data(&mut s, sig64);
    push_data(&mut s, pubkey32);
    s
}

/// Provably unspendable data carrier.
pub fn op_return_script(data: &[u8]) -> Vec<u8> {
    let mut s = vec![OP_RETURN];
    push_data(&mut s, data);
    s
}

/// Coinbase unlocking script: the height push, then arbitrary extra data.
pub fn coinbase_script_sig(height: u64, extra: &[u8]) -> Vec<u8> {
    let mut s = coinbase_height_prefix(height);
    if !extra.is_empty() {
        push_data(&mut s, &extra[..extra.len().min(MAX_SCRIPT_ELEMENT_SIZE)]);
    }
    if s.len() < 2 {
        s.push(OP_0);
    }
    s
}

/// Serialized height every coinbase unlocking script must begin with.
pub fn coinbase_height_prefix(height: u64) -> Vec<u8> {
    let mut s = Vec::with_capacity(10);
    push_data(&mut s, &encode_num(height as i64));
    s
}

/// Outputs that can never be spent and so never enter the UTXO set.
pub fn is_unspendable(script_pubkey: &[u8]) -> bool {
    script_pubkey.first() == Some(&OP_RETURN) || script_pubkey.len() > MAX_SCRIPT_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{OutPoint, TxInput, TxOutput};
    use crate::crypto::Keypair;

    const VALUE: u64 = 5_000;

    fn spending_tx(lock_time: u32, sequence: u32) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::new([4u8; 32], 0),
                script_sig: vec![],
                sequence,
            }],
            outputs: vec![TxOutput { amount: 4_000, script_pubkey: vec![OP_1] }],
            lock_time,
        }
    }

    fn signed_p2pkh(kp: &Keypair, flags: ScriptFlags) -> (Transaction, Vec<u8>) {
        let mut tx = spending_tx(0, SEQUENCE_FINAL);
        let lock = p2pkh_script(&kp.pubkey_hash());
        let version = if flags.contains(ScriptFlags::SIGHASH_V1) { SighashVersion::V1 } else { SighashVersion::V0 };
        let sighash = crypto::signature_hash(&tx, 0, &lock, VALUE, version);
        tx.inputs[0].script_sig = p2pkh_script_sig(&kp.sign_hash(&sighash), &kp.public_key_bytes());
        (tx, lock)
    }

    fn run(tx: &Transaction, lock: &[u8], flags: ScriptFlags) -> Result<(), ScriptError> {
        verify_script(&tx.inputs[0].script_sig, lock, tx, 0, flags, VALUE)
    }

    #[test]
    fn test_p2pkh_valid() {
        let kp = Keypair::generate();
        let (tx, lock) = signed_p2pkh(&kp, ScriptFlags::ALL);
        assert_eq!(run(&tx, &lock, ScriptFlags::ALL), Ok(()));
    }

    #[test]
    fn test_p2pkh_wrong_key() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let (tx, _) = signed_p2pkh(&kp, ScriptFlags::ALL);
        let lock = p2pkh_script(&other.pubkey_hash());
        assert_eq!(run(&tx, &lock, ScriptFlags::ALL), Err(ScriptError::EqualVerify));
    }

    #[test]
    fn test_v1_signature_binds_amount() {
        let kp = Keypair::generate();
        let (tx, lock) = signed_p2pkh(&kp, ScriptFlags::ALL);
        let result = verify_script(&tx.inputs[0].script_sig, &lock, &tx, 0, ScriptFlags::ALL, VALUE + 1);
        assert_eq!(result, Err(ScriptError::NullFail));
    }

    #[test]
    fn test_bad_signature_strict_vs_lax() {
        let kp = Keypair::generate();
        let (mut tx, lock) = signed_p2pkh(&kp, ScriptFlags::NONE);
        // Flip a byte inside the signature push
        tx.inputs[0].script_sig[5] ^= 0x01;
        assert_eq!(run(&tx, &lock, ScriptFlags::NONE), Err(ScriptError::EvalFalse));
        assert_eq!(run(&tx, &lock, ScriptFlags::STRICT_ENC), Err(ScriptError::NullFail));
    }

    #[test]
    fn test_short_signature_encoding() {
        let kp = Keypair::generate();
        let tx = spending_tx(0, SEQUENCE_FINAL);
        let lock = vec![OP_CHECKSIG];
        let mut sig = Vec::new();
        push_data(&mut sig, &[1u8; 10]);
        push_data(&mut sig, &kp.public_key_bytes());
        let result = verify_script(&sig, &lock, &tx, 0, ScriptFlags::STRICT_ENC, VALUE);
        assert_eq!(result, Err(ScriptError::SigEncoding));
        let result = verify_script(&sig, &lock, &tx, 0, ScriptFlags::NONE, VALUE);
        assert_eq!(result, Err(ScriptError::EvalFalse));
    }

    #[test]
    fn test_unlocking_must_be_push_only() {
        let tx = spending_tx(0, SEQUENCE_FINAL);
        let result = verify_script(&[OP_1, OP_DUP], &[OP_DROP], &tx, 0, ScriptFlags::NONE, VALUE);
        assert_eq!(result, Err(ScriptError::SigPushOnly));
    }

    #[test]
    fn test_if_else_branches() {
        let tx = spending_tx(0, SEQUENCE_FINAL);
        let lock = [OP_IF, OP_1, OP_ELSE, OP_0, OP_ENDIF];
        assert_eq!(verify_script(&[OP_1], &lock, &tx, 0, ScriptFlags::ALL, 0), Ok(()));
        assert_eq!(verify_script(&[OP_0], &lock, &tx, 0, ScriptFlags::ALL, 0), Err(ScriptError::EvalFalse));
        assert_eq!(
            verify_script(&[OP_1], &[OP_IF, OP_1], &tx, 0, ScriptFlags::ALL, 0),
            Err(ScriptError::UnbalancedConditional)
        );
    }

    #[test]
    fn test_invalid_opcode_only_fails_when_executed() {
        let tx = spending_tx(0, SEQUENCE_FINAL);
        let lock = [OP_0, OP_IF, 0xff, OP_ENDIF, OP_1];
        assert_eq!(verify_script(&[], &lock, &tx, 0, ScriptFlags::ALL, 0), Ok(()));
        assert_eq!(verify_script(&[], &[0xff], &tx, 0, ScriptFlags::ALL, 0), Err(ScriptError::BadOpcode(0xff)));
    }

    #[test]
    fn test_arithmetic() {
        let tx = spending_tx(0, SEQUENCE_FINAL);
        let lock = [OP_ADD, 0x01, 0x05, OP_NUMEQUAL];
        assert_eq!(verify_script(&[0x01, 0x02, 0x01, 0x03], &lock, &tx, 0, ScriptFlags::ALL, 0), Ok(()));
        let lock = [OP_SUB, OP_1NEGATE, OP_NUMEQUAL];
        assert_eq!(verify_script(&[OP_1, 0x01, 0x02], &lock, &tx, 0, ScriptFlags::ALL, 0), Ok(()));
    }

    #[test]
    fn test_cleanstack() {
        let tx = spending_tx(0, SEQUENCE_FINAL);
        assert_eq!(verify_script(&[OP_1, OP_1], &[OP_NOP], &tx, 0, ScriptFlags::NONE, 0), Ok(()));
        assert_eq!(
            verify_script(&[OP_1, OP_1], &[OP_NOP], &tx, 0, ScriptFlags::CLEANSTACK, 0),
            Err(ScriptError::CleanStack)
        );
    }

    #[test]
    fn test_resource_limits() {
        let tx = spending_tx(0, SEQUENCE_FINAL);
        let lock = vec![OP_NOP; MAX_OPS_PER_SCRIPT + 1];
        assert_eq!(verify_script(&[OP_1], &lock, &tx, 0, ScriptFlags::NONE, 0), Ok(()));
        assert_eq!(
            verify_script(&[OP_1], &lock, &tx, 0, ScriptFlags::RESOURCE_LIMITS, 0),
            Err(ScriptError::OpCount)
        );

        let mut sig = Vec::new();
        push_data(&mut sig, &[1u8; MAX_SCRIPT_ELEMENT_SIZE + 1]);
        assert_eq!(
            verify_script(&sig, &[OP_NOP], &tx, 0, ScriptFlags::RESOURCE_LIMITS, 0),
            Err(ScriptError::PushSize)
        );
    }

    #[test]
    fn test_checklocktimeverify() {
        let mut lock = Vec::new();
        push_data(&mut lock, &encode_num(100));
        lock.push(OP_CHECKLOCKTIMEVERIFY);
        lock.push(OP_DROP);
        lock.push(OP_1);

        let mature = spending_tx(150, 0);
        let early = spending_tx(50, 0);
        let final_seq = spending_tx(150, SEQUENCE_FINAL);

        assert_eq!(verify_script(&[], &lock, &mature, 0, ScriptFlags::CHECKLOCKTIME, 0), Ok(()));
        assert_eq!(
            verify_script(&[], &lock, &early, 0, ScriptFlags::CHECKLOCKTIME, 0),
            Err(ScriptError::UnsatisfiedLockTime)
        );
        assert_eq!(
            verify_script(&[], &lock, &final_seq, 0, ScriptFlags::CHECKLOCKTIME, 0),
            Err(ScriptError::UnsatisfiedLockTime)
        );
        // Without the flag the opcode is a NOP
        assert_eq!(verify_script(&[], &lock, &early, 0, ScriptFlags::NONE, 0), Ok(()));
    }

    #[test]
    fn test_num_encoding() {
        for v in [0i64, 1, -1, 127, 128, -128, 255, 256, 32767, -32768, 1 << 30] {
            assert_eq!(decode_num(&encode_num(v), 8).unwrap(), v);
        }
        assert_eq!(encode_num(128), vec![0x80, 0x00]);
        assert_eq!(encode_num(-1), vec![0x81]);
        assert_eq!(decode_num(&[1, 2, 3, 4, 5], 4), Err(ScriptError::NumOverflow));
    }

    #[test]
    fn test_cast_to_bool() {
        assert!(!cast_to_bool(&[]));
        assert!(!cast_to_bool(&[0, 0]));
        assert!(!cast_to_bool(&[0, 0x80]));
        assert!(cast_to_bool(&[0x80, 0]));
        assert!(cast_to_bool(&[1]));
    }

    #[test]
    fn test_truncated_push() {
        assert_eq!(parse_script(&[0x05, 1, 2]), Err(ScriptError::BadPush));
        assert_eq!(parse_script(&[OP_PUSHDATA1]), Err(ScriptError::BadPush));
    }

    #[test]
    fn test_coinbase_height_prefix() {
        let sig = coinbase_script_sig(300, b"pool");
        assert!(sig.starts_with(&coinbase_height_prefix(300)));
        assert!(sig.len() >= 2);
        assert!(coinbase_script_sig(0, b"").len() >= 2);
    }

    #[test]
    fn test_unspendable() {
        assert!(is_unspendable(&op_return_script(b"hello")));
        assert!(!is_unspendable(&p2pkh_script(&[1u8; 32])));
    }
}
