//! Error types shared across the engine.
use std::fmt;

use thiserror::Error;

use crate::core::coins::CoinsError;
use crate::core::snapshot::SnapshotError;
use crate::core::types::Hash256;
use crate::mempool::PolicyError;
use crate::storage::StorageError;

/// Category of an expected rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectKind {
    /// Fails structural checks
    Malformed,
    /// Fails a consensus rule (double spend, bad script, bad reward, ...)
    ConsensusViolation,
    /// Exceeds a size or count limit
    ResourceExhausted,
}

/// Why a block, header or transaction was refused.
///
/// `code` is a short stable identifier such as `bad-txns-inputs-missingorspent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectReason {
    pub kind: RejectKind,
    pub code: &'static str,
    pub detail: Option<String>,
}

/// Codes raised when a block's body does not match its header. The header may
/// still belong to a valid block, so these never mark the hash invalid.
const MUTATION_CODES: &[&str] = &["bad-txnmrklroot", "bad-txns-duplicate"];

/// Codes that may stop being true later.
const TEMPORARY_CODES: &[&str] = &["time-too-new"];

impl RejectReason {
    pub fn malformed(code: &'static str) -> Self {
        Self { kind: RejectKind::Malformed, code, detail: None }
    }

    pub fn consensus(code: &'static str) -> Self {
        Self { kind: RejectKind::ConsensusViolation, code, detail: None }
    }

    pub fn resource(code: &'static str) -> Self {
        Self { kind: RejectKind::ResourceExhausted, code, detail: None }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Reason recorded for descendants of an invalid block.
    pub fn invalid_ancestor() -> Self {
        Self::consensus("bad-prevblk")
    }

    pub fn is_mutation(&self) -> bool {
        MUTATION_CODES.contains(&self.code)
    }

    /// Whether the block can be remembered as permanently invalid.
    pub fn is_permanent(&self) -> bool {
        !self.is_mutation() && !TEMPORARY_CODES.contains(&self.code)
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({:?}: {})", self.code, self.kind, detail),
            None => write!(f, "{} ({:?})", self.code, self.kind),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rejected: {0}")]
    Rejected(RejectReason),
    #[error("unknown parent block {}", hex::encode(.0))]
    UnknownParent(Hash256),
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// An impossible state was reached. The manager halts.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
    #[error("mempool policy: {0}")]
    Policy(#[from] PolicyError),
    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("chainstate halted: {0}")]
    Halted(String),
}

impl ChainError {
    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match self {
            ChainError::Rejected(reason) => Some(reason),
            _ => None,
        }
    }

    /// Errors after which continuing could split the chain.
    pub fn is_fatal(&self) -> bool {
        match self {
            ChainError::InternalInvariant(_) => true,
            ChainError::Storage(e) => !e.is_transient(),
            _ => false,
        }
    }
}

impl From<RejectReason> for ChainError {
    fn from(reason: RejectReason) -> Self {
        ChainError::Rejected(reason)
    }
}

impl From<CoinsError> for ChainError {
    fn from(e: CoinsError) -> Self {
        match e {
            CoinsError::Storage(e) => ChainError::Storage(e),
            CoinsError::Invariant(msg) => ChainError::InternalInvariant(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_reasons_not_permanent() {
        assert!(RejectReason::malformed("bad-txnmrklroot").is_mutation());
        assert!(!RejectReason::malformed("bad-txnmrklroot").is_permanent());
        assert!(!RejectReason::consensus("time-too-new").is_permanent());
        assert!(RejectReason::consensus("bad-cb-amount").is_permanent());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ChainError::InternalInvariant("x".into()).is_fatal());
        assert!(!ChainError::Rejected(RejectReason::consensus("x")).is_fatal());
        let transient = StorageError::Backend { message: "busy".into(), transient: true };
        assert!(!ChainError::Storage(transient).is_fatal());
        assert!(ChainError::Storage(StorageError::Corruption("bad".into())).is_fatal());
    }

    #[test]
    fn test_display_includes_detail() {
        let reason = RejectReason::consensus("bad-txns-in-belowout").with_detail("in 5 < out 6");
        assert_eq!(reason.to_string(), "bad-txns-in-belowout (ConsensusViolation: in 5 < out 6)");
    }
}
