//! Validation and chainstate engine for the EquiForge UTXO chain.
//!
//! The crate decides whether blocks and transactions are acceptable, keeps the
//! authoritative unspent-output set, and follows the most-work valid chain.
//! Networking, wallets and RPC live elsewhere and talk to this crate through
//! [`core::chainstate::ChainstateManager`].

pub mod config;
pub mod core;
pub mod crypto;
pub mod error;
pub mod index;
pub mod mempool;
pub mod miner;
pub mod pow;
pub mod storage;

pub use crate::core::chainstate::{BlockAcceptance, ChainstateManager, ManagerOptions};
pub use crate::error::{ChainError, RejectKind, RejectReason};
