/// EquiForge Chain Parameters
/// All consensus-critical constants and the per-network parameter sets live here.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core::script;
use crate::core::types::{Block, BlockHeader, Hash256, Transaction, NULL_HASH};
use crate::pow::PowAlgorithm;

/// Base unit denomination (like satoshis for Bitcoin)
pub const COIN: u64 = 100_000_000;

/// Maximum amount any output, transaction or block may carry.
/// 42,000,000 coins * 100,000,000 units per coin
pub const MAX_MONEY: u64 = 42_000_000 * COIN;

/// Maximum block size in bytes (4 MB)
pub const MAX_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Maximum transactions per block
pub const MAX_TXS_PER_BLOCK: usize = 10_000;

/// Maximum serialized transaction size in bytes (1 MB)
pub const MAX_TX_SIZE: usize = 1024 * 1024;

/// How far ahead of local time a header timestamp may be (2 hours)
pub const MAX_FUTURE_BLOCK_TIME: u64 = 7200;

/// Number of previous blocks whose median timestamp bounds a new header
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Lock times below this are heights, at or above it are unix timestamps
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Input sequence that opts out of lock-time enforcement
pub const SEQUENCE_FINAL: u32 = u32::MAX;

/// Genesis block timestamp (2025-01-01 00:00:00 UTC)
pub const GENESIS_TIMESTAMP: u64 = 1735689600;

/// Target block time in seconds (90 seconds = 1.5 minutes)
pub const TARGET_BLOCK_TIME: u64 = 90;

/// Subsidy of the first blocks on main and test networks: 10 coins
pub const INITIAL_BLOCK_REWARD: u64 = 10 * COIN;

/// Halving interval: roughly every 6 years at 90 second blocks.
/// 10 coins * 2,100,000 blocks * 2 bounds the total subsidy at `MAX_MONEY`.
pub const HALVING_INTERVAL: u64 = 2_100_000;

/// Coinbase maturity (blocks before mined coins can be spent)
pub const COINBASE_MATURITY: u64 = 100;

/// Minimum transaction fee in base units accepted by the reference mempool
pub const MIN_TX_FEE: u64 = 1000; // 0.00001 EQF

// ─── Networks ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Main,
    Test,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Main => "main",
            Network::Test => "test",
            Network::Regtest => "regtest",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" | "mainnet" => Ok(Network::Main),
            "test" | "testnet" => Ok(Network::Test),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network '{other}' (expected main, test or regtest)")),
        }
    }
}

/// Heights at which each historical rule tightening switches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployments {
    pub strict_enc_height: u64,
    pub sighash_v1_height: u64,
    pub resource_limits_height: u64,
    pub checklocktime_height: u64,
    pub cleanstack_height: u64,
    /// Lock-time cutoff switches from block timestamp to median time past
    pub mtp_locktime_height: u64,
    /// Coinbase unlocking script must begin with the block height
    pub coinbase_height_height: u64,
}

impl Deployments {
    /// Every rule active from the first block.
    pub fn all_active() -> Self {
        Self {
            strict_enc_height: 0,
            sighash_v1_height: 0,
            resource_limits_height: 0,
            checklocktime_height: 0,
            cleanstack_height: 0,
            mtp_locktime_height: 0,
            coinbase_height_height: 0,
        }
    }
}

/// A UTXO snapshot this network trusts enough to load without replaying history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssumedSnapshot {
    pub height: u64,
    pub base_hash: Hash256,
    pub digest: Hash256,
    pub coin_count: u64,
}

/// Everything that differs between networks.
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network: Network,
    pub genesis: Block,
    pub pow_algorithm: PowAlgorithm,
    pub initial_difficulty: u32,
    pub min_difficulty: u32,
    pub max_difficulty: u32,
    /// Skip the LWMA expectation check (regtest)
    pub no_retargeting: bool,
    pub target_block_time: u64,
    pub initial_block_reward: u64,
    pub halving_interval: u64,
    pub coinbase_maturity: u64,
    pub max_block_size: usize,
    pub max_txs_per_block: usize,
    pub deployments: Deployments,
    pub assumed_snapshots: Vec<AssumedSnapshot>,
}

impl ChainParams {
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Main => Self::main(),
            Network::Test => Self::testnet(),
            Network::Regtest => Self::regtest(),
        }
    }

    pub fn main() -> Self {
        let initial_difficulty = 8;
        Self {
            network: Network::Main,
            genesis: create_genesis_block(GENESIS_TIMESTAMP, initial_difficulty, b"EquiForge mainnet genesis"),
            pow_algorithm: PowAlgorithm::EquihashX,
            initial_difficulty,
            min_difficulty: 4,
            max_difficulty: 200,
            no_retargeting: false,
            target_block_time: TARGET_BLOCK_TIME,
            initial_block_reward: INITIAL_BLOCK_REWARD,
            halving_interval: HALVING_INTERVAL,
            coinbase_maturity: COINBASE_MATURITY,
            max_block_size: MAX_BLOCK_SIZE,
            max_txs_per_block: MAX_TXS_PER_BLOCK,
            deployments: Deployments {
                strict_enc_height: 0,
                sighash_v1_height: 20_000,
                resource_limits_height: 0,
                checklocktime_height: 40_000,
                cleanstack_height: 60_000,
                mtp_locktime_height: 40_000,
                coinbase_height_height: 0,
            },
            assumed_snapshots: Vec::new(),
        }
    }

    pub fn testnet() -> Self {
        let initial_difficulty = 6;
        Self {
            network: Network::Test,
            genesis: create_genesis_block(GENESIS_TIMESTAMP, initial_difficulty, b"EquiForge testnet genesis"),
            pow_algorithm: PowAlgorithm::EquihashX,
            initial_difficulty,
            min_difficulty: 4,
            max_difficulty: 200,
            no_retargeting: false,
            target_block_time: TARGET_BLOCK_TIME,
            initial_block_reward: INITIAL_BLOCK_REWARD,
            halving_interval: HALVING_INTERVAL,
            coinbase_maturity: COINBASE_MATURITY,
            max_block_size: MAX_BLOCK_SIZE,
            max_txs_per_block: MAX_TXS_PER_BLOCK,
            deployments: Deployments {
                strict_enc_height: 0,
                sighash_v1_height: 500,
                resource_limits_height: 0,
                checklocktime_height: 1_000,
                cleanstack_height: 1_500,
                mtp_locktime_height: 1_000,
                coinbase_height_height: 0,
            },
            assumed_snapshots: Vec::new(),
        }
    }

    /// Local testing network: cheap SHA256d proof of work, no retargeting,
    /// every rule active from the start.
    pub fn regtest() -> Self {
        Self {
            network: Network::Regtest,
            genesis: create_genesis_block(GENESIS_TIMESTAMP, 0, b"EquiForge regtest genesis"),
            pow_algorithm: PowAlgorithm::Sha256d,
            initial_difficulty: 0,
            min_difficulty: 0,
            max_difficulty: 255,
            no_retargeting: true,
            target_block_time: TARGET_BLOCK_TIME,
            initial_block_reward: 50 * COIN,
            halving_interval: 150,
            coinbase_maturity: COINBASE_MATURITY,
            max_block_size: MAX_BLOCK_SIZE,
            max_txs_per_block: MAX_TXS_PER_BLOCK,
            deployments: Deployments::all_active(),
            assumed_snapshots: Vec::new(),
        }
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis.hash()
    }

    /// Block subsidy at a given height
    pub fn block_reward(&self, height: u64) -> u64 {
        if self.halving_interval == 0 {
            return self.initial_block_reward;
        }
        let halvings = height / self.halving_interval;
        if halvings >= 64 {
            return 0;
        }
        self.initial_block_reward >> halvings
    }

    pub fn assumed_snapshot(&self, base_hash: &Hash256) -> Option<&AssumedSnapshot> {
        self.assumed_snapshots.iter().find(|s| &s.base_hash == base_hash)
    }
}

/// Build the genesis block. Its single output pays the community fund key
/// hash and never enters the UTXO set.
fn create_genesis_block(timestamp: u64, difficulty_target: u32, message: &[u8]) -> Block {
    let coinbase = Transaction::new_coinbase(
        0,
        50 * COIN,
        script::p2pkh_script(&[0xCF; 32]),
        message,
    );
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_hash: NULL_HASH,
            merkle_root: NULL_HASH,
            timestamp,
            difficulty_target,
            nonce: 0,
        },
        transactions: vec![coinbase],
    };
    block.header.merkle_root = block.compute_merkle_root();
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_reward() {
        let params = ChainParams::main();
        assert_eq!(params.block_reward(0), 10 * COIN);
        assert_eq!(params.block_reward(HALVING_INTERVAL - 1), 10 * COIN);
        // Regtest keeps its own short schedule
        assert_eq!(ChainParams::regtest().block_reward(0), 50 * COIN);
    }

    #[test]
    fn test_halvings() {
        let params = ChainParams::main();
        assert_eq!(params.block_reward(HALVING_INTERVAL), 5 * COIN);
        assert_eq!(params.block_reward(HALVING_INTERVAL * 2), 2 * COIN + COIN / 2);
        assert_eq!(params.block_reward(HALVING_INTERVAL * 64), 0);
    }

    #[test]
    fn test_total_supply_below_max_money() {
        let params = ChainParams::main();
        let mut total: u64 = 0;
        let mut height: u64 = 0;
        loop {
            let reward = params.block_reward(height);
            if reward == 0 {
                break;
            }
            let epoch_end = ((height / HALVING_INTERVAL) + 1) * HALVING_INTERVAL;
            total = total.saturating_add(reward.saturating_mul(epoch_end - height));
            height = epoch_end;
        }
        assert!(total <= MAX_MONEY);
        assert!(total / COIN > 41_900_000);
    }

    #[test]
    fn test_genesis_differs_per_network() {
        let main = ChainParams::main().genesis_hash();
        let test = ChainParams::testnet().genesis_hash();
        let reg = ChainParams::regtest().genesis_hash();
        assert_ne!(main, test);
        assert_ne!(main, reg);
        assert_ne!(test, reg);
    }

    #[test]
    fn test_genesis_merkle_root() {
        let params = ChainParams::regtest();
        assert!(params.genesis.validate_merkle_root());
    }

    #[test]
    fn test_network_from_str() {
        assert_eq!("regtest".parse::<Network>().unwrap(), Network::Regtest);
        assert_eq!("mainnet".parse::<Network>().unwrap(), Network::Main);
        assert!("moon".parse::<Network>().is_err());
    }
}
