//! Proof of work: hash algorithms, chain work, and LWMA difficulty retargeting.

use num_bigint::BigUint;
use num_traits::One;
use serde::{Deserialize, Serialize};

use crate::core::params::ChainParams;
use crate::core::types::{BlockHeader, Hash256};

pub mod equihash;

pub use equihash::equihash_x;

/// Hash function whose output must show `difficulty_target` leading zero bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowAlgorithm {
    /// Memory-hard EquiHash-X (main and test networks)
    EquihashX,
    /// Plain double SHA-256, cheap enough for regtest and unit tests
    Sha256d,
}

impl PowAlgorithm {
    pub fn hash(self, header: &BlockHeader) -> Hash256 {
        let encoded = header.encode();
        match self {
            PowAlgorithm::EquihashX => equihash_x(&encoded),
            PowAlgorithm::Sha256d => crate::crypto::double_sha256(&encoded),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PowAlgorithm::EquihashX => "equihash-x-v1",
            PowAlgorithm::Sha256d => "sha256d",
        }
    }
}

/// Count leading zero bits in a hash
pub fn leading_zero_bits(hash: &Hash256) -> u32 {
    let mut count = 0u32;
    for byte in hash {
        if *byte == 0 {
            count += 8;
        } else {
            count += byte.leading_zeros();
            break;
        }
    }
    count
}

pub fn meets_difficulty(header: &BlockHeader, algorithm: PowAlgorithm) -> bool {
    leading_zero_bits(&algorithm.hash(header)) >= header.difficulty_target
}

/// Expected hashes needed to meet `difficulty` leading zero bits: 2^difficulty.
pub fn block_work(difficulty: u32) -> BigUint {
    BigUint::one() << difficulty
}

// ─── LWMA Difficulty ────────────────────────────────────────────────

pub const DIFFICULTY_WINDOW: usize = 60;
const MAX_ADJUSTMENT_PER_BLOCK: f64 = 0.5;

/// Linearly weighted moving average retarget.
///
/// `timestamps` are the most recent block timestamps, oldest first, ending with
/// the block just added. Newer solve times weigh more. The step per block is
/// capped and ramps up while fewer than a full window of blocks exist.
pub fn next_difficulty_fractional(current_frac: f64, timestamps: &[u64], params: &ChainParams) -> f64 {
    let n = timestamps.len();
    if n < 2 {
        return current_frac;
    }
    let target = params.target_block_time as f64;
    let window = n.min(DIFFICULTY_WINDOW);
    let start = n - window;

    let mut weighted_sum: f64 = 0.0;
    let mut weight_total: f64 = 0.0;
    for i in 1..window {
        let solve_time = timestamps[start + i].saturating_sub(timestamps[start + i - 1]);
        let clamped = (solve_time as f64).clamp(1.0, target * 6.0);
        let weight = i as f64;
        weighted_sum += clamped * weight;
        weight_total += weight;
    }
    if weight_total == 0.0 {
        return current_frac;
    }

    let avg = weighted_sum / weight_total;
    let raw_adj = -((avg / target).ln() / 2.0_f64.ln());
    let warmup = ((window - 1) as f64 / DIFFICULTY_WINDOW as f64).min(1.0);
    let max_adj = MAX_ADJUSTMENT_PER_BLOCK * warmup;
    let adj = raw_adj.clamp(-max_adj, max_adj);
    (current_frac + adj).clamp(params.min_difficulty as f64, params.max_difficulty as f64)
}

pub fn fractional_to_integer_difficulty(frac: f64, params: &ChainParams) -> u32 {
    (frac.round() as i64).clamp(params.min_difficulty as i64, params.max_difficulty as i64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_zero_bits() {
        let mut h = [0u8; 32];
        h[2] = 0xFF;
        assert_eq!(leading_zero_bits(&h), 16);
        let mut h = [0u8; 32];
        h[1] = 0x0F;
        assert_eq!(leading_zero_bits(&h), 12);
        assert_eq!(leading_zero_bits(&[0xFF; 32]), 0);
        assert_eq!(leading_zero_bits(&[0; 32]), 256);
    }

    #[test]
    fn test_block_work_doubles_per_bit() {
        assert_eq!(block_work(0), BigUint::from(1u32));
        assert_eq!(block_work(10), BigUint::from(1024u32));
        assert_eq!(block_work(11), block_work(10) * 2u32);
    }

    #[test]
    fn test_lwma_fast_blocks_raise_difficulty() {
        let params = ChainParams::main();
        let timestamps: Vec<u64> = (0..60).map(|i| 1_000 + i * 10).collect();
        let next = next_difficulty_fractional(10.0, &timestamps, &params);
        assert!(next > 10.0);
        assert!(next <= 10.5);
    }

    #[test]
    fn test_lwma_slow_blocks_lower_difficulty() {
        let params = ChainParams::main();
        let timestamps: Vec<u64> = (0..60).map(|i| 1_000 + i * 900).collect();
        let next = next_difficulty_fractional(10.0, &timestamps, &params);
        assert!(next < 10.0);
    }

    #[test]
    fn test_lwma_on_target_is_stable() {
        let params = ChainParams::main();
        let timestamps: Vec<u64> = (0..60).map(|i| 1_000 + i * params.target_block_time).collect();
        let next = next_difficulty_fractional(12.0, &timestamps, &params);
        assert!((next - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_difficulty_clamped_to_bounds() {
        let params = ChainParams::main();
        assert_eq!(fractional_to_integer_difficulty(1.2, &params), params.min_difficulty);
        assert_eq!(fractional_to_integer_difficulty(1e9, &params), params.max_difficulty);
        assert_eq!(fractional_to_integer_difficulty(8.4, &params), 8);
    }

    #[test]
    fn test_sha256d_meets_difficulty_zero() {
        let header = ChainParams::regtest().genesis.header;
        assert!(meets_difficulty(&header, PowAlgorithm::Sha256d));
    }
}
