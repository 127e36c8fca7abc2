//! EquiHash-X: memory-hard proof-of-work hash for EquiForge.
//!
//! Three phases over a 4 MB scratchpad:
//!
//!   FILL    - 64-byte chunks derived from a Blake3 seed of the header.
//!   MIX     - 64 rounds of data-dependent reads and writes into the pad,
//!             with a SHA-256 compression every 8th round and a Blake3
//!             compression every 16th.
//!   SQUEEZE - double SHA-256 of the final 64-byte state.
//!
//! Miners and validators run the exact same function.

use sha2::{Digest, Sha256};

use crate::core::types::Hash256;

/// Scratchpad size in bytes (4 MB)
const SCRATCHPAD_SIZE: usize = 4 * 1024 * 1024;

/// Size of each scratchpad chunk in bytes
const CHUNK_SIZE: usize = 64;

const N_CHUNKS: usize = SCRATCHPAD_SIZE / CHUNK_SIZE;

/// Number of mixing iterations
const N_ITERATIONS: usize = 64;

type State = [u64; 8];

/// Compute the EquiHash-X hash of an encoded header.
pub fn equihash_x(header_bytes: &[u8]) -> Hash256 {
    let seed = *blake3::hash(header_bytes).as_bytes();
    let mut scratchpad = fill(&seed);

    let mut state: State = [0u64; 8];
    let header_sha = crate::crypto::sha256(header_bytes);
    for i in 0..4 {
        state[i] = read_u64(&seed, i * 8);
        state[4 + i] = read_u64(&header_sha, i * 8);
    }

    for round in 0..N_ITERATIONS {
        mix_round(&mut scratchpad, &mut state, round);
    }

    squeeze(&state)
}

fn fill(seed: &Hash256) -> Vec<u8> {
    let mut scratchpad = vec![0u8; SCRATCHPAD_SIZE];
    let mut input = [0u8; 36];

    for (i, chunk) in scratchpad.chunks_exact_mut(CHUNK_SIZE).enumerate() {
        let counter = (i as u32).to_le_bytes();

        input[..32].copy_from_slice(seed);
        input[32..].copy_from_slice(&counter);
        let lo = *blake3::hash(&input).as_bytes();

        // Blake3 gives 32 bytes; the upper half is a second hash keyed by the first
        input[..32].copy_from_slice(&lo);
        let hi = blake3::hash(&input);

        chunk[..32].copy_from_slice(&lo);
        chunk[32..].copy_from_slice(hi.as_bytes());
    }

    scratchpad
}

fn mix_round(scratchpad: &mut [u8], state: &mut State, round: usize) {
    let read_idx = (state[0].wrapping_add(state[round % 8]) as usize) % N_CHUNKS;
    let read_offset = read_idx * CHUNK_SIZE;

    for j in 0..8 {
        state[j] ^= read_u64(scratchpad, read_offset + j * 8);
        state[j] = state[j]
            .wrapping_add(state[(j + 1) % 8])
            .rotate_left((round as u32 + j as u32) % 64);
    }

    if round % 8 == 7 {
        let digest = Sha256::digest(state_bytes(state));
        for j in 0..4 {
            state[j] ^= read_u64(&digest, j * 8);
        }
    }

    if round % 16 == 15 {
        let digest = blake3::hash(&state_bytes(state));
        for j in 0..4 {
            state[4 + j] ^= read_u64(digest.as_bytes(), j * 8);
        }
    }

    let write_idx = (state[1].wrapping_mul(state[3]) as usize) % N_CHUNKS;
    let write_offset = write_idx * CHUNK_SIZE;
    scratchpad[write_offset..write_offset + CHUNK_SIZE].copy_from_slice(&state_bytes(state));
}

fn squeeze(state: &State) -> Hash256 {
    crate::crypto::double_sha256(&state_bytes(state))
}

fn state_bytes(state: &State) -> [u8; 64] {
    let mut out = [0u8; 64];
    for (j, limb) in state.iter().enumerate() {
        out[j * 8..(j + 1) * 8].copy_from_slice(&limb.to_le_bytes());
    }
    out
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut limb = [0u8; 8];
    limb.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(limb)
}
