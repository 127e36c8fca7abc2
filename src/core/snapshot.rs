//! UTXO snapshots: a gzip'd stream of every coin at some block, with a
//! digest the network can pin in its parameters.
use std::io::{Read, Write};

use bincode::Options;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::coins::Coin;
use crate::core::params::Network;
use crate::core::types::{Hash256, OutPoint, MAX_WIRE_SIZE};

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"FKUS";
pub const SNAPSHOT_VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("not a UTXO snapshot")]
    BadMagic,
    #[error("unsupported snapshot version {0}")]
    Version(u16),
    #[error("snapshot is for {found}, this node runs {expected}")]
    WrongNetwork { expected: Network, found: Network },
    #[error("snapshot base {} is not trusted by this network", hex::encode(.0))]
    Untrusted(Hash256),
    #[error("coin digest does not match")]
    DigestMismatch,
    #[error("expected {expected} coins, found {found}")]
    CoinCountMismatch { expected: u64, found: u64 },
    #[error("snapshot base header {} is unknown", hex::encode(.0))]
    UnknownBase(Hash256),
    #[error("{0}")]
    Refused(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub magic: [u8; 4],
    pub version: u16,
    pub network: Network,
    pub base_hash: Hash256,
    pub base_height: u64,
    pub coin_count: u64,
    pub digest: Hash256,
}

impl SnapshotMetadata {
    pub fn new(network: Network, base_hash: Hash256, base_height: u64, coin_count: u64, digest: Hash256) -> Self {
        Self {
            magic: SNAPSHOT_MAGIC,
            version: SNAPSHOT_VERSION,
            network,
            base_hash,
            base_height,
            coin_count,
            digest,
        }
    }
}

/// Summary of a UTXO set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UtxoStats {
    pub best_block: Hash256,
    pub coin_count: u64,
    pub total_amount: u128,
    pub digest: Hash256,
}

/// Order-dependent digest over coins; callers pass them in outpoint order.
pub fn utxo_digest<'a>(coins: impl IntoIterator<Item = (&'a OutPoint, &'a Coin)>) -> Result<(Hash256, u64, u128), SnapshotError> {
    let mut hasher = Sha256::new();
    let mut count = 0u64;
    let mut total = 0u128;
    for (outpoint, coin) in coins {
        hasher.update(outpoint.txid);
        hasher.update(outpoint.vout.to_le_bytes());
        hasher.update(bincode::serialize(coin)?);
        count += 1;
        total += coin.output.amount as u128;
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    Ok((digest, count, total))
}

fn record_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_WIRE_SIZE)
}

/// Write `meta` then every coin. The digest in `meta` is not recomputed.
pub fn write_snapshot<W: Write>(writer: W, meta: &SnapshotMetadata, coins: &[(OutPoint, Coin)]) -> Result<(), SnapshotError> {
    let mut encoder = GzEncoder::new(writer, Compression::default());
    record_options().serialize_into(&mut encoder, meta)?;
    for record in coins {
        record_options().serialize_into(&mut encoder, record)?;
    }
    encoder.finish()?.flush()?;
    Ok(())
}

fn is_eof(e: &bincode::Error) -> bool {
    matches!(**e, bincode::ErrorKind::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof)
}

/// Read a snapshot and check its coin count and digest against its own
/// metadata. Trust in the metadata is the caller's decision.
pub fn read_snapshot<R: Read>(reader: R) -> Result<(SnapshotMetadata, Vec<(OutPoint, Coin)>), SnapshotError> {
    let mut decoder = GzDecoder::new(reader);
    let meta: SnapshotMetadata = record_options().deserialize_from(&mut decoder)?;
    if meta.magic != SNAPSHOT_MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    if meta.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::Version(meta.version));
    }

    let mut coins = Vec::new();
    for _ in 0..meta.coin_count {
        let record: (OutPoint, Coin) = match record_options().deserialize_from(&mut decoder) {
            Ok(record) => record,
            Err(e) if is_eof(&e) => {
                return Err(SnapshotError::CoinCountMismatch {
                    expected: meta.coin_count,
                    found: coins.len() as u64,
                })
            }
            Err(e) => return Err(e.into()),
        };
        coins.push(record);
    }
    let mut rest = Vec::new();
    decoder.read_to_end(&mut rest)?;
    if !rest.is_empty() {
        return Err(SnapshotError::Refused("trailing data after the last coin".into()));
    }

    coins.sort_by(|a, b| a.0.cmp(&b.0));
    let (digest, _, _) = utxo_digest(coins.iter().map(|(o, c)| (o, c)))?;
    if digest != meta.digest {
        return Err(SnapshotError::DigestMismatch);
    }
    Ok((meta, coins))
}
