//! Every header the node has accepted, arranged as a tree rooted at genesis.
//!
//! Nodes live in one arena keyed by block hash and point to their parent by
//! hash. The arena also tracks which nodes can become the active tip
//! (candidates) and which nodes changed since the last flush.
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::core::params::{ChainParams, MEDIAN_TIME_SPAN};
use crate::core::types::{BlockHeader, Hash256, NULL_HASH};
use crate::pow::{self, DIFFICULTY_WINDOW};
use crate::storage::StorageError;

/// Validation progress of a block. Ordered so that `>=` compares validity
/// levels among the valid states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BlockStatus {
    Unknown,
    /// Header passed context-free and contextual header checks
    HeaderValid,
    /// Block body passed context-free and contextual block checks
    TreeValid,
    /// Block connected: inputs, scripts and reward checked
    ScriptsValid,
    Invalid,
    InvalidAncestor,
}

impl BlockStatus {
    pub fn is_invalid(self) -> bool {
        matches!(self, BlockStatus::Invalid | BlockStatus::InvalidAncestor)
    }

    pub fn is_valid_at_least(self, level: BlockStatus) -> bool {
        !self.is_invalid() && self >= level
    }
}

#[derive(Debug, Clone)]
pub struct BlockIndexNode {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub height: u64,
    /// Sum of the work of this block and all its ancestors
    pub chain_work: BigUint,
    pub status: BlockStatus,
    /// Order in which this node was first seen
    pub sequence: u64,
    /// Block body is stored
    pub have_data: bool,
    /// This block and every ancestor have data (or are covered by a snapshot)
    pub chain_has_data: bool,
    /// Validated by a trusted UTXO snapshot rather than by connecting it
    pub assumed_valid: bool,
    /// LWMA state after this block; the child's difficulty derives from it
    pub next_difficulty: f64,
}

impl BlockIndexNode {
    pub fn prev_hash(&self) -> Hash256 {
        self.header.prev_hash
    }

    pub fn summary(&self) -> BlockSummary {
        BlockSummary {
            hash: self.hash,
            height: self.height,
            chain_work: self.chain_work.clone(),
            status: self.status,
            timestamp: self.header.timestamp,
            difficulty_target: self.header.difficulty_target,
        }
    }

    pub fn to_stored(&self) -> StoredIndexEntry {
        StoredIndexEntry {
            hash: self.hash,
            header: self.header.clone(),
            height: self.height,
            status: self.status,
            sequence: self.sequence,
            have_data: self.have_data,
            assumed_valid: self.assumed_valid,
        }
    }
}

/// Owned copy of the interesting fields of a node, handed out to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSummary {
    pub hash: Hash256,
    pub height: u64,
    pub chain_work: BigUint,
    pub status: BlockStatus,
    pub timestamp: u64,
    pub difficulty_target: u32,
}

impl fmt::Display for BlockSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} [{}] work={} diff={} {:?}",
            self.height,
            hex::encode(&self.hash[..8]),
            self.chain_work,
            self.difficulty_target,
            self.status,
        )
    }
}

/// Persisted form of a node. Work, data availability along the chain and the
/// difficulty state are recomputed on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredIndexEntry {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub height: u64,
    pub status: BlockStatus,
    pub sequence: u64,
    pub have_data: bool,
    pub assumed_valid: bool,
}

/// Orders candidates by work, then by earliest first-seen sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct CandidateKey {
    work: BigUint,
    sequence: Reverse<u64>,
    hash: Hash256,
}

impl CandidateKey {
    fn of(node: &BlockIndexNode) -> Self {
        Self {
            work: node.chain_work.clone(),
            sequence: Reverse(node.sequence),
            hash: node.hash,
        }
    }
}

pub struct BlockIndex {
    nodes: HashMap<Hash256, BlockIndexNode>,
    children: HashMap<Hash256, Vec<Hash256>>,
    candidates: BTreeSet<CandidateKey>,
    next_sequence: u64,
    dirty: HashSet<Hash256>,
    genesis: Hash256,
}

impl BlockIndex {
    /// Fresh index holding only the genesis block.
    pub fn new(params: &ChainParams) -> Self {
        let header = params.genesis.header.clone();
        let hash = header.hash();
        let genesis = BlockIndexNode {
            hash,
            chain_work: pow::block_work(header.difficulty_target),
            header,
            height: 0,
            status: BlockStatus::ScriptsValid,
            sequence: 0,
            have_data: true,
            chain_has_data: true,
            assumed_valid: false,
            next_difficulty: params.initial_difficulty as f64,
        };

        let mut index = Self {
            nodes: HashMap::new(),
            children: HashMap::new(),
            candidates: BTreeSet::new(),
            next_sequence: 1,
            dirty: HashSet::new(),
            genesis: hash,
        };
        index.insert_node(genesis);
        index.dirty.insert(hash);
        index
    }

    /// Rebuild the index from persisted entries.
    pub fn from_entries(mut entries: Vec<StoredIndexEntry>, params: &ChainParams) -> Result<Self, StorageError> {
        entries.sort_by_key(|e| (e.height, e.sequence));
        let genesis_hash = params.genesis_hash();
        match entries.first() {
            Some(first) if first.hash == genesis_hash => {}
            _ => {
                return Err(StorageError::Corruption(
                    "block index does not start at this network's genesis".into(),
                ))
            }
        }

        let mut index = Self::new(params);
        index.dirty.clear();
        for entry in entries.into_iter().skip(1) {
            let parent = index.nodes.get(&entry.header.prev_hash).ok_or_else(|| {
                StorageError::Corruption(format!("index entry {} has unknown parent", hex::encode(entry.hash)))
            })?;
            if entry.header.hash() != entry.hash || entry.height != parent.height + 1 {
                return Err(StorageError::Corruption(format!(
                    "index entry {} does not match its header",
                    hex::encode(entry.hash)
                )));
            }

            let node = BlockIndexNode {
                hash: entry.hash,
                chain_work: &parent.chain_work + pow::block_work(entry.header.difficulty_target),
                chain_has_data: entry.assumed_valid || (entry.have_data && parent.chain_has_data),
                next_difficulty: index.next_difficulty_after(parent, entry.header.timestamp, params),
                header: entry.header,
                height: entry.height,
                status: entry.status,
                sequence: entry.sequence,
                have_data: entry.have_data,
                assumed_valid: entry.assumed_valid,
            };
            index.next_sequence = index.next_sequence.max(entry.sequence + 1);
            index.insert_node(node);
        }
        Ok(index)
    }

    fn insert_node(&mut self, node: BlockIndexNode) {
        let hash = node.hash;
        if node.height > 0 {
            self.children.entry(node.prev_hash()).or_default().push(hash);
        }
        if Self::is_candidate(&node) {
            self.candidates.insert(CandidateKey::of(&node));
        }
        self.nodes.insert(hash, node);
    }

    fn is_candidate(node: &BlockIndexNode) -> bool {
        node.chain_has_data && node.status.is_valid_at_least(BlockStatus::TreeValid)
    }

    fn refresh_candidate(&mut self, hash: &Hash256) {
        let Some(node) = self.nodes.get(hash) else {
            return;
        };
        let key = CandidateKey::of(node);
        if Self::is_candidate(node) {
            self.candidates.insert(key);
        } else {
            self.candidates.remove(&key);
        }
    }

    fn next_difficulty_after(&self, parent: &BlockIndexNode, timestamp: u64, params: &ChainParams) -> f64 {
        if params.no_retargeting {
            return parent.next_difficulty;
        }
        let mut timestamps = self.timestamps_ending_at(&parent.hash, DIFFICULTY_WINDOW - 1);
        timestamps.push(timestamp);
        pow::next_difficulty_fractional(parent.next_difficulty, &timestamps, params)
    }

    /// Register a header whose parent is known. Returns the existing node if
    /// the header was seen before, `None` if the parent is unknown.
    ///
    /// A header building on an invalid block is stored as `InvalidAncestor`.
    pub fn add_header(&mut self, header: &BlockHeader, params: &ChainParams) -> Option<&BlockIndexNode> {
        let hash = header.hash();
        if !self.nodes.contains_key(&hash) {
            let parent = self.nodes.get(&header.prev_hash)?;
            let status = if parent.status.is_invalid() {
                BlockStatus::InvalidAncestor
            } else {
                BlockStatus::HeaderValid
            };
            let node = BlockIndexNode {
                hash,
                header: header.clone(),
                height: parent.height + 1,
                chain_work: &parent.chain_work + pow::block_work(header.difficulty_target),
                status,
                sequence: self.next_sequence,
                have_data: false,
                chain_has_data: false,
                assumed_valid: false,
                next_difficulty: self.next_difficulty_after(parent, header.timestamp, params),
            };
            self.next_sequence += 1;
            self.dirty.insert(hash);
            self.insert_node(node);
        }
        self.nodes.get(&hash)
    }

    pub fn get(&self, hash: &Hash256) -> Option<&BlockIndexNode> {
        self.nodes.get(hash)
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis
    }

    pub fn children_of(&self, hash: &Hash256) -> &[Hash256] {
        self.children.get(hash).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Difficulty a child of `parent` must declare.
    pub fn expected_difficulty(&self, parent: &Hash256, params: &ChainParams) -> Option<u32> {
        self.nodes
            .get(parent)
            .map(|p| pow::fractional_to_integer_difficulty(p.next_difficulty, params))
    }

    /// Record that the block body is stored and propagate data availability
    /// to descendants that were waiting on it.
    pub fn set_have_data(&mut self, hash: &Hash256) {
        let Some(node) = self.nodes.get_mut(hash) else {
            return;
        };
        node.have_data = true;
        let (height, prev_hash) = (node.height, node.header.prev_hash);
        let parent_ready = height == 0 || self.nodes.get(&prev_hash).map_or(false, |p| p.chain_has_data);
        self.dirty.insert(*hash);
        if parent_ready {
            self.propagate_chain_data(*hash);
        }
    }

    fn propagate_chain_data(&mut self, root: Hash256) {
        let mut queue = vec![root];
        while let Some(hash) = queue.pop() {
            let Some(node) = self.nodes.get_mut(&hash) else {
                continue;
            };
            if !node.have_data && !node.assumed_valid {
                continue;
            }
            node.chain_has_data = true;
            self.refresh_candidate(&hash);
            queue.extend(self.children_of(&hash).iter().copied());
        }
    }

    /// Raise a valid node's status. Never lowers it and never revives an
    /// invalid node.
    pub fn raise_validity(&mut self, hash: &Hash256, status: BlockStatus) {
        let Some(node) = self.nodes.get_mut(hash) else {
            return;
        };
        if node.status.is_invalid() || node.status >= status {
            return;
        }
        node.status = status;
        self.dirty.insert(*hash);
        self.refresh_candidate(hash);
    }

    /// Greatest chain work among candidates; earliest first-seen on ties.
    pub fn find_best_candidate(&self) -> Option<&BlockIndexNode> {
        self.candidates
            .iter()
            .next_back()
            .and_then(|key| self.nodes.get(&key.hash))
    }

    pub fn remove_candidate(&mut self, hash: &Hash256) {
        if let Some(node) = self.nodes.get(hash) {
            self.candidates.remove(&CandidateKey::of(node));
        }
    }

    /// Drop candidates with less work than `tip`. They can never overtake it
    /// while it stays active.
    pub fn prune_candidates(&mut self, tip: &Hash256) {
        let Some(work) = self.nodes.get(tip).map(|n| n.chain_work.clone()) else {
            return;
        };
        self.candidates.retain(|key| key.work >= work);
    }

    /// Re-collect every eligible node with at least `tip`'s work. Needed after
    /// the tip moved back, since pruning dropped the lower candidates.
    pub fn rebuild_candidates(&mut self, tip: &Hash256) {
        let Some(work) = self.nodes.get(tip).map(|n| n.chain_work.clone()) else {
            return;
        };
        self.candidates = self
            .nodes
            .values()
            .filter(|n| Self::is_candidate(n) && n.chain_work >= work)
            .map(CandidateKey::of)
            .collect();
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Mark `hash` invalid and every descendant `InvalidAncestor`. Returns the
    /// descendants that changed.
    pub fn mark_invalid(&mut self, hash: &Hash256) -> Vec<Hash256> {
        let Some(node) = self.nodes.get_mut(hash) else {
            return Vec::new();
        };
        node.status = BlockStatus::Invalid;
        self.dirty.insert(*hash);
        self.refresh_candidate(hash);

        let descendants = self.descendants(hash);
        for d in &descendants {
            if let Some(node) = self.nodes.get_mut(d) {
                node.status = BlockStatus::InvalidAncestor;
            }
            self.dirty.insert(*d);
            self.refresh_candidate(d);
        }
        descendants
    }

    /// Clear invalidity from `hash`, its ancestors and its descendants.
    /// Cleared nodes drop back to `TreeValid` and must be connected again.
    /// Returns the hashes that changed.
    pub fn reconsider(&mut self, hash: &Hash256) -> Vec<Hash256> {
        let mut affected = self.descendants(hash);
        affected.push(*hash);
        let mut cursor = self.nodes.get(hash).map(|n| n.header.prev_hash);
        while let Some(prev) = cursor {
            let Some(node) = self.nodes.get(&prev) else {
                break;
            };
            affected.push(prev);
            cursor = (node.height > 0).then_some(node.header.prev_hash);
        }

        let mut changed = Vec::new();
        for h in affected {
            let Some(node) = self.nodes.get_mut(&h) else {
                continue;
            };
            if !node.status.is_invalid() {
                continue;
            }
            node.status = if node.have_data || node.assumed_valid {
                BlockStatus::TreeValid
            } else {
                BlockStatus::HeaderValid
            };
            self.dirty.insert(h);
            self.refresh_candidate(&h);
            changed.push(h);
        }
        changed
    }

    fn descendants(&self, hash: &Hash256) -> Vec<Hash256> {
        let mut out = Vec::new();
        let mut queue: Vec<Hash256> = self.children_of(hash).to_vec();
        while let Some(h) = queue.pop() {
            out.push(h);
            queue.extend(self.children_of(&h).iter().copied());
        }
        out
    }

    /// Ancestor of `hash` at `height` (the node itself at its own height).
    pub fn get_ancestor(&self, hash: &Hash256, height: u64) -> Option<&BlockIndexNode> {
        let mut node = self.nodes.get(hash)?;
        if height > node.height {
            return None;
        }
        while node.height > height {
            node = self.nodes.get(&node.header.prev_hash)?;
        }
        Some(node)
    }

    /// Lowest common ancestor of two nodes.
    pub fn find_fork(&self, a: &Hash256, b: &Hash256) -> Option<Hash256> {
        let mut x = self.nodes.get(a)?;
        let mut y = self.nodes.get(b)?;
        while x.height > y.height {
            x = self.nodes.get(&x.header.prev_hash)?;
        }
        while y.height > x.height {
            y = self.nodes.get(&y.header.prev_hash)?;
        }
        while x.hash != y.hash {
            x = self.nodes.get(&x.header.prev_hash)?;
            y = self.nodes.get(&y.header.prev_hash)?;
        }
        Some(x.hash)
    }

    /// Hashes from just above `fork` up to and including `tip`, oldest first.
    pub fn path_from(&self, fork: &Hash256, tip: &Hash256) -> Vec<Hash256> {
        let mut path = Vec::new();
        let mut cursor = *tip;
        while cursor != *fork {
            let Some(node) = self.nodes.get(&cursor) else {
                break;
            };
            path.push(cursor);
            if node.height == 0 {
                break;
            }
            cursor = node.header.prev_hash;
        }
        path.reverse();
        path
    }

    /// Up to `count` timestamps ending at `hash`, oldest first.
    pub fn timestamps_ending_at(&self, hash: &Hash256, count: usize) -> Vec<u64> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = self.nodes.get(hash);
        while let Some(node) = cursor {
            if out.len() == count {
                break;
            }
            out.push(node.header.timestamp);
            cursor = if node.height == 0 {
                None
            } else {
                self.nodes.get(&node.header.prev_hash)
            };
        }
        out.reverse();
        out
    }

    /// Median timestamp of the last 11 blocks ending at `hash`.
    pub fn median_time_past(&self, hash: &Hash256) -> u64 {
        let mut times = self.timestamps_ending_at(hash, MEDIAN_TIME_SPAN);
        if times.is_empty() {
            return 0;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Nodes without children.
    pub fn tips(&self) -> Vec<&BlockIndexNode> {
        self.nodes
            .values()
            .filter(|n| self.children_of(&n.hash).is_empty())
            .collect()
    }

    /// Treat `base` and its ancestors as validated by a trusted snapshot.
    pub fn mark_assumed_valid(&mut self, base: &Hash256) {
        let mut cursor = *base;
        while cursor != self.genesis && cursor != NULL_HASH {
            let Some(node) = self.nodes.get_mut(&cursor) else {
                break;
            };
            node.assumed_valid = true;
            node.chain_has_data = true;
            if !node.status.is_invalid() {
                node.status = BlockStatus::ScriptsValid;
            }
            let prev = node.header.prev_hash;
            self.dirty.insert(cursor);
            self.refresh_candidate(&cursor);
            cursor = prev;
        }
        self.propagate_chain_data(*base);
    }

    /// Drop `ScriptsValid` back to `TreeValid` on every connected block so a
    /// reindex reconnects them from scratch.
    pub fn reset_script_validity(&mut self) {
        let genesis = self.genesis;
        for node in self.nodes.values_mut() {
            if node.hash != genesis && !node.assumed_valid && node.status == BlockStatus::ScriptsValid {
                node.status = BlockStatus::TreeValid;
                self.dirty.insert(node.hash);
            }
        }
    }

    /// Nodes changed since the last [`clear_dirty`](Self::clear_dirty).
    pub fn dirty_entries(&self) -> Vec<StoredIndexEntry> {
        self.dirty
            .iter()
            .filter_map(|h| self.nodes.get(h))
            .map(BlockIndexNode::to_stored)
            .collect()
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }
}

/// The active chain as a vector of hashes indexed by height.
#[derive(Debug, Clone, Default)]
pub struct ActiveChain {
    hashes: Vec<Hash256>,
}

impl ActiveChain {
    /// Chain from genesis to `tip`. `None` if `tip` is not in the index.
    pub fn from_tip(index: &BlockIndex, tip: &Hash256) -> Option<Self> {
        let node = index.get(tip)?;
        let mut hashes = vec![NULL_HASH; node.height as usize + 1];
        let mut cursor = Some(node);
        while let Some(n) = cursor {
            hashes[n.height as usize] = n.hash;
            cursor = if n.height == 0 { None } else { index.get(&n.header.prev_hash) };
        }
        if hashes[0] != index.genesis_hash() {
            return None;
        }
        Some(Self { hashes })
    }

    pub fn tip(&self) -> Hash256 {
        self.hashes.last().copied().unwrap_or(NULL_HASH)
    }

    pub fn height(&self) -> u64 {
        self.hashes.len().saturating_sub(1) as u64
    }

    pub fn at_height(&self, height: u64) -> Option<Hash256> {
        self.hashes.get(height as usize).copied()
    }

    pub fn contains(&self, node: &BlockIndexNode) -> bool {
        self.at_height(node.height) == Some(node.hash)
    }

    pub fn contains_hash(&self, index: &BlockIndex, hash: &Hash256) -> bool {
        index.get(hash).map_or(false, |n| self.contains(n))
    }

    pub fn push(&mut self, hash: Hash256) {
        self.hashes.push(hash);
    }

    pub fn pop(&mut self) -> Option<Hash256> {
        self.hashes.pop()
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}
