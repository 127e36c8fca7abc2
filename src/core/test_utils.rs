//! Helpers shared by the unit tests: keys, signed spends and cheap regtest
//! blocks mined with SHA256d.
use std::sync::Arc;

use crate::core::chainstate::{ChainstateManager, ManagerOptions};
use crate::core::params::ChainParams;
use crate::core::script::{p2pkh_script, p2pkh_script_sig};
use crate::core::types::{encode_wire, Block, BlockHeader, OutPoint, Transaction, TxInput, TxOutput};
use crate::crypto::{signature_hash, Keypair, SighashVersion};
use crate::pow;
use crate::storage::{MemoryStore, SharedStore};

/// Regtest with coinbase outputs spendable one block later.
pub(crate) fn regtest_params() -> ChainParams {
    let mut params = ChainParams::regtest();
    params.coinbase_maturity = 1;
    params
}

pub(crate) fn key(seed: u8) -> Keypair {
    Keypair::from_secret_bytes(&[seed; 32])
}

pub(crate) fn pay_to(key: &Keypair, amount: u64) -> TxOutput {
    TxOutput {
        amount,
        script_pubkey: p2pkh_script(&key.pubkey_hash()),
    }
}

pub(crate) fn coinbase_tx(height: u64, value: u64, key: &Keypair, tag: &[u8]) -> Transaction {
    Transaction::new_coinbase(height, value, p2pkh_script(&key.pubkey_hash()), tag)
}

/// Spend P2PKH outputs of `key`, given as (outpoint, amount), with v1 sighashes.
pub(crate) fn spend(key: &Keypair, inputs: &[(OutPoint, u64)], outputs: Vec<TxOutput>) -> Transaction {
    let mut tx = Transaction {
        version: 1,
        inputs: inputs
            .iter()
            .map(|(outpoint, _)| TxInput {
                previous_output: outpoint.clone(),
                script_sig: Vec::new(),
                sequence: u32::MAX,
            })
            .collect(),
        outputs,
        lock_time: 0,
    };
    let script_code = p2pkh_script(&key.pubkey_hash());
    let sigs: Vec<Vec<u8>> = inputs
        .iter()
        .enumerate()
        .map(|(i, (_, value))| {
            let hash = signature_hash(&tx, i, &script_code, *value, SighashVersion::V1);
            p2pkh_script_sig(&key.sign_hash(&hash), &key.public_key_bytes())
        })
        .collect();
    for (input, sig) in tx.inputs.iter_mut().zip(sigs) {
        input.script_sig = sig;
    }
    tx
}

pub(crate) fn mine_header(header: &mut BlockHeader, params: &ChainParams) {
    while !pow::meets_difficulty(header, params.pow_algorithm) {
        header.nonce += 1;
    }
}

/// Block on `parent` at `height` paying subsidy plus `fees` to `miner`.
/// `tag` keeps coinbases of competing blocks distinct.
#[allow(clippy::too_many_arguments)]
pub(crate) fn make_block(
    params: &ChainParams,
    parent: &BlockHeader,
    height: u64,
    miner: &Keypair,
    tag: &[u8],
    txs: Vec<Transaction>,
    fees: u64,
    difficulty: u32,
) -> Block {
    let mut transactions = vec![coinbase_tx(height, params.block_reward(height) + fees, miner, tag)];
    transactions.extend(txs);
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_hash: parent.hash(),
            merkle_root: [0u8; 32],
            timestamp: parent.timestamp + params.target_block_time,
            difficulty_target: difficulty,
            nonce: 0,
        },
        transactions,
    };
    block.header.merkle_root = block.compute_merkle_root();
    mine_header(&mut block.header, params);
    block
}

/// A manager over an in-memory store with a funded miner key.
pub(crate) struct TestChain {
    pub manager: ChainstateManager,
    pub store: Arc<MemoryStore>,
    pub params: ChainParams,
    pub miner: Keypair,
}

impl TestChain {
    pub fn new() -> Self {
        Self::with_options(regtest_params(), ManagerOptions::default())
    }

    pub fn with_options(params: ChainParams, options: ManagerOptions) -> Self {
        let store = Arc::new(MemoryStore::new());
        let manager = Self::open_on(&store, &params, options);
        Self {
            manager,
            store,
            params,
            miner: key(0xA1),
        }
    }

    /// Open a second manager over the same store, as after a restart.
    pub fn open_on(store: &Arc<MemoryStore>, params: &ChainParams, options: ManagerOptions) -> ChainstateManager {
        let shared: SharedStore = store.clone();
        ChainstateManager::open(shared, params.clone(), options).unwrap()
    }

    pub fn header_of(&self, hash: &[u8; 32]) -> BlockHeader {
        self.manager.read_block(hash).unwrap().unwrap().header
    }

    pub fn tip_header(&self) -> BlockHeader {
        let tip = self.manager.best_tip().unwrap();
        self.header_of(&tip.hash)
    }

    /// Mine an empty-but-coinbase block on the current tip and submit it.
    pub fn mine_on_tip(&self, tag: &[u8]) -> Block {
        let parent = self.tip_header();
        let height = self.manager.best_tip().unwrap().height + 1;
        let block = make_block(&self.params, &parent, height, &self.miner, tag, vec![], 0, 0);
        self.submit(&block);
        block
    }

    pub fn submit(&self, block: &Block) -> crate::core::chainstate::BlockAcceptance {
        self.manager.process_block(&encode_wire(block).unwrap()).unwrap()
    }
}
