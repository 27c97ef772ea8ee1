//! Block template assembly.
//!
//! Given the tip and a mempool snapshot, select transactions by
//! priority and fee rate under the weight and sigop budgets, then build
//! a mutable candidate block for the miner. The builder never mutates
//! the mempool and touches the chain only to read the snapshot context.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use bitcoind_chainstate::chain::Chain;
use bitcoind_chainstate::deployment::DeploymentState;
use bitcoind_chainstate::error::ChainError;
use bitcoind_consensus::money::COIN;
use bitcoind_consensus::{block_subsidy, Hash256};
use bitcoind_primitives::block::{
    encode_height_push, Block, BlockHeader, WITNESS_COMMITMENT_PREFIX,
};
use bitcoind_primitives::merkle::{compute_merkle_root, hash_pair};
use bitcoind_primitives::transaction::{Transaction, TxIn, TxOut};
use bitcoind_primitives::OutPoint;
use bitcoind_storage::KeyValueStore;
use serde::{Deserialize, Serialize};

use crate::mempool::{Mempool, MempoolEntry};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MinerOptions {
    /// Script the coinbase pays to.
    pub payout_script: Vec<u8>,
    /// Arbitrary tag appended to the coinbase signature script.
    pub coinbase_flags: Vec<u8>,
    /// Weight budget for selected transactions; the gap to the
    /// consensus limit is reserved for the header and coinbase.
    pub max_weight: usize,
    /// Sigop-cost budget for selected transactions.
    pub max_sigops: u64,
    /// Weight filled by priority ordering before switching to fee rate.
    /// Zero disables the priority phase.
    pub priority_weight: usize,
    /// Priority floor for the priority phase.
    pub min_priority: f64,
    /// Below this block weight, free transactions are still accepted.
    pub min_weight: usize,
    /// Fee rate under which a transaction counts as free, in satoshis
    /// per thousand bytes.
    pub min_fee_rate: i64,
}

impl Default for MinerOptions {
    fn default() -> Self {
        Self {
            payout_script: vec![0x51],
            coinbase_flags: b"/bitcoind-rust/".to_vec(),
            max_weight: 3_996_000,
            max_sigops: 79_600,
            priority_weight: 0,
            // One coin, one day old, in a 250-byte transaction.
            min_priority: (COIN as f64) * 144.0 / 250.0,
            min_weight: 16_000,
            min_fee_rate: 1_000,
        }
    }
}

pub struct BlockTemplate {
    pub prev_block: Hash256,
    pub version: i32,
    pub height: i32,
    pub time: u32,
    pub bits: u32,
    pub median_time_past: i64,
    pub state: DeploymentState,
    pub witness: bool,
    pub fees: i64,
    pub weight: usize,
    pub sigops: u64,
    pub coinbase: Transaction,
    pub transactions: Vec<Arc<Transaction>>,
}

impl BlockTemplate {
    /// Materialize a mutable block ready for nonce iteration.
    pub fn to_block(&self) -> Block {
        let mut transactions = Vec::with_capacity(self.transactions.len() + 1);
        transactions.push(self.coinbase.clone());
        transactions.extend(self.transactions.iter().map(|tx| (**tx).clone()));
        let header = BlockHeader {
            version: self.version,
            prev_block: self.prev_block,
            merkle_root: [0u8; 32],
            time: self.time,
            bits: self.bits,
            nonce: 0,
        };
        let mut block = Block::new_mutable(header, transactions);
        block.header.merkle_root = block.merkle_root().0;
        block
    }
}

#[derive(Clone, Copy)]
struct Item {
    index: usize,
    priority: f64,
    rate: i64,
}

struct ByPriority(Item);

impl PartialEq for ByPriority {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for ByPriority {}
impl PartialOrd for ByPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ByPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .total_cmp(&other.0.priority)
            .then(self.0.rate.cmp(&other.0.rate))
            .then(other.0.index.cmp(&self.0.index))
    }
}

struct ByRate(Item);

impl PartialEq for ByRate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for ByRate {}
impl PartialOrd for ByRate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ByRate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .rate
            .cmp(&other.0.rate)
            .then(self.0.priority.total_cmp(&other.0.priority))
            .then(other.0.index.cmp(&self.0.index))
    }
}

pub fn create_template<S: KeyValueStore>(
    chain: &Chain<S>,
    mempool: &Mempool,
    options: &MinerOptions,
) -> Result<BlockTemplate, ChainError> {
    let tip = chain.tip();
    let height = tip.height + 1;
    let median_time_past = chain.db().median_time_past(&tip)?;
    let time = chain.time().now().max(tip.time as i64 + 1) as u32;
    let state = chain.get_deployments(time as i64, &tip)?;
    let version = chain.compute_block_version(&tip)?;
    let bits = chain.get_target(time as i64, Some(&tip))?;
    let witness = state.has_witness();
    let lock_cutoff = if state.has_mtp() {
        median_time_past
    } else {
        time as i64
    };

    let entries = mempool.snapshot();

    // Dependency graph over the snapshot: an entry is ready once all of
    // its in-pool parents are in the block.
    let index_of: HashMap<Hash256, usize> = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| (entry.txid, index))
        .collect();
    let mut dep_count = vec![0usize; entries.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];
    for (index, entry) in entries.iter().enumerate() {
        for outpoint in &entry.spent_outpoints {
            if let Some(&parent) = index_of.get(&outpoint.hash) {
                dep_count[index] += 1;
                children[parent].push(index);
            }
        }
    }

    let mut priority_mode = options.priority_weight > 0;
    let mut by_priority: BinaryHeap<ByPriority> = BinaryHeap::new();
    let mut by_rate: BinaryHeap<ByRate> = BinaryHeap::new();
    let push = |item: Item,
                priority_mode: bool,
                by_priority: &mut BinaryHeap<ByPriority>,
                by_rate: &mut BinaryHeap<ByRate>| {
        if priority_mode {
            by_priority.push(ByPriority(item));
        } else {
            by_rate.push(ByRate(item));
        }
    };
    for (index, entry) in entries.iter().enumerate() {
        if dep_count[index] == 0 {
            let item = item_for(index, entry, height);
            push(item, priority_mode, &mut by_priority, &mut by_rate);
        }
    }

    let mut selected: Vec<Arc<Transaction>> = Vec::new();
    let mut fees = 0i64;
    let mut weight = 0usize;
    let mut sigops = 0u64;

    loop {
        let item = if priority_mode {
            match by_priority.pop() {
                Some(ByPriority(item)) => {
                    if weight > options.priority_weight || item.priority < options.min_priority {
                        // Budget spent: reorder everything by fee rate.
                        priority_mode = false;
                        for ByPriority(pending) in by_priority.drain() {
                            by_rate.push(ByRate(pending));
                        }
                        by_rate.push(ByRate(item));
                        continue;
                    }
                    item
                }
                None => {
                    priority_mode = false;
                    continue;
                }
            }
        } else {
            match by_rate.pop() {
                Some(ByRate(item)) => item,
                None => break,
            }
        };

        let entry = &entries[item.index];
        if !entry.tx.is_final(height, lock_cutoff) {
            continue;
        }
        if !witness && entry.tx.has_witness() {
            continue;
        }
        if weight + entry.weight > options.max_weight {
            continue;
        }
        if sigops + entry.sigops > options.max_sigops {
            continue;
        }
        if !priority_mode && item.rate < options.min_fee_rate && weight > options.min_weight {
            // Free transactions ride along only while the block is
            // small.
            continue;
        }

        selected.push(entry.tx.clone());
        fees += entry.fee;
        weight += entry.weight;
        sigops += entry.sigops;

        for &child in &children[item.index] {
            dep_count[child] -= 1;
            if dep_count[child] == 0 {
                let item = item_for(child, &entries[child], height);
                push(item, priority_mode, &mut by_priority, &mut by_rate);
            }
        }
    }

    let reward = block_subsidy(height, chain.params()) + fees;
    let commitment = if witness {
        let mut hashes: Vec<Hash256> = Vec::with_capacity(selected.len() + 1);
        hashes.push([0u8; 32]);
        hashes.extend(selected.iter().map(|tx| tx.wtxid()));
        let witness_root = compute_merkle_root(&hashes).0;
        Some(hash_pair(&witness_root, &[0u8; 32]))
    } else {
        None
    };
    let coinbase = build_coinbase(height, reward, options, witness, commitment);

    Ok(BlockTemplate {
        prev_block: tip.hash,
        version,
        height,
        time,
        bits,
        median_time_past,
        state,
        witness,
        fees,
        weight,
        sigops,
        coinbase,
        transactions: selected,
    })
}

fn item_for(index: usize, entry: &MempoolEntry, height: i32) -> Item {
    Item {
        index,
        priority: priority_of(entry, height),
        rate: entry.rate(),
    }
}

/// Sum of input value times confirmation age, per byte.
fn priority_of(entry: &MempoolEntry, height: i32) -> f64 {
    let mut total = 0f64;
    for (value, coin_height) in &entry.input_coins {
        if *coin_height < 0 {
            continue;
        }
        let age = (height - coin_height).max(0) as f64;
        total += *value as f64 * age;
    }
    total / entry.size.max(1) as f64
}

fn build_coinbase(
    height: i32,
    reward: i64,
    options: &MinerOptions,
    witness: bool,
    commitment: Option<Hash256>,
) -> Transaction {
    let mut script_sig = encode_height_push(height);
    if !options.coinbase_flags.is_empty() {
        script_sig.push(options.coinbase_flags.len() as u8);
        script_sig.extend_from_slice(&options.coinbase_flags);
    }
    // Extra nonce decorrelates coinbases across template rebuilds.
    let extra: u32 = rand::random();
    script_sig.push(4);
    script_sig.extend_from_slice(&extra.to_le_bytes());

    let mut input = TxIn::new(OutPoint::null(), script_sig, 0xffff_ffff);
    if witness {
        input.witness = vec![vec![0u8; 32]];
    }

    let mut vout = vec![TxOut {
        value: reward,
        script_pubkey: options.payout_script.clone(),
    }];
    if let Some(commitment) = commitment {
        let mut script = WITNESS_COMMITMENT_PREFIX.to_vec();
        script.extend_from_slice(&commitment);
        vout.push(TxOut {
            value: 0,
            script_pubkey: script,
        });
    }

    Transaction {
        version: 1,
        vin: vec![input],
        vout,
        lock_time: 0,
    }
}
