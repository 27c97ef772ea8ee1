//! A slim mempool feeding the template builder.
//!
//! Enough policy to admit validated spends, track conflicts by outpoint
//! and evict by fee rate under a byte cap. Relay policy lives elsewhere.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoind_chainstate::chain::Chain;
use bitcoind_chainstate::error::ChainError;
use bitcoind_consensus::constants::COINBASE_MATURITY;
use bitcoind_consensus::money::{money_range, MAX_MONEY};
use bitcoind_consensus::{hash256_to_hex, Hash256};
use bitcoind_primitives::transaction::Transaction;
use bitcoind_primitives::{Block, OutPoint};
use bitcoind_script::interpreter::verify_script;
use bitcoind_script::sigops::tx_sigops_cost;
use bitcoind_storage::KeyValueStore;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MempoolErrorKind {
    AlreadyInMempool,
    ConflictingInput,
    MissingInput,
    MempoolFull,
    InvalidTransaction,
    InvalidScript,
    Internal,
}

#[derive(Clone, Debug)]
pub struct MempoolError {
    pub kind: MempoolErrorKind,
    pub message: String,
}

impl MempoolError {
    pub fn new(kind: MempoolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MempoolError {}

pub struct MempoolEntry {
    pub txid: Hash256,
    pub tx: Arc<Transaction>,
    pub time: u64,
    /// Chain height when admitted.
    pub height: i32,
    pub fee: i64,
    pub size: usize,
    pub weight: usize,
    pub sigops: u64,
    /// Value and creation height of each input coin, for priority.
    /// Parents still in the mempool count as age zero.
    pub input_coins: Vec<(i64, i32)>,
    pub spent_outpoints: Vec<OutPoint>,
}

impl MempoolEntry {
    /// Fee per thousand bytes.
    pub fn rate(&self) -> i64 {
        self.fee.saturating_mul(1000) / self.size.max(1) as i64
    }
}

#[derive(Default)]
pub struct Mempool {
    entries: HashMap<Hash256, Arc<MempoolEntry>>,
    spent: HashMap<OutPoint, Hash256>,
    total_bytes: usize,
    max_bytes: usize,
    revision: u64,
}

impl Mempool {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            ..Self::default()
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spent.contains_key(outpoint)
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn get(&self, txid: &Hash256) -> Option<&Arc<MempoolEntry>> {
        self.entries.get(txid)
    }

    /// The output of an in-mempool transaction, for chained spends.
    pub fn output(&self, outpoint: &OutPoint) -> Option<(i64, Vec<u8>)> {
        let entry = self.entries.get(&outpoint.hash)?;
        let output = entry.tx.vout.get(outpoint.index as usize)?;
        Some((output.value, output.script_pubkey.clone()))
    }

    /// An immutable snapshot for the template builder.
    pub fn snapshot(&self) -> Vec<Arc<MempoolEntry>> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.txid.cmp(&b.txid));
        entries
    }

    pub fn insert(&mut self, entry: MempoolEntry) -> Result<(), MempoolError> {
        if self.max_bytes > 0 && entry.size > self.max_bytes {
            return Err(MempoolError::new(
                MempoolErrorKind::MempoolFull,
                "transaction too large for mempool",
            ));
        }
        if self.entries.contains_key(&entry.txid) {
            return Err(MempoolError::new(
                MempoolErrorKind::AlreadyInMempool,
                "transaction already in mempool",
            ));
        }
        for outpoint in &entry.spent_outpoints {
            if let Some(conflict) = self.spent.get(outpoint) {
                return Err(MempoolError::new(
                    MempoolErrorKind::ConflictingInput,
                    format!(
                        "input {}:{} already spent by {}",
                        hash256_to_hex(&outpoint.hash),
                        outpoint.index,
                        hash256_to_hex(conflict)
                    ),
                ));
            }
        }
        let inserted = entry.txid;
        for outpoint in &entry.spent_outpoints {
            self.spent.insert(*outpoint, entry.txid);
        }
        self.total_bytes = self.total_bytes.saturating_add(entry.size);
        self.entries.insert(entry.txid, Arc::new(entry));
        self.revision = self.revision.saturating_add(1);

        if self.max_bytes > 0 && self.total_bytes > self.max_bytes {
            self.evict_to_fit();
        }
        if self.max_bytes > 0 && !self.entries.contains_key(&inserted) {
            return Err(MempoolError::new(MempoolErrorKind::MempoolFull, "mempool full"));
        }
        Ok(())
    }

    pub fn remove(&mut self, txid: &Hash256) -> Option<Arc<MempoolEntry>> {
        let entry = self.entries.remove(txid)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        for outpoint in &entry.spent_outpoints {
            if self.spent.get(outpoint) == Some(txid) {
                self.spent.remove(outpoint);
            }
        }
        self.revision = self.revision.saturating_add(1);
        Some(entry)
    }

    /// Drop transactions confirmed (or conflicted) by a connected block.
    pub fn remove_mined(&mut self, block: &Block) {
        for tx in &block.transactions {
            let txid = tx.txid();
            self.remove(&txid);
            for input in &tx.vin {
                if let Some(conflict) = self.spent.get(&input.prevout).copied() {
                    self.remove(&conflict);
                }
            }
        }
    }

    fn evict_to_fit(&mut self) {
        let mut candidates: Vec<(Hash256, i64, usize, u64)> = self
            .entries
            .values()
            .map(|entry| (entry.txid, entry.fee, entry.size.max(1), entry.time))
            .collect();
        // Lowest fee rate first; ties broken by age then txid.
        candidates.sort_by(|a, b| {
            let left = i128::from(a.1) * b.2 as i128;
            let right = i128::from(b.1) * a.2 as i128;
            left.cmp(&right)
                .then(a.3.cmp(&b.3))
                .then(a.0.cmp(&b.0))
        });
        for (txid, _, _, _) in candidates {
            if self.total_bytes <= self.max_bytes {
                break;
            }
            self.remove(&txid);
        }
    }
}

/// Validate a transaction against the current tip and package it for the
/// mempool. Inputs may come from the coin set or from transactions
/// already in the pool.
pub fn build_mempool_entry<S: KeyValueStore>(
    chain: &Chain<S>,
    mempool: &Mempool,
    tx: Transaction,
) -> Result<MempoolEntry, MempoolError> {
    let txid = tx.txid();
    tx.check_sanity()
        .map_err(|err| MempoolError::new(MempoolErrorKind::InvalidTransaction, err.to_string()))?;
    if tx.is_coinbase() {
        return Err(MempoolError::new(
            MempoolErrorKind::InvalidTransaction,
            "coinbase cannot enter the mempool",
        ));
    }

    let tip = chain.tip();
    let next_height = tip.height + 1;
    let state = chain.deployment_state();
    let cutoff = if state.has_mtp() {
        chain
            .db()
            .median_time_past(&tip)
            .map_err(internal_error)?
    } else {
        chain.time().now()
    };
    if !tx.is_final(next_height, cutoff) {
        return Err(MempoolError::new(
            MempoolErrorKind::InvalidTransaction,
            "non-final",
        ));
    }

    let mut input_coins = Vec::with_capacity(tx.vin.len());
    let mut spent_outpoints = Vec::with_capacity(tx.vin.len());
    let mut scripts: HashMap<OutPoint, Vec<u8>> = HashMap::new();
    let mut total_in = 0i64;
    for (index, input) in tx.vin.iter().enumerate() {
        if mempool.is_spent(&input.prevout) {
            return Err(MempoolError::new(
                MempoolErrorKind::ConflictingInput,
                "input already spent in mempool",
            ));
        }
        let (value, script, coin_height) =
            match chain.db().get_coin(&input.prevout).map_err(internal_error)? {
                Some(coin) => {
                    if coin.coinbase && next_height - coin.height < COINBASE_MATURITY {
                        return Err(MempoolError::new(
                            MempoolErrorKind::InvalidTransaction,
                            "premature spend of coinbase",
                        ));
                    }
                    (coin.value, coin.script_pubkey, coin.height)
                }
                None => match mempool.output(&input.prevout) {
                    // Parent is unconfirmed: age zero for priority.
                    Some((value, script)) => (value, script, -1),
                    None => {
                        return Err(MempoolError::new(
                            MempoolErrorKind::MissingInput,
                            "missing inputs",
                        ))
                    }
                },
            };
        total_in = total_in.checked_add(value).ok_or_else(|| {
            MempoolError::new(MempoolErrorKind::InvalidTransaction, "value out of range")
        })?;
        if state.script_flags != 0 {
            verify_script(
                &input.script_sig,
                &script,
                &input.witness,
                &tx,
                index,
                value,
                state.script_flags,
            )
            .map_err(|err| MempoolError::new(MempoolErrorKind::InvalidScript, err.to_string()))?;
        }
        input_coins.push((value, coin_height));
        spent_outpoints.push(input.prevout);
        scripts.insert(input.prevout, script);
    }

    let total_out = tx.output_value();
    if !money_range(total_in) || total_out > MAX_MONEY || total_in < total_out {
        return Err(MempoolError::new(
            MempoolErrorKind::InvalidTransaction,
            "value out of range",
        ));
    }
    let fee = total_in - total_out;

    let sigops = tx_sigops_cost(&tx, state.script_flags, |outpoint| {
        scripts.get(outpoint).cloned()
    });

    Ok(MempoolEntry {
        txid,
        size: tx.size(),
        weight: tx.weight(),
        tx: Arc::new(tx),
        time: now_secs(),
        height: tip.height,
        fee,
        sigops,
        input_coins,
        spent_outpoints,
    })
}

fn internal_error(err: ChainError) -> MempoolError {
    MempoolError::new(MempoolErrorKind::Internal, err.to_string())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoind_primitives::transaction::{TxIn, TxOut};

    fn entry(txid_byte: u8, fee: i64, size: usize, spends: Vec<OutPoint>) -> MempoolEntry {
        let tx = Transaction {
            version: 2,
            vin: spends
                .iter()
                .map(|outpoint| TxIn::new(*outpoint, Vec::new(), 0xffff_ffff))
                .collect(),
            vout: vec![TxOut {
                value: 1,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        };
        MempoolEntry {
            txid: [txid_byte; 32],
            tx: Arc::new(tx),
            time: txid_byte as u64,
            height: 0,
            fee,
            size,
            weight: size * 4,
            sigops: 0,
            input_coins: vec![(fee + 1, 0)],
            spent_outpoints: spends,
        }
    }

    #[test]
    fn conflicting_spends_rejected() {
        let mut pool = Mempool::new(1 << 20);
        let outpoint = OutPoint::new([1u8; 32], 0);
        pool.insert(entry(10, 100, 100, vec![outpoint])).unwrap();
        let err = pool
            .insert(entry(11, 200, 100, vec![outpoint]))
            .expect_err("conflict");
        assert_eq!(err.kind, MempoolErrorKind::ConflictingInput);
    }

    #[test]
    fn eviction_drops_lowest_fee_rate() {
        let mut pool = Mempool::new(250);
        pool.insert(entry(1, 10, 100, vec![OutPoint::new([1u8; 32], 0)]))
            .unwrap();
        pool.insert(entry(2, 1_000, 100, vec![OutPoint::new([2u8; 32], 0)]))
            .unwrap();
        // Inserting a third crosses the cap; the cheapest goes.
        pool.insert(entry(3, 500, 100, vec![OutPoint::new([3u8; 32], 0)]))
            .unwrap();
        assert!(!pool.contains(&[1u8; 32]));
        assert!(pool.contains(&[2u8; 32]));
        assert!(pool.contains(&[3u8; 32]));
        assert!(pool.bytes() <= 250);
    }

    #[test]
    fn remove_clears_spent_index() {
        let mut pool = Mempool::new(1 << 20);
        let outpoint = OutPoint::new([1u8; 32], 0);
        pool.insert(entry(10, 100, 100, vec![outpoint])).unwrap();
        assert!(pool.is_spent(&outpoint));
        pool.remove(&[10u8; 32]);
        assert!(!pool.is_spent(&outpoint));
        assert_eq!(pool.bytes(), 0);
    }
}
