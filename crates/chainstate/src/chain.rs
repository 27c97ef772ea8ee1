//! The chain orchestrator.
//!
//! `add` is the single entry point for candidate blocks arriving from
//! untrusted peers. Blocks are verified non-contextually, matched to
//! their parent (or parked as orphans), placed by cumulative work, and
//! either committed to the tip, stored on a side chain, or used to
//! trigger a reorganization.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Instant;

use bitcoind_consensus::constants::{
    COINBASE_MATURITY, LOCK_MEDIAN_TIME_PAST, LOCK_VERIFY_SEQUENCE, MAX_BLOCK_SIGOPS_COST,
    MAX_BLOCK_WEIGHT, MAX_TIME_DRIFT, SEQUENCE_DISABLE_FLAG, SEQUENCE_GRANULARITY, SEQUENCE_MASK,
    SEQUENCE_TYPE_FLAG, VERSION_TOP_BITS, VERSION_TOP_MASK,
};
use bitcoind_consensus::money::money_range;
use bitcoind_consensus::{
    block_subsidy, hash256_to_hex, Bip9Deployment, ChainParams, ConsensusParams, ErrorKind,
    Hash256, VerifyError,
};
use bitcoind_pow::get_next_work_required;
use bitcoind_primitives::transaction::Transaction;
use bitcoind_primitives::Block;
use bitcoind_script::interpreter::verify_script;
use bitcoind_script::sigops::tx_sigops_cost;
use bitcoind_script::{
    VERIFY_CHECKLOCKTIMEVERIFY, VERIFY_CHECKSEQUENCEVERIFY, VERIFY_DERSIG, VERIFY_NULLDUMMY,
    VERIFY_P2SH, VERIFY_WITNESS,
};
use bitcoind_storage::KeyValueStore;
use primitive_types::U256;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::coins::CoinView;
use crate::db::ChainDB;
use crate::deployment::{DeploymentState, ThresholdState};
use crate::entry::ChainEntry;
use crate::error::ChainError;
use crate::events::ChainEvent;
use crate::locker::Locker;
use crate::metrics::ConnectMetrics;
use crate::timedata::TimeData;
use crate::validation::check_block_sanity;

const INVALID_CACHE_CAPACITY: usize = 100;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainOptions {
    /// Headers-only mode: reorganizations reset to the fork instead of
    /// undoing coins.
    pub spv: bool,
    /// Enforce hard-coded checkpoints until synced.
    pub checkpoints: bool,
    /// Orphan blocks retained while waiting for parents.
    pub max_orphans: usize,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            spv: false,
            checkpoints: true,
            max_orphans: 20,
        }
    }
}

#[derive(Default)]
struct OrphanStore {
    by_hash: HashMap<Hash256, Arc<Block>>,
    // Secondary index: parent hash to orphan hash.
    by_prev: HashMap<Hash256, Hash256>,
}

impl OrphanStore {
    fn has(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    fn insert(&mut self, block: Arc<Block>) {
        let hash = block.hash();
        let prev = block.header.prev_block;
        if let Some(replaced) = self.by_prev.insert(prev, hash) {
            self.by_hash.remove(&replaced);
        }
        self.by_hash.insert(hash, block);
    }

    fn take_by_prev(&mut self, parent: &Hash256) -> Option<Arc<Block>> {
        let hash = self.by_prev.remove(parent)?;
        self.by_hash.remove(&hash)
    }

    fn len(&self) -> usize {
        self.by_hash.len()
    }

    fn clear(&mut self) -> usize {
        let count = self.by_hash.len();
        self.by_hash.clear();
        self.by_prev.clear();
        count
    }
}

struct LruSet {
    set: std::collections::HashSet<Hash256>,
    order: std::collections::VecDeque<Hash256>,
    capacity: usize,
}

impl LruSet {
    fn new(capacity: usize) -> Self {
        Self {
            set: std::collections::HashSet::new(),
            order: std::collections::VecDeque::new(),
            capacity,
        }
    }

    fn contains(&self, hash: &Hash256) -> bool {
        self.set.contains(hash)
    }

    fn insert(&mut self, hash: Hash256) {
        if !self.set.insert(hash) {
            return;
        }
        self.order.push_back(hash);
        while self.set.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
    }
}

struct ScriptCheck {
    tx_index: usize,
    input_index: usize,
    script_pubkey: Vec<u8>,
    value: i64,
}

pub struct Chain<S> {
    db: ChainDB<S>,
    params: ConsensusParams,
    options: ChainOptions,
    locker: Locker,
    time: Arc<TimeData>,
    tip: RwLock<Arc<ChainEntry>>,
    state: RwLock<DeploymentState>,
    orphans: StdMutex<OrphanStore>,
    invalid: StdMutex<LruSet>,
    synced: AtomicBool,
    checkpoints_enabled: AtomicBool,
    events: broadcast::Sender<ChainEvent>,
    metrics: ConnectMetrics,
}

impl<S: KeyValueStore> Chain<S> {
    pub fn open(
        store: Arc<S>,
        params: ChainParams,
        options: ChainOptions,
    ) -> Result<Self, ChainError> {
        let params = params.consensus;
        let db = ChainDB::open(store, params.clone())?;
        let tip = db.get_tip()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let chain = Self {
            db,
            checkpoints_enabled: AtomicBool::new(options.checkpoints),
            options,
            params,
            locker: Locker::new(),
            time: Arc::new(TimeData::new()),
            tip: RwLock::new(tip),
            state: RwLock::new(DeploymentState::default()),
            orphans: StdMutex::new(OrphanStore::default()),
            invalid: StdMutex::new(LruSet::new(INVALID_CACHE_CAPACITY)),
            synced: AtomicBool::new(false),
            events,
            metrics: ConnectMetrics::default(),
        };
        let state = chain.deployment_state_at_tip()?;
        *chain.state.write().expect("state lock") = state;
        chain.maybe_sync();
        Ok(chain)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    pub fn db(&self) -> &ChainDB<S> {
        &self.db
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn time(&self) -> &TimeData {
        &self.time
    }

    pub fn metrics(&self) -> &ConnectMetrics {
        &self.metrics
    }

    pub fn tip(&self) -> Arc<ChainEntry> {
        self.tip.read().expect("tip lock").clone()
    }

    pub fn height(&self) -> i32 {
        self.tip().height
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Relaxed)
    }

    /// Deployment state at the current tip.
    pub fn deployment_state(&self) -> DeploymentState {
        *self.state.read().expect("state lock")
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn has_orphan(&self, hash: &Hash256) -> bool {
        self.orphans.lock().map(|o| o.has(hash)).unwrap_or(false)
    }

    pub fn has_pending(&self, hash: &Hash256) -> bool {
        self.locker.has_pending(hash)
    }

    /// Mark a hash permanently invalid.
    pub fn invalidate(&self, hash: Hash256) {
        self.set_invalid(hash);
    }

    /// Rough sync progress from timestamps alone.
    pub fn get_progress(&self) -> f64 {
        let tip = self.tip();
        let genesis = self.params.genesis_time as f64;
        let now = self.time.now() as f64;
        if now <= genesis {
            return 1.0;
        }
        ((tip.time as f64 - genesis) / (now - genesis)).clamp(0.0, 1.0)
    }

    /// Ingest one candidate block. Serialized on the chain lock keyed by
    /// block hash: a concurrent resubmission of the same hash fails fast
    /// as a duplicate.
    pub async fn add(&self, block: Block) -> Result<Arc<ChainEntry>, ChainError> {
        let hash = block.hash();
        let _guard = self.locker.lock(Some(hash)).await?;
        let entry = self.insert(Arc::new(block))?;
        self.resolve_orphans(entry.hash);
        self.maybe_sync();
        Ok(entry)
    }

    /// Rewind the main chain to `height`.
    pub async fn reset(&self, height: i32) -> Result<Arc<ChainEntry>, ChainError> {
        let _guard = self.locker.lock(None).await?;
        let target = self
            .db
            .get_entry_by_height(height)?
            .ok_or(ChainError::MissingEntry)?;
        let tip = self.db.reset(&target.hash)?;
        *self.tip.write().expect("tip lock") = tip.clone();
        let state = self.deployment_state_at_tip()?;
        *self.state.write().expect("state lock") = state;
        self.synced.store(false, Ordering::Relaxed);
        self.emit(ChainEvent::Reset(tip.clone()));
        self.maybe_sync();
        Ok(tip)
    }

    /// Rewind to just before `height` and re-validate the stored block
    /// at that height.
    pub async fn replay(&self, height: i32) -> Result<Arc<ChainEntry>, ChainError> {
        let target = self
            .db
            .get_entry_by_height(height)?
            .ok_or(ChainError::MissingEntry)?;
        if target.is_genesis() {
            return self.reset(0).await;
        }
        let block = self
            .db
            .get_block(&target.hash)?
            .ok_or(ChainError::MissingBlock)?;
        self.reset(target.height - 1).await?;
        let _guard = self.locker.lock(Some(target.hash)).await?;
        self.insert(Arc::new(block))
    }

    /// Walk main-chain blocks from `start` (a height, or the tip of the
    /// walk when `None` means genesis), handing each entry and its
    /// filter-matched transactions to `iter`.
    pub async fn scan<F, I>(&self, start: Option<i32>, filter: F, mut iter: I) -> Result<(), ChainError>
    where
        F: Fn(&Transaction) -> bool,
        I: FnMut(Arc<ChainEntry>, Vec<Transaction>) -> Result<(), ChainError>,
    {
        let _guard = self.locker.lock(None).await?;
        let tip = self.tip();
        let start = start.unwrap_or(0).max(0);
        for height in start..=tip.height {
            let entry = self
                .db
                .get_entry_by_height(height)?
                .ok_or(ChainError::MissingEntry)?;
            let block = self
                .db
                .get_block(&entry.hash)?
                .ok_or(ChainError::MissingBlock)?;
            let matched: Vec<Transaction> = block
                .transactions
                .iter()
                .filter(|tx| filter(tx))
                .cloned()
                .collect();
            iter(entry, matched)?;
        }
        Ok(())
    }

    fn insert(&self, block: Arc<Block>) -> Result<Arc<ChainEntry>, ChainError> {
        let hash = block.hash();

        if hash == self.params.genesis_hash {
            return Err(VerifyError::duplicate("duplicate", 0).into());
        }
        if self.has_orphan(&hash) {
            return Err(VerifyError::duplicate("duplicate-orphan", 0).into());
        }
        if self.has_invalid(&hash, &block.header.prev_block) {
            return Err(VerifyError::duplicate("duplicate", 100).into());
        }

        if let Err(err) = check_block_sanity(&block, self.time.now(), &self.params) {
            let err = ChainError::from(err);
            self.handle_verify_failure(&hash, -1, &err);
            return Err(err);
        }

        if self.db.has_entry(&hash)? {
            self.emit(ChainEvent::Exists(hash));
            return Err(VerifyError::duplicate("duplicate", 0).into());
        }

        let Some(prev) = self.db.get_entry(&block.header.prev_block)? else {
            self.store_orphan(block);
            return Err(VerifyError::invalid("bad-prevblk", 0).into());
        };

        if !self.verify_checkpoint(&prev, &hash) {
            return Err(
                VerifyError::new(ErrorKind::Checkpoint, "checkpoint mismatch", 100).into(),
            );
        }

        let mut entry = ChainEntry::from_block(&block, Some(&prev))?;
        self.db.fill_skip(&mut entry, &prev)?;
        let entry = Arc::new(entry);

        if entry.chainwork_value() <= self.tip().chainwork_value() {
            // First seen wins ties: equal work stays a competitor.
            self.save_alternate(&entry, &block, &prev)?;
        } else {
            self.set_best_chain(entry.clone(), block, prev)?;
        }
        Ok(entry)
    }

    /// Connect orphans whose parent just appeared, chaining through any
    /// orphans of orphans. A failing orphan surfaces as an event, not as
    /// an error of the original `add`.
    fn resolve_orphans(&self, mut parent: Hash256) {
        loop {
            let orphan = match self.orphans.lock() {
                Ok(mut orphans) => orphans.take_by_prev(&parent),
                Err(_) => None,
            };
            let Some(block) = orphan else {
                break;
            };
            self.emit(ChainEvent::Resolved {
                block: block.clone(),
            });
            self.metrics.record_orphan_resolved();
            match self.insert(block) {
                Ok(entry) => parent = entry.hash,
                Err(err) => {
                    eprintln!("orphan resolution failed: {err}");
                    self.emit(ChainEvent::Error(err.to_string()));
                    break;
                }
            }
        }
    }

    fn save_alternate(
        &self,
        entry: &Arc<ChainEntry>,
        block: &Arc<Block>,
        prev: &Arc<ChainEntry>,
    ) -> Result<(), ChainError> {
        let state = self.get_deployments(block.header.time as i64, prev)?;
        if let Err(err) = self.verify(block, prev, &state) {
            self.handle_verify_failure(&entry.hash, entry.height, &err);
            return Err(err);
        }
        self.db.save(entry, block, None)?;
        eprintln!(
            "competing chain at height {}: {}",
            entry.height,
            hash256_to_hex(&entry.hash)
        );
        self.emit(ChainEvent::Competitor {
            entry: entry.clone(),
            block: block.clone(),
        });
        self.emit(ChainEvent::Block {
            block: block.clone(),
            entry: entry.clone(),
        });
        Ok(())
    }

    fn set_best_chain(
        &self,
        entry: Arc<ChainEntry>,
        block: Arc<Block>,
        prev: Arc<ChainEntry>,
    ) -> Result<(), ChainError> {
        let tip = self.tip();
        if entry.prev_block != tip.hash {
            eprintln!(
                "WARNING: reorganizing to {} at height {}",
                hash256_to_hex(&entry.hash),
                entry.height
            );
            self.metrics.record_reorg();
            self.emit(ChainEvent::Reorganize {
                old_tip: tip,
                new_tip: entry.clone(),
            });
            self.reorganize(&prev)?;
        }

        let (view, state) = match self.verify_context(&block, &prev) {
            Ok(result) => result,
            Err(err) => {
                self.handle_verify_failure(&entry.hash, entry.height, &err);
                return Err(err);
            }
        };

        let commit_start = Instant::now();
        self.db.save(&entry, &block, Some(&view))?;
        self.metrics.record_commit(commit_start.elapsed());

        *self.tip.write().expect("tip lock") = entry.clone();
        *self.state.write().expect("state lock") = state;

        self.emit(ChainEvent::Connect {
            entry: entry.clone(),
            block: block.clone(),
        });
        self.emit(ChainEvent::Block {
            block,
            entry: entry.clone(),
        });
        self.emit(ChainEvent::Tip(entry));
        Ok(())
    }

    /// Switch the main chain to the branch ending at `competitor` (the
    /// parent of a new heaviest block). On a roll-forward failure the
    /// chain is left at the fork and the error surfaces to the caller.
    fn reorganize(&self, competitor: &Arc<ChainEntry>) -> Result<(), ChainError> {
        let tip = self.tip();
        let fork = self.find_fork(&tip, competitor)?;

        let mut entry = tip;
        while entry.hash != fork.hash {
            self.disconnect_tip(&entry)?;
            entry = self
                .db
                .get_entry(&entry.prev_block)?
                .ok_or(ChainError::MissingEntry)?;
        }

        let mut connect = Vec::new();
        let mut walk = competitor.clone();
        while walk.hash != fork.hash {
            connect.push(walk.clone());
            walk = self
                .db
                .get_entry(&walk.prev_block)?
                .ok_or(ChainError::MissingEntry)?;
        }

        for entry in connect.iter().rev() {
            if let Err(err) = self.reconnect_entry(entry) {
                let mut tip = self.tip();
                while tip.hash != fork.hash {
                    self.disconnect_tip(&tip)?;
                    tip = self.tip();
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn disconnect_tip(&self, entry: &Arc<ChainEntry>) -> Result<(), ChainError> {
        let block = self
            .db
            .get_block(&entry.hash)?
            .ok_or(ChainError::MissingBlock)?;
        if self.options.spv {
            // Headers-only mode tracks no coins; there is nothing to
            // undo.
            self.db.remove_main(entry)?;
        } else {
            self.db.disconnect(entry, &block)?;
        }
        let prev = self
            .db
            .get_entry(&entry.prev_block)?
            .ok_or(ChainError::MissingEntry)?;
        *self.tip.write().expect("tip lock") = prev;
        self.emit(ChainEvent::Disconnect {
            entry: entry.clone(),
            block: Arc::new(block),
        });
        Ok(())
    }

    /// Re-validate and connect a side-chain block during a
    /// reorganization. This is the first time alternate-chain blocks see
    /// full input validation.
    fn reconnect_entry(&self, entry: &Arc<ChainEntry>) -> Result<(), ChainError> {
        let block = self
            .db
            .get_block(&entry.hash)?
            .ok_or(ChainError::MissingBlock)?;
        let block = Arc::new(block);
        let prev = self
            .db
            .get_entry(&entry.prev_block)?
            .ok_or(ChainError::MissingEntry)?;
        let (view, state) = match self.verify_context(&block, &prev) {
            Ok(result) => result,
            Err(err) => {
                self.handle_verify_failure(&entry.hash, entry.height, &err);
                return Err(err);
            }
        };
        self.db.reconnect(entry, &block, &view)?;
        *self.tip.write().expect("tip lock") = entry.clone();
        *self.state.write().expect("state lock") = state;
        self.emit(ChainEvent::Reconnect {
            entry: entry.clone(),
            block: block.clone(),
        });
        self.emit(ChainEvent::Connect {
            entry: entry.clone(),
            block,
        });
        self.emit(ChainEvent::Tip(entry.clone()));
        Ok(())
    }

    /// Lowest common ancestor of two entries.
    fn find_fork(
        &self,
        a: &Arc<ChainEntry>,
        b: &Arc<ChainEntry>,
    ) -> Result<Arc<ChainEntry>, ChainError> {
        let mut a = a.clone();
        let mut b = b.clone();
        if a.height > b.height {
            a = self.db.get_ancestor(&a, b.height)?;
        } else if b.height > a.height {
            b = self.db.get_ancestor(&b, a.height)?;
        }
        while a.hash != b.hash {
            if a.is_genesis() || b.is_genesis() {
                return Err(ChainError::Corrupt("chains do not intersect"));
            }
            a = self
                .db
                .get_entry(&a.prev_block)?
                .ok_or(ChainError::MissingEntry)?;
            b = self
                .db
                .get_entry(&b.prev_block)?
                .ok_or(ChainError::MissingEntry)?;
        }
        Ok(a)
    }

    // ---- contextual verification ----------------------------------

    fn verify_context(
        &self,
        block: &Arc<Block>,
        prev: &Arc<ChainEntry>,
    ) -> Result<(CoinView, DeploymentState), ChainError> {
        let state = self.get_deployments(block.header.time as i64, prev)?;
        self.verify(block, prev, &state)?;
        if self.options.spv {
            // Headers-only mode stops short of the coin set.
            return Ok((CoinView::new(), state));
        }
        self.verify_duplicates(block, prev)?;
        let view = self.verify_inputs(block, prev, &state)?;
        Ok((view, state))
    }

    /// Contextual header and transaction-level checks; everything short
    /// of spending inputs.
    fn verify(
        &self,
        block: &Block,
        prev: &Arc<ChainEntry>,
        state: &DeploymentState,
    ) -> Result<(), ChainError> {
        let header = &block.header;
        let height = prev.height + 1;

        let bits = self.get_target(header.time as i64, Some(prev))?;
        if header.bits != bits {
            return Err(VerifyError::invalid("bad-diffbits", 100).into());
        }

        let mtp = self.db.median_time_past(prev)?;
        if (header.time as i64) <= mtp {
            return Err(VerifyError::invalid("time-too-old", 0).into());
        }
        if (header.time as i64) > self.time.now() + MAX_TIME_DRIFT {
            return Err(VerifyError::invalid("time-too-new", 0).malleated().into());
        }

        if (header.version < 2 && height >= self.params.bip34_height)
            || (header.version < 3 && height >= self.params.bip66_height)
            || (header.version < 4 && height >= self.params.bip65_height)
        {
            return Err(VerifyError::obsolete("bad-version").into());
        }

        let lock_time = if state.has_mtp() { mtp } else { header.time as i64 };
        for tx in &block.transactions {
            if !tx.is_final(height, lock_time) {
                return Err(VerifyError::invalid("bad-txns-nonfinal", 10).into());
            }
        }

        if state.bip34 && block.coinbase_height() != height {
            return Err(VerifyError::invalid("bad-cb-height", 100).into());
        }

        if state.has_witness() {
            if let Some(commitment) = block.witness_commitment() {
                let Some(nonce) = block.witness_nonce() else {
                    return Err(VerifyError::invalid("bad-witness-nonce-size", 100)
                        .malleated()
                        .into());
                };
                if block.commitment_hash(&nonce) != commitment {
                    return Err(VerifyError::invalid("bad-witness-merkle-match", 100)
                        .malleated()
                        .into());
                }
            } else if block.has_witness_data() {
                return Err(VerifyError::invalid("unexpected-witness", 100)
                    .malleated()
                    .into());
            }
        } else if block.has_witness_data() {
            return Err(VerifyError::invalid("unexpected-witness", 100)
                .malleated()
                .into());
        }

        if block.weight() > MAX_BLOCK_WEIGHT {
            return Err(VerifyError::invalid("bad-blk-weight", 100).into());
        }

        Ok(())
    }

    /// BIP30: reject a transaction whose txid still has unspent coins,
    /// outside the two historical exception blocks.
    fn verify_duplicates(&self, block: &Block, prev: &Arc<ChainEntry>) -> Result<(), ChainError> {
        let height = prev.height + 1;
        for tx in &block.transactions {
            if !self.db.has_coins(&tx.txid())? {
                continue;
            }
            if self.params.bip30_exception(height, &block.hash()) {
                continue;
            }
            return Err(VerifyError::invalid("bad-txns-BIP30", 100).into());
        }
        Ok(())
    }

    /// Spend every transaction of the block through a fresh view,
    /// enforcing sequence locks, sigop cost, value conservation and
    /// scripts. Script checks fan out over the rayon pool and are
    /// collected at the end.
    fn verify_inputs(
        &self,
        block: &Arc<Block>,
        prev: &Arc<ChainEntry>,
        state: &DeploymentState,
    ) -> Result<CoinView, ChainError> {
        let height = prev.height + 1;
        let historical = self.is_historical(prev);
        let mut view = CoinView::new();
        let mut sigops = 0u64;
        let mut fees = 0i64;
        let mut checks: Vec<ScriptCheck> = Vec::new();

        let spend_start = Instant::now();
        for (index, tx) in block.transactions.iter().enumerate() {
            if index > 0 {
                if !view.spend_inputs(self.db.utxos(), tx)? {
                    return Err(
                        VerifyError::invalid("bad-txns-inputs-missingorspent", 100).into(),
                    );
                }
                if !historical && !self.verify_locks(prev, tx, &view, state.lock_flags)? {
                    return Err(VerifyError::invalid("bad-txns-nonfinal", 10).into());
                }
            }

            if !historical {
                sigops += tx_sigops_cost(tx, state.script_flags, |outpoint| {
                    view.get_entry(outpoint)
                        .map(|entry| entry.coin.script_pubkey.clone())
                });
                if sigops > MAX_BLOCK_SIGOPS_COST {
                    return Err(VerifyError::invalid("bad-blk-sigops", 100).into());
                }
            }

            if index > 0 {
                let fee = check_tx_inputs(tx, &view, height)?;
                fees = fees
                    .checked_add(fee)
                    .ok_or_else(|| VerifyError::invalid("bad-txns-fee-outofrange", 100))?;

                if !historical && state.script_flags != 0 {
                    for (input_index, input) in tx.vin.iter().enumerate() {
                        let entry = view
                            .get_entry(&input.prevout)
                            .ok_or(ChainError::Corrupt("spent coin vanished from view"))?;
                        checks.push(ScriptCheck {
                            tx_index: index,
                            input_index,
                            script_pubkey: entry.coin.script_pubkey.clone(),
                            value: entry.coin.value,
                        });
                    }
                }
            }

            view.add_tx(tx, height);
        }
        self.metrics.record_spend(spend_start.elapsed());

        let reward = block_subsidy(height, &self.params)
            .checked_add(fees)
            .ok_or_else(|| VerifyError::invalid("bad-cb-amount", 100))?;
        if block.transactions[0].output_value() > reward {
            return Err(VerifyError::invalid("bad-cb-amount", 100).into());
        }

        if !checks.is_empty() {
            let script_start = Instant::now();
            let flags = state.script_flags;
            let result = checks.par_iter().try_for_each(|check| {
                let tx = &block.transactions[check.tx_index];
                let input = &tx.vin[check.input_index];
                verify_script(
                    &input.script_sig,
                    &check.script_pubkey,
                    &input.witness,
                    tx,
                    check.input_index,
                    check.value,
                    flags,
                )
                .map_err(|err| (check.tx_index, check.input_index, err))
            });
            self.metrics.record_script(script_start.elapsed());
            if let Err((tx_index, input_index, err)) = result {
                eprintln!(
                    "script validation failed for tx {} input {}: {}",
                    hash256_to_hex(&block.transactions[tx_index].txid()),
                    input_index,
                    err
                );
                return Err(
                    VerifyError::invalid("mandatory-script-verify-flag-failed", 100).into(),
                );
            }
        }

        Ok(view)
    }

    /// BIP68 relative lock heights and times for one transaction.
    fn get_locks(
        &self,
        prev: &Arc<ChainEntry>,
        tx: &Transaction,
        view: &CoinView,
        lock_flags: u32,
    ) -> Result<(i32, i64), ChainError> {
        if lock_flags & LOCK_VERIFY_SEQUENCE == 0 || tx.is_coinbase() || tx.version < 2 {
            return Ok((-1, -1));
        }
        let mut min_height = -1i32;
        let mut min_time = -1i64;
        for input in &tx.vin {
            if input.sequence & SEQUENCE_DISABLE_FLAG != 0 {
                continue;
            }
            let mut coin_height = view.get_height(&input.prevout);
            if coin_height == -1 {
                coin_height = prev.height + 1;
            }
            if input.sequence & SEQUENCE_TYPE_FLAG == 0 {
                let lock = coin_height + (input.sequence & SEQUENCE_MASK) as i32 - 1;
                min_height = min_height.max(lock);
            } else {
                let ancestor = self.db.get_ancestor(prev, (coin_height - 1).max(0))?;
                let mtp = self.db.median_time_past(&ancestor)?;
                let lock =
                    mtp + (((input.sequence & SEQUENCE_MASK) as i64) << SEQUENCE_GRANULARITY) - 1;
                min_time = min_time.max(lock);
            }
        }
        Ok((min_height, min_time))
    }

    fn verify_locks(
        &self,
        prev: &Arc<ChainEntry>,
        tx: &Transaction,
        view: &CoinView,
        lock_flags: u32,
    ) -> Result<bool, ChainError> {
        let (min_height, min_time) = self.get_locks(prev, tx, view, lock_flags)?;
        if min_height >= prev.height + 1 {
            return Ok(false);
        }
        if min_time >= 0 && min_time >= self.db.median_time_past(prev)? {
            return Ok(false);
        }
        Ok(true)
    }

    // ---- difficulty -------------------------------------------------

    /// Expected compact bits for a block at `time` following `prev`.
    pub fn get_target(
        &self,
        time: i64,
        prev: Option<&Arc<ChainEntry>>,
    ) -> Result<u32, ChainError> {
        let Some(prev) = prev else {
            return Ok(self.params.pow_limit_bits);
        };
        let interval = self.params.retarget_interval;
        let window = if self.params.no_retargeting {
            1
        } else if (prev.height + 1) % interval == 0 {
            interval as usize
        } else if self.params.target_reset {
            (prev.height % interval) as usize + 1
        } else {
            1
        };
        let headers = self.db.get_retarget_headers(prev, window)?;
        get_next_work_required(&headers, Some(time), &self.params)
            .map_err(|_| ChainError::Corrupt("difficulty calculation failed"))
    }

    // ---- deployments ------------------------------------------------

    /// Rules in force for a block at `time` on top of `prev`.
    pub fn get_deployments(
        &self,
        time: i64,
        prev: &Arc<ChainEntry>,
    ) -> Result<DeploymentState, ChainError> {
        let height = prev.height + 1;
        let mut state = DeploymentState::default();

        if time >= self.params.bip16_time {
            state.script_flags |= VERIFY_P2SH;
        }
        if height >= self.params.bip34_height {
            state.bip34 = true;
        }
        if height >= self.params.bip66_height {
            state.script_flags |= VERIFY_DERSIG;
        }
        if height >= self.params.bip65_height {
            state.script_flags |= VERIFY_CHECKLOCKTIMEVERIFY;
        }
        if self.is_deployment_active(prev, "csv")? {
            state.script_flags |= VERIFY_CHECKSEQUENCEVERIFY;
            state.lock_flags |= LOCK_VERIFY_SEQUENCE | LOCK_MEDIAN_TIME_PAST;
        }
        if self.is_deployment_active(prev, "segwit")? {
            state.script_flags |= VERIFY_WITNESS | VERIFY_NULLDUMMY;
        }
        Ok(state)
    }

    pub fn is_deployment_active(
        &self,
        prev: &Arc<ChainEntry>,
        name: &str,
    ) -> Result<bool, ChainError> {
        let Some(deployment) = self.params.deployment(name).copied() else {
            return Ok(false);
        };
        Ok(self.get_bip9_state(prev, &deployment)? == ThresholdState::Active)
    }

    /// BIP9 threshold state of `deployment` for a block following
    /// `prev`. Walks back to the most recent period boundary with a
    /// cached answer, then folds forward, memoizing every boundary it
    /// visits.
    pub fn get_bip9_state(
        &self,
        prev: &Arc<ChainEntry>,
        deployment: &Bip9Deployment,
    ) -> Result<ThresholdState, ChainError> {
        let window = self.params.miner_window;
        let threshold = self.params.activation_threshold;

        let offset = (prev.height + 1) % window;
        let mut entry = if prev.height - offset < 0 {
            None
        } else {
            Some(self.db.get_ancestor(prev, prev.height - offset)?)
        };

        let mut state = ThresholdState::Defined;
        let mut compute = Vec::new();

        while let Some(current) = entry {
            if let Some(cached) = self.db.version_bits_state(deployment.bit, &current.hash) {
                state = cached;
                break;
            }
            let mtp = self.db.median_time_past(&current)?;
            if mtp < deployment.start_time {
                self.db.set_version_bits_state(
                    deployment.bit,
                    &current.hash,
                    ThresholdState::Defined,
                )?;
                break;
            }
            let next_height = current.height - window;
            compute.push(current.clone());
            entry = if next_height < 0 {
                None
            } else {
                Some(self.db.get_ancestor(&current, next_height)?)
            };
        }

        while let Some(boundary) = compute.pop() {
            match state {
                ThresholdState::Defined => {
                    let mtp = self.db.median_time_past(&boundary)?;
                    if mtp >= deployment.timeout {
                        state = ThresholdState::Failed;
                    } else if mtp >= deployment.start_time {
                        state = ThresholdState::Started;
                    }
                }
                ThresholdState::Started => {
                    let mtp = self.db.median_time_past(&boundary)?;
                    if mtp >= deployment.timeout {
                        state = ThresholdState::Failed;
                    } else {
                        let mut count = 0;
                        let mut walk = Some(boundary.clone());
                        for _ in 0..window {
                            let Some(current) = walk else { break };
                            if signals_bit(current.version, deployment.bit) {
                                count += 1;
                                if count >= threshold {
                                    state = ThresholdState::LockedIn;
                                    break;
                                }
                            }
                            walk = self.db.get_previous(&current)?;
                        }
                    }
                }
                ThresholdState::LockedIn => state = ThresholdState::Active,
                ThresholdState::Active | ThresholdState::Failed => {}
            }
            self.db
                .set_version_bits_state(deployment.bit, &boundary.hash, state)?;
        }

        Ok(state)
    }

    /// Version for a newly mined block: BIP9 top bits plus the bit of
    /// every deployment currently signaling.
    pub fn compute_block_version(&self, prev: &Arc<ChainEntry>) -> Result<i32, ChainError> {
        let mut version = VERSION_TOP_BITS;
        for deployment in &self.params.deployments {
            let state = self.get_bip9_state(prev, deployment)?;
            if matches!(state, ThresholdState::Started | ThresholdState::LockedIn) {
                version |= 1 << deployment.bit;
            }
        }
        Ok(version as i32)
    }

    fn deployment_state_at_tip(&self) -> Result<DeploymentState, ChainError> {
        let tip = self.tip();
        match self.db.get_previous(&tip)? {
            Some(prev) => self.get_deployments(tip.time as i64, &prev),
            None => Ok(DeploymentState::default()),
        }
    }

    // ---- checkpoints and sync gate ---------------------------------

    fn verify_checkpoint(&self, prev: &Arc<ChainEntry>, hash: &Hash256) -> bool {
        if !self.checkpoints_enabled.load(Ordering::Relaxed) {
            return true;
        }
        let height = prev.height + 1;
        let Some(checkpoint) = self.params.checkpoint(height) else {
            return true;
        };
        if checkpoint.hash == *hash {
            self.emit(ChainEvent::Checkpoint {
                height,
                hash: *hash,
            });
            return true;
        }
        eprintln!(
            "checkpoint mismatch at height {}: got {}, expected {}",
            height,
            hash256_to_hex(hash),
            hash256_to_hex(&checkpoint.hash)
        );
        self.purge_orphans();
        self.emit(ChainEvent::Fork {
            height,
            hash: *hash,
            expected: checkpoint.hash,
        });
        false
    }

    /// Blocks buried under the last checkpoint skip signature and
    /// sequence checks.
    fn is_historical(&self, prev: &Arc<ChainEntry>) -> bool {
        self.checkpoints_enabled.load(Ordering::Relaxed)
            && prev.height + 1 <= self.params.last_checkpoint
    }

    /// Synced once chainwork reaches the network minimum, the tip is
    /// recent, and the last checkpoint is behind us. Checkpoints are
    /// disabled from then on.
    fn maybe_sync(&self) {
        if self.synced.load(Ordering::Relaxed) {
            return;
        }
        let tip = self.tip();
        if self.checkpoints_enabled.load(Ordering::Relaxed)
            && tip.height < self.params.last_checkpoint
        {
            return;
        }
        if (tip.time as i64) < self.time.now() - self.params.max_tip_age {
            return;
        }
        if tip.chainwork_value() < U256::from_big_endian(&self.params.min_chainwork) {
            return;
        }
        self.synced.store(true, Ordering::Relaxed);
        self.checkpoints_enabled.store(false, Ordering::Relaxed);
        self.emit(ChainEvent::Full);
    }

    // ---- orphans and the invalid cache ------------------------------

    fn store_orphan(&self, block: Arc<Block>) {
        let over_limit = match self.orphans.lock() {
            Ok(mut orphans) => {
                orphans.insert(block.clone());
                orphans.len() > self.options.max_orphans
            }
            Err(_) => false,
        };
        if over_limit {
            self.prune_orphans();
        }
        self.emit(ChainEvent::Orphan { block });
    }

    /// Evict orphans down to the one with the highest coinbase height,
    /// the likeliest hint of where the peer's tip is. Falls back to the
    /// last iterated orphan when no height commitment is readable.
    fn prune_orphans(&self) {
        let removed = match self.orphans.lock() {
            Ok(mut orphans) => {
                let mut best: Option<(i32, Hash256)> = None;
                let mut last: Option<Hash256> = None;
                for (hash, block) in orphans.by_hash.iter() {
                    let height = block.coinbase_height();
                    last = Some(*hash);
                    if best.map_or(true, |(best_height, _)| height > best_height) {
                        best = Some((height, *hash));
                    }
                }
                let keep = match best {
                    Some((height, hash)) if height > 0 => Some(hash),
                    _ => last,
                };
                let Some(keep) = keep else {
                    return;
                };
                let Some(block) = orphans.by_hash.get(&keep).cloned() else {
                    return;
                };
                let removed = orphans.clear() - 1;
                orphans.insert(block);
                removed
            }
            Err(_) => return,
        };
        if removed > 0 {
            self.emit(ChainEvent::Purge { count: removed });
        }
    }

    fn purge_orphans(&self) {
        let count = match self.orphans.lock() {
            Ok(mut orphans) => orphans.clear(),
            Err(_) => 0,
        };
        if count > 0 {
            self.emit(ChainEvent::Purge { count });
        }
    }

    /// A hash is rejected if it or its parent is known bad; contact with
    /// a bad parent poisons the child.
    fn has_invalid(&self, hash: &Hash256, prev: &Hash256) -> bool {
        let Ok(mut invalid) = self.invalid.lock() else {
            return false;
        };
        if invalid.contains(hash) {
            return true;
        }
        if invalid.contains(prev) {
            invalid.insert(*hash);
            return true;
        }
        false
    }

    fn set_invalid(&self, hash: Hash256) {
        if let Ok(mut invalid) = self.invalid.lock() {
            invalid.insert(hash);
        }
    }

    fn handle_verify_failure(&self, hash: &Hash256, height: i32, err: &ChainError) {
        let Some(verify) = err.verify_error() else {
            return;
        };
        eprintln!(
            "invalid block {} at height {}: {}",
            hash256_to_hex(hash),
            height,
            verify
        );
        // Malleated failures stay out of the cache: the peer may have
        // mutated a block that is valid in its honest form.
        if !verify.malleated {
            self.set_invalid(*hash);
        }
        self.emit(ChainEvent::Invalid {
            hash: *hash,
            reason: verify.reason,
        });
    }

    fn emit(&self, event: ChainEvent) {
        let _ = self.events.send(event);
    }
}

/// Value conservation and coinbase maturity for one transaction whose
/// inputs were just spent through `view`. Returns the fee.
fn check_tx_inputs(tx: &Transaction, view: &CoinView, height: i32) -> Result<i64, VerifyError> {
    let mut total_in = 0i64;
    for input in &tx.vin {
        let entry = view
            .get_entry(&input.prevout)
            .ok_or_else(|| VerifyError::invalid("bad-txns-inputs-missingorspent", 100))?;
        let coin = &entry.coin;
        if coin.coinbase && height - coin.height < COINBASE_MATURITY {
            return Err(VerifyError::invalid(
                "bad-txns-premature-spend-of-coinbase",
                0,
            ));
        }
        if !money_range(coin.value) {
            return Err(VerifyError::invalid("bad-txns-inputvalues-outofrange", 100));
        }
        total_in = total_in
            .checked_add(coin.value)
            .ok_or_else(|| VerifyError::invalid("bad-txns-inputvalues-outofrange", 100))?;
        if !money_range(total_in) {
            return Err(VerifyError::invalid("bad-txns-inputvalues-outofrange", 100));
        }
    }

    let mut total_out = 0i64;
    for output in &tx.vout {
        total_out = total_out
            .checked_add(output.value)
            .ok_or_else(|| VerifyError::invalid("bad-txns-txouttotal-toolarge", 100))?;
    }
    if total_in < total_out {
        return Err(VerifyError::invalid("bad-txns-in-belowout", 100));
    }
    let fee = total_in - total_out;
    if !money_range(fee) {
        return Err(VerifyError::invalid("bad-txns-fee-outofrange", 100));
    }
    Ok(fee)
}

fn signals_bit(version: i32, bit: u8) -> bool {
    let version = version as u32;
    version & VERSION_TOP_MASK == VERSION_TOP_BITS && version & (1 << bit) != 0
}
