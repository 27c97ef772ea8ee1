//! The chain database: block index, bodies, coin set and state cache.
//!
//! All writes for one logical operation land in a single batch, so a
//! crash can never observe a half-committed block connection.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bitcoind_consensus::{ConsensusParams, Hash256};
use bitcoind_pow::HeaderInfo;
use bitcoind_primitives::outpoint::OutPoint;
use bitcoind_primitives::transaction::Transaction;
use bitcoind_primitives::Block;
use bitcoind_storage::{Column, KeyValueStore, WriteBatch};

use crate::coins::{Coin, CoinView, UndoData, UtxoSet};
use crate::deployment::ThresholdState;
use crate::entry::{skip_height, ChainEntry};
use crate::error::ChainError;
use crate::genesis::genesis_block;

const TIP_KEY: &[u8] = b"tip";
const ENTRY_CACHE_CAPACITY: usize = 100_000;

struct EntryCache {
    entries: HashMap<Hash256, Arc<ChainEntry>>,
    order: VecDeque<Hash256>,
    capacity: usize,
}

impl EntryCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, hash: &Hash256) -> Option<Arc<ChainEntry>> {
        self.entries.get(hash).cloned()
    }

    fn insert(&mut self, hash: Hash256, entry: Arc<ChainEntry>) {
        if self.entries.insert(hash, entry).is_some() {
            return;
        }
        self.order.push_back(hash);
        if self.entries.len() > self.capacity {
            while let Some(evicted) = self.order.pop_front() {
                if self.entries.remove(&evicted).is_some() {
                    break;
                }
            }
        }
    }

    fn remove(&mut self, hash: &Hash256) {
        self.entries.remove(hash);
    }
}

pub struct ChainDB<S> {
    store: Arc<S>,
    utxos: UtxoSet<Arc<S>>,
    params: ConsensusParams,
    entry_cache: Mutex<EntryCache>,
    state_cache: Mutex<HashMap<(u8, Hash256), ThresholdState>>,
    tip: Mutex<Option<Arc<ChainEntry>>>,
}

impl<S: KeyValueStore> ChainDB<S> {
    /// Open the database, writing the genesis block on first use.
    pub fn open(store: Arc<S>, params: ConsensusParams) -> Result<Self, ChainError> {
        let db = Self {
            utxos: UtxoSet::new(Arc::clone(&store)),
            store,
            params,
            entry_cache: Mutex::new(EntryCache::new(ENTRY_CACHE_CAPACITY)),
            state_cache: Mutex::new(HashMap::new()),
            tip: Mutex::new(None),
        };
        db.load_state_cache()?;
        if db.store.get(Column::Meta, TIP_KEY)?.is_none() {
            db.save_genesis()?;
        }
        Ok(db)
    }

    fn save_genesis(&self) -> Result<(), ChainError> {
        let block = genesis_block(&self.params);
        let entry = Arc::new(ChainEntry::from_block(&block, None)?);
        // Genesis outputs are not spendable; an empty view still writes
        // the height index and tip pointer.
        self.save(&entry, &block, Some(&CoinView::new()))
    }

    fn load_state_cache(&self) -> Result<(), ChainError> {
        let mut cache = self
            .state_cache
            .lock()
            .map_err(|_| ChainError::Corrupt("state cache lock poisoned"))?;
        for (key, value) in self.store.scan_prefix(Column::VersionBits, &[])? {
            if key.len() != 33 || value.len() != 1 {
                return Err(ChainError::Corrupt("malformed version bits entry"));
            }
            let bit = key[0];
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&key[1..]);
            let state = ThresholdState::from_u8(value[0])
                .ok_or(ChainError::Corrupt("unknown threshold state"))?;
            cache.insert((bit, hash), state);
        }
        Ok(())
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn utxos(&self) -> &UtxoSet<Arc<S>> {
        &self.utxos
    }

    pub fn get_tip(&self) -> Result<Arc<ChainEntry>, ChainError> {
        if let Ok(tip) = self.tip.lock() {
            if let Some(tip) = tip.as_ref() {
                return Ok(tip.clone());
            }
        }
        let bytes = self
            .store
            .get(Column::Meta, TIP_KEY)?
            .ok_or(ChainError::Corrupt("missing tip pointer"))?;
        if bytes.len() != 32 {
            return Err(ChainError::Corrupt("malformed tip pointer"));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes);
        let entry = self.get_entry(&hash)?.ok_or(ChainError::MissingEntry)?;
        if let Ok(mut tip) = self.tip.lock() {
            *tip = Some(entry.clone());
        }
        Ok(entry)
    }

    pub fn has_entry(&self, hash: &Hash256) -> Result<bool, ChainError> {
        if let Ok(cache) = self.entry_cache.lock() {
            if cache.get(hash).is_some() {
                return Ok(true);
            }
        }
        Ok(self.store.get(Column::BlockIndex, hash)?.is_some())
    }

    pub fn get_entry(&self, hash: &Hash256) -> Result<Option<Arc<ChainEntry>>, ChainError> {
        if let Ok(cache) = self.entry_cache.lock() {
            if let Some(entry) = cache.get(hash) {
                return Ok(Some(entry));
            }
        }
        let Some(bytes) = self.store.get(Column::BlockIndex, hash)? else {
            return Ok(None);
        };
        let entry = Arc::new(ChainEntry::decode(*hash, &bytes)?);
        if let Ok(mut cache) = self.entry_cache.lock() {
            cache.insert(*hash, entry.clone());
        }
        Ok(Some(entry))
    }

    pub fn get_entry_by_height(&self, height: i32) -> Result<Option<Arc<ChainEntry>>, ChainError> {
        if height < 0 {
            return Ok(None);
        }
        let Some(bytes) = self.store.get(Column::HeightIndex, &height_key(height))? else {
            return Ok(None);
        };
        if bytes.len() != 32 {
            return Err(ChainError::Corrupt("malformed height index entry"));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes);
        self.get_entry(&hash)
    }

    /// Main-chain membership is a database property: the height index
    /// maps each main-chain height to exactly one hash.
    pub fn is_main_chain(&self, entry: &ChainEntry) -> Result<bool, ChainError> {
        match self.get_entry_by_height(entry.height)? {
            Some(main) => Ok(main.hash == entry.hash),
            None => Ok(false),
        }
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainError> {
        let Some(bytes) = self.store.get(Column::Block, hash)? else {
            return Ok(None);
        };
        Ok(Some(Block::consensus_decode(&bytes)?))
    }

    /// Does any output of `txid` remain unspent? This is the BIP30
    /// duplicate-txid probe.
    pub fn has_coins(&self, txid: &Hash256) -> Result<bool, ChainError> {
        Ok(!self.store.scan_prefix(Column::Utxo, txid)?.is_empty())
    }

    pub fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainError> {
        Ok(self.utxos.get(outpoint)?)
    }

    /// A view with the coins spent by `tx` prefetched.
    pub fn get_coin_view(&self, tx: &Transaction) -> Result<CoinView, ChainError> {
        let mut view = CoinView::new();
        for input in &tx.vin {
            view.read_coin(&self.utxos, &input.prevout)?;
        }
        Ok(view)
    }

    pub fn get_previous(
        &self,
        entry: &ChainEntry,
    ) -> Result<Option<Arc<ChainEntry>>, ChainError> {
        if entry.is_genesis() {
            return Ok(None);
        }
        self.get_entry(&entry.prev_block)
    }

    /// Ancestor of `entry` at `height`, via the skip pointers in
    /// O(log n) lookups.
    pub fn get_ancestor(
        &self,
        entry: &Arc<ChainEntry>,
        height: i32,
    ) -> Result<Arc<ChainEntry>, ChainError> {
        if height < 0 || height > entry.height {
            return Err(ChainError::Corrupt("ancestor height out of range"));
        }
        let mut walk = entry.clone();
        while walk.height > height {
            let from_skip = skip_height(walk.height);
            let from_prev = skip_height(walk.height - 1);
            let take_skip = walk.skip != [0u8; 32]
                && (from_skip == height
                    || (from_skip > height
                        && !(from_prev < walk.height - 2 && from_prev >= height)));
            let next_hash = if take_skip { walk.skip } else { walk.prev_block };
            walk = self
                .get_entry(&next_hash)?
                .ok_or(ChainError::MissingEntry)?;
        }
        Ok(walk)
    }

    /// Fill in the skip pointer for a freshly indexed entry.
    pub fn fill_skip(
        &self,
        entry: &mut ChainEntry,
        prev: &Arc<ChainEntry>,
    ) -> Result<(), ChainError> {
        let target = skip_height(entry.height);
        entry.skip = self.get_ancestor(prev, target)?.hash;
        Ok(())
    }

    /// Median of the last eleven block timestamps ending at `entry`.
    pub fn median_time_past(&self, entry: &Arc<ChainEntry>) -> Result<i64, ChainError> {
        let mut times = Vec::with_capacity(bitcoind_consensus::constants::MEDIAN_TIME_SPAN);
        let mut walk = Some(entry.clone());
        while let Some(entry) = walk {
            times.push(entry.time as i64);
            if times.len() == bitcoind_consensus::constants::MEDIAN_TIME_SPAN {
                break;
            }
            walk = self.get_previous(&entry)?;
        }
        times.sort_unstable();
        Ok(times[times.len() / 2])
    }

    /// The last `count` headers ending at `entry`, oldest first, for the
    /// difficulty calculation.
    pub fn get_retarget_headers(
        &self,
        entry: &Arc<ChainEntry>,
        count: usize,
    ) -> Result<Vec<HeaderInfo>, ChainError> {
        let mut headers = VecDeque::with_capacity(count);
        let mut walk = Some(entry.clone());
        while let Some(entry) = walk {
            headers.push_front(HeaderInfo {
                height: entry.height as i64,
                time: entry.time as i64,
                bits: entry.bits,
            });
            if headers.len() == count {
                break;
            }
            walk = self.get_previous(&entry)?;
        }
        Ok(headers.into())
    }

    /// Persist an entry and block. With a view the block joins the main
    /// chain: the height index, undo journal, coin delta and tip pointer
    /// all land in the same batch.
    pub fn save(
        &self,
        entry: &Arc<ChainEntry>,
        block: &Block,
        view: Option<&CoinView>,
    ) -> Result<(), ChainError> {
        let mut batch = WriteBatch::new();
        batch.put(Column::BlockIndex, entry.hash, entry.encode());
        batch.put(Column::Block, entry.hash, block.consensus_encode());
        if let Some(view) = view {
            self.write_main_chain(&mut batch, entry, view);
        }
        self.store.write_batch(&batch)?;
        if let Ok(mut cache) = self.entry_cache.lock() {
            cache.insert(entry.hash, entry.clone());
        }
        if view.is_some() {
            if let Ok(mut tip) = self.tip.lock() {
                *tip = Some(entry.clone());
            }
        }
        Ok(())
    }

    /// Re-join a known side-chain entry to the main chain during a
    /// reorganization.
    pub fn reconnect(
        &self,
        entry: &Arc<ChainEntry>,
        _block: &Block,
        view: &CoinView,
    ) -> Result<(), ChainError> {
        let mut batch = WriteBatch::new();
        self.write_main_chain(&mut batch, entry, view);
        self.store.write_batch(&batch)?;
        if let Ok(mut tip) = self.tip.lock() {
            *tip = Some(entry.clone());
        }
        Ok(())
    }

    fn write_main_chain(&self, batch: &mut WriteBatch, entry: &Arc<ChainEntry>, view: &CoinView) {
        batch.put(Column::HeightIndex, height_key(entry.height), entry.hash.to_vec());
        batch.put(Column::Undo, entry.hash, view.undo_data().encode());
        view.write(&self.utxos, batch);
        batch.put(Column::Meta, TIP_KEY, entry.hash.to_vec());
    }

    /// Roll the tip block back off the main chain, restoring the coins
    /// it spent. The entry and block body stay indexed; only the main
    /// chain forgets them. Returns the applied view.
    pub fn disconnect(&self, entry: &Arc<ChainEntry>, block: &Block) -> Result<CoinView, ChainError> {
        let undo_bytes = self
            .store
            .get(Column::Undo, &entry.hash)?
            .ok_or(ChainError::Corrupt("missing undo data; resync required"))?;
        let undo = UndoData::decode(&undo_bytes)?;
        let mut view = CoinView::new();
        view.undo_block(block, undo)
            .map_err(|_| ChainError::Corrupt("undo journal mismatch"))?;

        let mut batch = WriteBatch::new();
        view.write(&self.utxos, &mut batch);
        batch.delete(Column::HeightIndex, height_key(entry.height));
        batch.delete(Column::Undo, entry.hash);
        batch.put(Column::Meta, TIP_KEY, entry.prev_block.to_vec());
        self.store.write_batch(&batch)?;

        let prev = self
            .get_entry(&entry.prev_block)?
            .ok_or(ChainError::MissingEntry)?;
        if let Ok(mut tip) = self.tip.lock() {
            *tip = Some(prev);
        }
        Ok(view)
    }

    /// Detach the tip entry from the main chain without touching the
    /// coin set. Used by headers-only reorganizations, which track no
    /// coins.
    pub fn remove_main(&self, entry: &Arc<ChainEntry>) -> Result<(), ChainError> {
        let mut batch = WriteBatch::new();
        batch.delete(Column::HeightIndex, height_key(entry.height));
        batch.delete(Column::Undo, entry.hash);
        batch.put(Column::Meta, TIP_KEY, entry.prev_block.to_vec());
        self.store.write_batch(&batch)?;
        let prev = self
            .get_entry(&entry.prev_block)?
            .ok_or(ChainError::MissingEntry)?;
        if let Ok(mut tip) = self.tip.lock() {
            *tip = Some(prev);
        }
        Ok(())
    }

    /// Rewind the main chain to `target`, dropping the disconnected
    /// entries and bodies entirely.
    pub fn reset(&self, target: &Hash256) -> Result<Arc<ChainEntry>, ChainError> {
        let entry = self.get_entry(target)?.ok_or(ChainError::MissingEntry)?;
        if !self.is_main_chain(&entry)? {
            return Err(ChainError::Corrupt("reset target not on main chain"));
        }
        loop {
            let tip = self.get_tip()?;
            if tip.hash == entry.hash {
                return Ok(tip);
            }
            if tip.is_genesis() {
                return Err(ChainError::Corrupt("reset walked past genesis"));
            }
            let block = self.get_block(&tip.hash)?.ok_or(ChainError::MissingBlock)?;
            self.disconnect(&tip, &block)?;
            let mut batch = WriteBatch::new();
            batch.delete(Column::BlockIndex, tip.hash);
            batch.delete(Column::Block, tip.hash);
            self.store.write_batch(&batch)?;
            if let Ok(mut cache) = self.entry_cache.lock() {
                cache.remove(&tip.hash);
            }
        }
    }

    /// Cached BIP9 state for `(bit, entry)`. Survives restarts.
    pub fn version_bits_state(&self, bit: u8, hash: &Hash256) -> Option<ThresholdState> {
        self.state_cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(&(bit, *hash)).copied())
    }

    pub fn set_version_bits_state(
        &self,
        bit: u8,
        hash: &Hash256,
        state: ThresholdState,
    ) -> Result<(), ChainError> {
        let mut key = [0u8; 33];
        key[0] = bit;
        key[1..].copy_from_slice(hash);
        self.store
            .put(Column::VersionBits, &key, &[state.as_u8()])?;
        if let Ok(mut cache) = self.state_cache.lock() {
            cache.insert((bit, *hash), state);
        }
        Ok(())
    }
}

fn height_key(height: i32) -> [u8; 4] {
    (height as u32).to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoind_consensus::{chain_params, Network};
    use bitcoind_storage::memory::MemoryStore;

    fn open_db() -> ChainDB<MemoryStore> {
        let params = chain_params(Network::Regtest).consensus;
        ChainDB::open(Arc::new(MemoryStore::new()), params).expect("open db")
    }

    #[test]
    fn open_writes_genesis() {
        let db = open_db();
        let tip = db.get_tip().expect("tip");
        assert_eq!(tip.height, 0);
        assert_eq!(tip.hash, db.params().genesis_hash);
        assert!(db.is_main_chain(&tip).expect("main chain"));
        assert!(db.get_block(&tip.hash).expect("block").is_some());
    }

    #[test]
    fn state_cache_survives_reopen() {
        let store = Arc::new(MemoryStore::new());
        let params = chain_params(Network::Regtest).consensus;
        let hash = [9u8; 32];
        {
            let db = ChainDB::open(Arc::clone(&store), params.clone()).expect("open");
            db.set_version_bits_state(1, &hash, ThresholdState::LockedIn)
                .expect("set state");
        }
        let db = ChainDB::open(store, params).expect("reopen");
        assert_eq!(
            db.version_bits_state(1, &hash),
            Some(ThresholdState::LockedIn)
        );
    }
}
