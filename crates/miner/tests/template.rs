//! Template assembly against a live regtest chain.

use std::sync::{Arc, Mutex};

use bitcoind_chainstate::chain::{Chain, ChainOptions};
use bitcoind_chainstate::entry::ChainEntry;
use bitcoind_consensus::{block_subsidy, chain_params, Network};
use bitcoind_miner::{build_mempool_entry, CpuMiner, Mempool, MinerOptions};
use bitcoind_pow::validation::check_proof_of_work;
use bitcoind_primitives::block::{encode_height_push, Block, BlockHeader};
use bitcoind_primitives::transaction::{Transaction, TxIn, TxOut};
use bitcoind_primitives::OutPoint;
use bitcoind_storage::memory::MemoryStore;

fn open_chain() -> Chain<MemoryStore> {
    Chain::open(
        Arc::new(MemoryStore::new()),
        chain_params(Network::Regtest),
        ChainOptions::default(),
    )
    .expect("open chain")
}

fn coinbase(height: i32, value: i64, marker: u8) -> Transaction {
    let mut script_sig = encode_height_push(height);
    script_sig.push(marker);
    Transaction {
        version: 2,
        vin: vec![TxIn::new(OutPoint::null(), script_sig, 0xffff_ffff)],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

fn spend_to(outpoint: OutPoint, value: i64) -> Transaction {
    Transaction {
        version: 2,
        vin: vec![TxIn::new(outpoint, Vec::new(), 0xffff_ffff)],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

fn mine_on(chain: &Chain<MemoryStore>, prev: &Arc<ChainEntry>, marker: u8) -> Block {
    let height = prev.height + 1;
    let time = prev.time + 600;
    let bits = chain.get_target(time as i64, Some(prev)).expect("target");
    let version = chain.compute_block_version(prev).expect("version");
    let reward = block_subsidy(height, chain.params());
    let header = BlockHeader {
        version,
        prev_block: prev.hash,
        merkle_root: [0u8; 32],
        time,
        bits,
        nonce: 0,
    };
    let mut block = Block::new_mutable(header, vec![coinbase(height, reward, marker)]);
    block.header.merkle_root = block.merkle_root().0;
    while check_proof_of_work(&block.header, chain.params()).is_err() {
        block.header.nonce += 1;
    }
    block.into_immutable()
}

async fn extend(chain: &Chain<MemoryStore>, count: usize, marker: u8) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        let tip = chain.tip();
        let block = mine_on(chain, &tip, marker);
        chain.add(block.clone()).await.expect("extend chain");
        blocks.push(block);
    }
    blocks
}

fn solve(chain: &Chain<MemoryStore>, template: &bitcoind_miner::BlockTemplate) -> Block {
    let mut block = template.to_block();
    while check_proof_of_work(&block.header, chain.params()).is_err() {
        block.header.nonce += 1;
    }
    block.into_immutable()
}

#[tokio::test]
async fn template_orders_by_fee_and_respects_dependencies() {
    let chain = open_chain();
    let blocks = extend(&chain, 110, 0x01).await;

    let cb1 = OutPoint::new(blocks[0].transactions[0].txid(), 0);
    let cb2 = OutPoint::new(blocks[1].transactions[0].txid(), 0);
    let value = chain.db().get_coin(&cb1).unwrap().expect("coin").value;

    let mut pool = Mempool::new(1 << 20);
    let tx_a = spend_to(cb1, value - 100_000);
    let a_txid = tx_a.txid();
    let entry_a = build_mempool_entry(&chain, &pool, tx_a).expect("tx a");
    pool.insert(entry_a).expect("insert a");

    // A child of the unconfirmed parent.
    let tx_c = spend_to(OutPoint::new(a_txid, 0), value - 150_000);
    let c_txid = tx_c.txid();
    let entry_c = build_mempool_entry(&chain, &pool, tx_c).expect("tx c");
    pool.insert(entry_c).expect("insert c");

    // A nearly-free transaction.
    let tx_b = spend_to(cb2, value - 10);
    let b_txid = tx_b.txid();
    let entry_b = build_mempool_entry(&chain, &pool, tx_b).expect("tx b");
    pool.insert(entry_b).expect("insert b");

    let options = MinerOptions {
        min_weight: 0,
        ..MinerOptions::default()
    };
    let template = bitcoind_miner::create_template(&chain, &pool, &options).expect("template");

    let selected: Vec<_> = template.transactions.iter().map(|tx| tx.txid()).collect();
    assert_eq!(selected, vec![a_txid, c_txid], "free tx skipped, child after parent");
    assert_eq!(template.fees, 150_000);
    assert!(!selected.contains(&b_txid));
    assert_eq!(
        template.coinbase.output_value(),
        block_subsidy(template.height, chain.params()) + 150_000
    );

    // The template survives full consensus validation.
    let block = solve(&chain, &template);
    chain.add(block.clone()).await.expect("mined template connects");
    assert_eq!(chain.height(), 111);
    assert_eq!(chain.tip().hash, block.hash());
    // The spends landed: the parent coin is gone, the child output
    // exists.
    assert!(chain.db().get_coin(&cb1).unwrap().is_none());
    assert!(chain
        .db()
        .get_coin(&OutPoint::new(c_txid, 0))
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn priority_phase_prefers_aged_coins() {
    let chain = open_chain();
    let blocks = extend(&chain, 110, 0x02).await;

    let old = OutPoint::new(blocks[0].transactions[0].txid(), 0);
    let new = OutPoint::new(blocks[8].transactions[0].txid(), 0);
    let old_value = chain.db().get_coin(&old).unwrap().expect("old coin").value;
    let new_value = chain.db().get_coin(&new).unwrap().expect("new coin").value;

    let mut pool = Mempool::new(1 << 20);
    // Zero fee on the old coin, a large fee on the young one.
    let tx_old = spend_to(old, old_value);
    let tx_new = spend_to(new, new_value - 1_000_000);
    let old_txid = tx_old.txid();
    let new_txid = tx_new.txid();
    let entry_old = build_mempool_entry(&chain, &pool, tx_old).expect("old");
    pool.insert(entry_old).expect("insert old");
    let entry_new = build_mempool_entry(&chain, &pool, tx_new).expect("new");
    pool.insert(entry_new).expect("insert new");

    let options = MinerOptions {
        priority_weight: 2_000_000,
        min_priority: 0.0,
        min_weight: 0,
        ..MinerOptions::default()
    };
    let template = bitcoind_miner::create_template(&chain, &pool, &options).expect("template");
    let selected: Vec<_> = template.transactions.iter().map(|tx| tx.txid()).collect();
    assert_eq!(
        selected,
        vec![old_txid, new_txid],
        "priority outranks fee rate inside the priority window"
    );
}

#[tokio::test]
async fn witness_template_carries_commitment() {
    let chain = open_chain();
    // Drive segwit through its BIP9 periods (window 144).
    extend(&chain, 440, 0x03).await;
    assert!(chain.deployment_state().has_witness());

    let pool = Mempool::new(1 << 20);
    let template =
        bitcoind_miner::create_template(&chain, &pool, &MinerOptions::default()).expect("template");
    assert!(template.witness);
    assert_eq!(template.coinbase.vin[0].witness, vec![vec![0u8; 32]]);
    assert_eq!(template.coinbase.vout.len(), 2);

    let block = solve(&chain, &template);
    assert!(block.witness_commitment().is_some());
    chain.add(block).await.expect("witness block connects");
    assert_eq!(chain.height(), 441);
}

#[tokio::test]
async fn miner_observes_stop_flag() {
    let chain = Arc::new(open_chain());
    let (miner, stop) = CpuMiner::new(Arc::clone(&chain), MinerOptions::default());
    stop.send(true).expect("stop");
    // Returns without mining anything.
    miner.run(Arc::new(Mutex::new(Mempool::new(1 << 20)))).await;
    assert_eq!(chain.height(), 0);
}

#[tokio::test]
async fn miner_extends_the_chain() {
    let chain = Arc::new(open_chain());
    let (miner, _stop) = CpuMiner::new(Arc::clone(&chain), MinerOptions::default());
    let pool = Mempool::new(1 << 20);
    let template =
        bitcoind_miner::create_template(&chain, &pool, &MinerOptions::default()).expect("template");
    let block = miner.mine_block(&template).expect("solved");
    chain.add(block).await.expect("connects");
    assert_eq!(chain.height(), 1);
}
