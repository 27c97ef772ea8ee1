//! Non-contextual block verification.

use bitcoind_consensus::constants::{MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE, MAX_TIME_DRIFT};
use bitcoind_consensus::{ConsensusParams, VerifyError};
use bitcoind_pow::validation::{check_proof_of_work, PowError};
use bitcoind_primitives::Block;
use bitcoind_script::sigops::tx_legacy_sigops;

/// Checks requiring no chain context. Every failure except `high-hash`
/// is flagged malleated: the peer may have mutated an otherwise valid
/// block, so the hash must not be cached as permanently invalid.
pub fn check_block_sanity(
    block: &Block,
    now: i64,
    params: &ConsensusParams,
) -> Result<(), VerifyError> {
    if let Err(err) = check_proof_of_work(&block.header, params) {
        let score = match err {
            PowError::HighHash => 50,
            PowError::InvalidTarget => 100,
        };
        return Err(VerifyError::invalid("high-hash", score));
    }
    check_body(block, now).map_err(VerifyError::malleated)
}

fn check_body(block: &Block, now: i64) -> Result<(), VerifyError> {
    if block.header.time as i64 > now + MAX_TIME_DRIFT {
        // May become valid once clocks catch up.
        return Err(VerifyError::invalid("time-too-new", 0));
    }

    if block.transactions.is_empty() {
        return Err(VerifyError::invalid("bad-blk-length", 100));
    }
    let stripped = block.stripped_size();
    if !(81..=MAX_BLOCK_SIZE).contains(&stripped) {
        return Err(VerifyError::invalid("bad-blk-length", 100));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(VerifyError::invalid("bad-cb-missing", 100));
    }
    for tx in &block.transactions[1..] {
        if tx.is_coinbase() {
            return Err(VerifyError::invalid("bad-cb-multiple", 100));
        }
    }

    let (root, mutated) = block.merkle_root();
    if mutated {
        return Err(VerifyError::invalid("bad-txns-duplicate", 100));
    }
    if root != block.header.merkle_root {
        return Err(VerifyError::invalid("bad-txnmrklroot", 100));
    }

    let mut sigops = 0u64;
    for tx in &block.transactions {
        tx.check_sanity()?;
        sigops += tx_legacy_sigops(tx);
    }
    if sigops > MAX_BLOCK_SIGOPS as u64 {
        return Err(VerifyError::invalid("bad-blk-sigops", 100));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis::genesis_block;
    use bitcoind_consensus::{chain_params, Network};
    use bitcoind_primitives::block::Block;

    fn params() -> ConsensusParams {
        chain_params(Network::Regtest).consensus
    }

    fn now() -> i64 {
        crate::timedata::TimeData::local_now()
    }

    #[test]
    fn genesis_passes_sanity() {
        let params = params();
        let block = genesis_block(&params);
        check_block_sanity(&block, now(), &params).expect("genesis sane");
    }

    #[test]
    fn future_timestamp_is_malleated() {
        let params = params();
        let genesis = genesis_block(&params);
        let mut block = Block::new_mutable(genesis.header, genesis.transactions.clone());
        block.header.time = (now() + MAX_TIME_DRIFT + 60) as u32;
        // Keep PoW valid under the regtest limit.
        while check_proof_of_work(&block.header, &params).is_err() {
            block.header.nonce += 1;
        }
        let err = check_block_sanity(&block, now(), &params).expect_err("too new");
        assert_eq!(err.reason, "time-too-new");
        assert!(err.malleated);
    }

    #[test]
    fn duplicate_transaction_is_malleated() {
        use bitcoind_primitives::transaction::{Transaction, TxIn, TxOut};
        use bitcoind_primitives::OutPoint;

        let params = params();
        let genesis = genesis_block(&params);
        let plain = |byte: u8| Transaction {
            version: 2,
            vin: vec![TxIn::new(OutPoint::new([byte; 32], 0), Vec::new(), 0xffff_ffff)],
            vout: vec![TxOut {
                value: 1,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        };
        // Duplicating a trailing pair forges the honest merkle root
        // (CVE-2012-2459).
        let mut txs = genesis.transactions.clone();
        txs.push(plain(1));
        txs.push(plain(2));
        txs.push(plain(2));
        let mut block = Block::new_mutable(genesis.header, txs);
        let (root, mutated) = block.merkle_root();
        assert!(mutated);
        block.header.merkle_root = root;
        while check_proof_of_work(&block.header, &params).is_err() {
            block.header.nonce += 1;
        }
        let err = check_block_sanity(&block, now(), &params).expect_err("duplicate txs");
        assert_eq!(err.reason, "bad-txns-duplicate");
        assert!(err.malleated);
    }

    #[test]
    fn high_hash_is_not_malleated() {
        let mainnet = chain_params(Network::Mainnet).consensus;
        let block = genesis_block(&params());
        let err = check_block_sanity(&block, now(), &mainnet).expect_err("wrong network pow");
        assert_eq!(err.reason, "high-hash");
        assert!(!err.malleated);
    }
}
