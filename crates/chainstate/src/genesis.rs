//! Genesis block construction.
//!
//! Every network shares the same coinbase; only the header fields
//! differ.

use bitcoind_consensus::money::COIN;
use bitcoind_consensus::ConsensusParams;
use bitcoind_primitives::block::{Block, BlockHeader};
use bitcoind_primitives::transaction::{Transaction, TxIn, TxOut};
use bitcoind_primitives::OutPoint;

const GENESIS_MESSAGE: &[u8] =
    b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

const GENESIS_PUBKEY: &str = "04678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb6\
49f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5f";

pub fn genesis_block(params: &ConsensusParams) -> Block {
    let mut script_sig = Vec::with_capacity(77);
    // Compact target 486604799 and the number 4, as originally mined.
    script_sig.extend_from_slice(&[0x04, 0xff, 0xff, 0x00, 0x1d, 0x01, 0x04]);
    script_sig.push(GENESIS_MESSAGE.len() as u8);
    script_sig.extend_from_slice(GENESIS_MESSAGE);

    let pubkey = hex_bytes(GENESIS_PUBKEY);
    let mut script_pubkey = Vec::with_capacity(67);
    script_pubkey.push(pubkey.len() as u8);
    script_pubkey.extend_from_slice(&pubkey);
    script_pubkey.push(0xac);

    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn::new(OutPoint::null(), script_sig, 0xffff_ffff)],
        vout: vec![TxOut {
            value: 50 * COIN,
            script_pubkey,
        }],
        lock_time: 0,
    };

    let header = BlockHeader {
        version: params.genesis_version,
        prev_block: [0u8; 32],
        merkle_root: coinbase.txid(),
        time: params.genesis_time,
        bits: params.genesis_bits,
        nonce: params.genesis_nonce,
    };

    debug_assert_eq!(header.merkle_root, params.genesis_merkle_root);
    Block::new(header, vec![coinbase])
}

fn hex_bytes(hex: &str) -> Vec<u8> {
    let bytes = hex.as_bytes();
    (0..hex.len() / 2)
        .map(|i| {
            let high = (bytes[i * 2] as char).to_digit(16).expect("hex digit") as u8;
            let low = (bytes[i * 2 + 1] as char).to_digit(16).expect("hex digit") as u8;
            high << 4 | low
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoind_consensus::{chain_params, Network};

    #[test]
    fn genesis_hashes_match_parameters() {
        for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
            let params = chain_params(network).consensus;
            let block = genesis_block(&params);
            assert_eq!(block.hash(), params.genesis_hash, "{network:?}");
            assert_eq!(block.header.merkle_root, params.genesis_merkle_root);
        }
    }
}
