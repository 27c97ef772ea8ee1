use bitcoind_consensus::{chain_params, hash256_to_hex, Network};
use bitcoind_primitives::block::Block;

const GENESIS_HEX: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e\
67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c01010000000100000000000000000000\
00000000000000000000000000000000000000000000ffffffff4d04ffff001d0104455468652054696d65732030332f\
4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f75742066\
6f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a6\
7962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000";

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    assert!(hex.len() % 2 == 0);
    let bytes = hex.as_bytes();
    (0..hex.len() / 2)
        .map(|i| {
            let high = (bytes[i * 2] as char).to_digit(16).expect("hex digit") as u8;
            let low = (bytes[i * 2 + 1] as char).to_digit(16).expect("hex digit") as u8;
            high << 4 | low
        })
        .collect()
}

#[test]
fn mainnet_genesis_roundtrip() {
    let bytes = hex_to_bytes(GENESIS_HEX);
    assert_eq!(bytes.len(), 285);

    let params = chain_params(Network::Mainnet).consensus;
    let block = Block::consensus_decode(&bytes).expect("decode genesis");

    assert_eq!(block.hash(), params.genesis_hash);
    assert_eq!(
        hash256_to_hex(&block.hash()),
        "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
    );
    assert_eq!(block.transactions.len(), 1);
    assert!(block.transactions[0].is_coinbase());

    let (root, mutated) = block.merkle_root();
    assert!(!mutated);
    assert_eq!(root, block.header.merkle_root);
    assert_eq!(root, params.genesis_merkle_root);

    assert_eq!(block.size(), 285);
    assert_eq!(block.stripped_size(), 285);
    assert_eq!(block.weight(), 285 * 4);

    let encoded = block.consensus_encode();
    assert_eq!(encoded, bytes);

    // Hash stability across a second round-trip.
    let again = Block::consensus_decode(&encoded).expect("decode again");
    assert_eq!(again.hash(), block.hash());
}

#[test]
fn genesis_header_alone_decodes() {
    let bytes = hex_to_bytes(GENESIS_HEX);
    let header =
        bitcoind_primitives::block::BlockHeader::consensus_decode(&bytes[..80]).expect("header");
    assert_eq!(header.time, 1_231_006_505);
    assert_eq!(header.bits, 0x1d00_ffff);
    assert_eq!(header.nonce, 2_083_236_893);
}
