//! Per-network consensus parameters.

use crate::{hash256_from_hex, Hash256};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "main",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }
}

/// A BIP9 versionbits deployment.
#[derive(Clone, Copy, Debug)]
pub struct Bip9Deployment {
    pub name: &'static str,
    pub bit: u8,
    /// Median-time-past threshold at which signaling may begin.
    pub start_time: i64,
    /// Median-time-past threshold at which the deployment fails.
    pub timeout: i64,
}

#[derive(Clone, Copy, Debug)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub genesis_hash: Hash256,
    pub genesis_version: i32,
    pub genesis_merkle_root: Hash256,
    pub genesis_time: u32,
    pub genesis_bits: u32,
    pub genesis_nonce: u32,

    /// Upper bound on valid proof-of-work targets, little-endian.
    pub pow_limit: Hash256,
    pub pow_limit_bits: u32,
    /// Blocks between difficulty adjustments.
    pub retarget_interval: i32,
    /// Intended seconds per retarget window.
    pub target_timespan: i64,
    /// Intended seconds per block.
    pub target_spacing: i64,
    /// Allow min-difficulty blocks after twice the target spacing (testnet).
    pub target_reset: bool,
    /// Never adjust difficulty (regtest).
    pub no_retargeting: bool,

    pub halving_interval: i32,

    /// P2SH activation, by timestamp (BIP16).
    pub bip16_time: i64,
    /// Coinbase height commitment activation (BIP34).
    pub bip34_height: i32,
    /// Strict DER signatures activation (BIP66).
    pub bip66_height: i32,
    /// CHECKLOCKTIMEVERIFY activation (BIP65).
    pub bip65_height: i32,
    /// Heights exempt from the duplicate-txid check, with the expected
    /// block hash (BIP30).
    pub bip30: Vec<(i32, Hash256)>,

    pub deployments: Vec<Bip9Deployment>,
    /// Signaling window for BIP9 deployments, in blocks.
    pub miner_window: i32,
    /// Signaling blocks per window required to lock a deployment in.
    pub activation_threshold: i32,

    pub checkpoints: Vec<Checkpoint>,
    pub last_checkpoint: i32,

    /// Chainwork a chain must reach before the node considers itself
    /// synced, big-endian.
    pub min_chainwork: [u8; 32],
    /// Maximum tip age, in seconds, before the node considers itself
    /// out of sync.
    pub max_tip_age: i64,
}

impl ConsensusParams {
    pub fn deployment(&self, name: &str) -> Option<&Bip9Deployment> {
        self.deployments.iter().find(|dep| dep.name == name)
    }

    pub fn checkpoint(&self, height: i32) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
    }

    pub fn bip30_exception(&self, height: i32, hash: &Hash256) -> bool {
        self.bip30
            .iter()
            .any(|(exc_height, exc_hash)| *exc_height == height && exc_hash == hash)
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
}

pub fn chain_params(network: Network) -> ChainParams {
    let consensus = match network {
        Network::Mainnet => mainnet_params(),
        Network::Testnet => testnet_params(),
        Network::Regtest => regtest_params(),
    };
    ChainParams { network, consensus }
}

fn genesis_merkle_root() -> Hash256 {
    hash("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b")
}

fn mainnet_params() -> ConsensusParams {
    ConsensusParams {
        genesis_hash: hash("000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"),
        genesis_version: 1,
        genesis_merkle_root: genesis_merkle_root(),
        genesis_time: 1_231_006_505,
        genesis_bits: 0x1d00_ffff,
        genesis_nonce: 2_083_236_893,
        pow_limit: hash("00000000ffff0000000000000000000000000000000000000000000000000000"),
        pow_limit_bits: 0x1d00_ffff,
        retarget_interval: 2016,
        target_timespan: 14 * 24 * 60 * 60,
        target_spacing: 10 * 60,
        target_reset: false,
        no_retargeting: false,
        halving_interval: 210_000,
        bip16_time: 1_333_238_400,
        bip34_height: 227_931,
        bip66_height: 363_725,
        bip65_height: 388_381,
        bip30: vec![
            (
                91_842,
                hash("00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec"),
            ),
            (
                91_880,
                hash("00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721"),
            ),
        ],
        deployments: vec![
            Bip9Deployment {
                name: "testdummy",
                bit: 28,
                start_time: 1_199_145_601,
                timeout: 1_230_767_999,
            },
            Bip9Deployment {
                name: "csv",
                bit: 0,
                start_time: 1_462_060_800,
                timeout: 1_493_596_800,
            },
            Bip9Deployment {
                name: "segwit",
                bit: 1,
                start_time: 1_479_168_000,
                timeout: 1_510_704_000,
            },
        ],
        miner_window: 2016,
        activation_threshold: 1916,
        checkpoints: vec![
            checkpoint(
                11_111,
                "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d",
            ),
            checkpoint(
                33_333,
                "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6",
            ),
            checkpoint(
                74_000,
                "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20",
            ),
            checkpoint(
                105_000,
                "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97",
            ),
            checkpoint(
                134_444,
                "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe",
            ),
            checkpoint(
                168_000,
                "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763",
            ),
            checkpoint(
                193_000,
                "000000000000059f452a5f7340de6682a977387c17010ff6e6c3bd83ca8b1317",
            ),
            checkpoint(
                210_000,
                "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e",
            ),
            checkpoint(
                216_116,
                "00000000000001b4f4b433e81ee46494af945cf96014816a4e2370f11b23df4e",
            ),
            checkpoint(
                225_430,
                "00000000000001c108384350f74090433e7fcf79a606b8e797f065b130575932",
            ),
            checkpoint(
                250_000,
                "000000000000003887df1f29024b06fc2200b55f8af8f35453d7be294df2d214",
            ),
            checkpoint(
                279_000,
                "0000000000000001ae8c72a0b0c301f67e3afca10e819efa9041e458e9bd7e40",
            ),
            checkpoint(
                295_000,
                "00000000000000004d9b4ef50f0f9d686fd69db2e03af35a100370c64632a983",
            ),
        ],
        last_checkpoint: 295_000,
        min_chainwork: work("0000000000000000000000000000000000000000028822fef1c230963535a90d"),
        max_tip_age: 24 * 60 * 60,
    }
}

fn testnet_params() -> ConsensusParams {
    ConsensusParams {
        genesis_hash: hash("000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"),
        genesis_version: 1,
        genesis_merkle_root: genesis_merkle_root(),
        genesis_time: 1_296_688_602,
        genesis_bits: 0x1d00_ffff,
        genesis_nonce: 414_098_458,
        pow_limit: hash("00000000ffff0000000000000000000000000000000000000000000000000000"),
        pow_limit_bits: 0x1d00_ffff,
        retarget_interval: 2016,
        target_timespan: 14 * 24 * 60 * 60,
        target_spacing: 10 * 60,
        target_reset: true,
        no_retargeting: false,
        halving_interval: 210_000,
        bip16_time: 1_333_238_400,
        bip34_height: 21_111,
        bip66_height: 330_776,
        bip65_height: 581_885,
        bip30: Vec::new(),
        deployments: vec![
            Bip9Deployment {
                name: "testdummy",
                bit: 28,
                start_time: 1_199_145_601,
                timeout: 1_230_767_999,
            },
            Bip9Deployment {
                name: "csv",
                bit: 0,
                start_time: 1_456_790_400,
                timeout: 1_493_596_800,
            },
            Bip9Deployment {
                name: "segwit",
                bit: 1,
                start_time: 1_462_060_800,
                timeout: 1_493_596_800,
            },
        ],
        miner_window: 2016,
        activation_threshold: 1512,
        checkpoints: vec![checkpoint(
            546,
            "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70",
        )],
        last_checkpoint: 546,
        min_chainwork: work("00000000000000000000000000000000000000000000002830dab7f76dbb7d63"),
        max_tip_age: 24 * 60 * 60,
    }
}

fn regtest_params() -> ConsensusParams {
    ConsensusParams {
        genesis_hash: hash("0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"),
        genesis_version: 1,
        genesis_merkle_root: genesis_merkle_root(),
        genesis_time: 1_296_688_602,
        genesis_bits: 0x207f_ffff,
        genesis_nonce: 2,
        pow_limit: hash("7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pow_limit_bits: 0x207f_ffff,
        retarget_interval: 2016,
        target_timespan: 14 * 24 * 60 * 60,
        target_spacing: 10 * 60,
        target_reset: false,
        no_retargeting: true,
        halving_interval: 150,
        bip16_time: 0,
        bip34_height: 500,
        bip66_height: 500,
        bip65_height: 500,
        bip30: Vec::new(),
        deployments: vec![
            Bip9Deployment {
                name: "testdummy",
                bit: 28,
                start_time: 0,
                timeout: i64::MAX >> 1,
            },
            Bip9Deployment {
                name: "csv",
                bit: 0,
                start_time: 0,
                timeout: i64::MAX >> 1,
            },
            Bip9Deployment {
                name: "segwit",
                bit: 1,
                start_time: 0,
                timeout: i64::MAX >> 1,
            },
        ],
        miner_window: 144,
        activation_threshold: 108,
        checkpoints: Vec::new(),
        last_checkpoint: 0,
        min_chainwork: [0u8; 32],
        max_tip_age: u32::MAX as i64,
    }
}

fn hash(hex: &str) -> Hash256 {
    hash256_from_hex(hex).expect("hard-coded hash")
}

fn checkpoint(height: i32, hex: &str) -> Checkpoint {
    Checkpoint {
        height,
        hash: hash(hex),
    }
}

// Chainwork constants are written in natural big-endian order.
fn work(hex: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    let bytes = hex.as_bytes();
    for i in 0..32 {
        let high = (bytes[i * 2] as char).to_digit(16).expect("hex digit") as u8;
        let low = (bytes[i * 2 + 1] as char).to_digit(16).expect("hex digit") as u8;
        out[i] = high << 4 | low;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_lookup_by_name() {
        let params = chain_params(Network::Mainnet).consensus;
        let segwit = params.deployment("segwit").expect("segwit deployment");
        assert_eq!(segwit.bit, 1);
        assert!(params.deployment("taproot").is_none());
    }

    #[test]
    fn bip30_exceptions_match_height_and_hash() {
        let params = chain_params(Network::Mainnet).consensus;
        let (height, hash) = params.bip30[0];
        assert!(params.bip30_exception(height, &hash));
        assert!(!params.bip30_exception(height + 1, &hash));
    }
}
