//! Header proof-of-work checks.

use bitcoind_consensus::ConsensusParams;
use bitcoind_primitives::block::BlockHeader;
use primitive_types::U256;

use crate::difficulty::compact_to_u256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowError {
    /// The compact target is malformed or above the network limit.
    InvalidTarget,
    /// The header hash does not meet its claimed target.
    HighHash,
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidTarget => write!(f, "target out of range"),
            PowError::HighHash => write!(f, "hash above target"),
        }
    }
}

impl std::error::Error for PowError {}

/// Verify a header hash against the target claimed by its own `bits`.
pub fn check_proof_of_work(
    header: &BlockHeader,
    params: &ConsensusParams,
) -> Result<(), PowError> {
    let target = compact_to_u256(header.bits).map_err(|_| PowError::InvalidTarget)?;
    if target.is_zero() {
        return Err(PowError::InvalidTarget);
    }
    let limit = U256::from_little_endian(&params.pow_limit);
    if target > limit {
        return Err(PowError::InvalidTarget);
    }
    let hash = U256::from_little_endian(&header.hash());
    if hash > target {
        return Err(PowError::HighHash);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoind_consensus::{chain_params, Network};

    fn header(bits: u32, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 2,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: 1_296_688_602,
            bits,
            nonce,
        }
    }

    #[test]
    fn regtest_header_mines_quickly() {
        let params = chain_params(Network::Regtest).consensus;
        let mut header = header(params.pow_limit_bits, 0);
        while check_proof_of_work(&header, &params).is_err() {
            header.nonce += 1;
            assert!(header.nonce < 1_000);
        }
    }

    #[test]
    fn mainnet_difficulty_rejects_random_header() {
        let params = chain_params(Network::Mainnet).consensus;
        let header = header(0x1d00_ffff, 12345);
        assert_eq!(
            check_proof_of_work(&header, &params),
            Err(PowError::HighHash)
        );
    }

    #[test]
    fn target_above_limit_rejected() {
        let params = chain_params(Network::Mainnet).consensus;
        let header = header(0x207f_ffff, 0);
        assert_eq!(
            check_proof_of_work(&header, &params),
            Err(PowError::InvalidTarget)
        );
    }
}
