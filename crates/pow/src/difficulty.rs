//! Difficulty and compact target utilities.

use std::cmp::Ordering;

use bitcoind_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    EmptyChain,
    NonContiguous,
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::EmptyChain => write!(f, "no headers available"),
            DifficultyError::NonContiguous => write!(f, "header list must be contiguous by height"),
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub height: i64,
    pub time: i64,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = (bits >> 24) as u32;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = ((value.bits() + 7) / 8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    let value = compact_to_u256(bits)?;
    Ok(value.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    let value = U256::from_little_endian(target);
    u256_to_compact(value)
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    let hash_value = U256::from_little_endian(hash);
    let target_value = U256::from_little_endian(target);
    hash_value <= target_value
}

/// Work contributed by a block: `2^256 / (target + 1)`.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

pub fn cmp_be(a: &Hash256, b: &Hash256) -> Ordering {
    let left = U256::from_little_endian(a);
    let right = U256::from_little_endian(b);
    left.cmp(&right)
}

/// Expected compact bits for the block following `chain`, a contiguous
/// run of headers ending at the current tip. The slice must reach back to
/// the last retarget boundary; off-boundary heights only consult the tip
/// (and, on `target_reset` networks, walk back past min-difficulty
/// blocks).
pub fn get_next_work_required(
    chain: &[HeaderInfo],
    next_time: Option<i64>,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    if chain.is_empty() {
        return Ok(params.pow_limit_bits);
    }

    ensure_contiguous(chain)?;

    let last = chain.last().expect("checked not empty");
    if params.no_retargeting {
        return Ok(last.bits);
    }

    let interval = params.retarget_interval as i64;
    let next_height = last.height + 1;

    if next_height % interval != 0 {
        if params.target_reset {
            // Testnet rule: a block arriving after twice the target
            // spacing may use the minimum difficulty.
            if let Some(next_time) = next_time {
                if next_time > last.time + params.target_spacing * 2 {
                    return Ok(params.pow_limit_bits);
                }
            }
            // Otherwise inherit the last non-minimum difficulty on this
            // interval.
            for header in chain.iter().rev() {
                if header.height % interval == 0 || header.bits != params.pow_limit_bits {
                    return Ok(header.bits);
                }
            }
            return Ok(params.pow_limit_bits);
        }
        return Ok(last.bits);
    }

    let first_height = last.height - (interval - 1);
    let base_height = chain[0].height;
    if first_height < base_height {
        return Err(DifficultyError::NonContiguous);
    }
    let first = &chain[(first_height - base_height) as usize];
    Ok(retarget(last.bits, first.time, last.time, params)?)
}

fn retarget(
    prev_bits: u32,
    first_time: i64,
    last_time: i64,
    params: &ConsensusParams,
) -> Result<u32, CompactError> {
    let timespan = params.target_timespan;
    let actual = (last_time - first_time).clamp(timespan / 4, timespan * 4);

    let target = compact_to_u256(prev_bits)?;
    let (scaled, overflow) = target.overflowing_mul(U256::from(actual as u64));
    let mut next = if overflow {
        (target / U256::from(timespan as u64)) * U256::from(actual as u64)
    } else {
        scaled / U256::from(timespan as u64)
    };

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if next > pow_limit {
        next = pow_limit;
    }

    Ok(u256_to_compact(next))
}

fn ensure_contiguous(chain: &[HeaderInfo]) -> Result<(), DifficultyError> {
    let base = chain[0].height;
    for (idx, header) in chain.iter().enumerate() {
        if header.height != base + idx as i64 {
            return Err(DifficultyError::NonContiguous);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoind_consensus::{chain_params, Network};

    fn window(params: &ConsensusParams, base_height: i64, spacing: i64, bits: u32) -> Vec<HeaderInfo> {
        (0..params.retarget_interval as i64)
            .map(|i| HeaderInfo {
                height: base_height + i,
                time: 1_300_000_000 + i * spacing,
                bits,
            })
            .collect()
    }

    #[test]
    fn compact_roundtrip_known_values() {
        for bits in [0x1d00_ffffu32, 0x1b04_64ba, 0x2007_ffff, 0x207f_ffff] {
            let target = compact_to_u256(bits).expect("valid compact");
            assert_eq!(u256_to_compact(target), bits);
        }
    }

    #[test]
    fn compact_rejects_negative_and_overflow() {
        assert_eq!(compact_to_u256(0x0180_0000), Err(CompactError::Negative));
        assert_eq!(compact_to_u256(0xff12_3456), Err(CompactError::Overflow));
    }

    #[test]
    fn proof_of_minimum_difficulty() {
        // 2^256 / (0xffff * 2^208 + 1) rounds to 0x100010001.
        let proof = block_proof(0x1d00_ffff).expect("valid bits");
        assert_eq!(proof, U256::from(0x1_0001_0001u64));
    }

    #[test]
    fn off_boundary_inherits_previous_bits() {
        let params = chain_params(Network::Mainnet).consensus;
        let chain = [HeaderInfo {
            height: 100,
            time: 1_300_000_000,
            bits: 0x1b04_64ba,
        }];
        let bits = get_next_work_required(&chain, None, &params).expect("target");
        assert_eq!(bits, 0x1b04_64ba);
    }

    #[test]
    fn exact_timespan_keeps_target() {
        let params = chain_params(Network::Mainnet).consensus;
        let mut chain = window(&params, 0, 1, 0x1c05_a3f4);
        let last = chain.len() - 1;
        chain[last].time = chain[0].time + params.target_timespan;
        let bits = get_next_work_required(&chain, None, &params).expect("target");
        assert_eq!(bits, 0x1c05_a3f4);
    }

    #[test]
    fn fast_blocks_clamp_at_quarter_timespan() {
        let params = chain_params(Network::Mainnet).consensus;
        let chain = window(&params, 0, 1, 0x1c10_0000);
        let bits = get_next_work_required(&chain, None, &params).expect("target");
        let expected = u256_to_compact(compact_to_u256(0x1c10_0000).unwrap() / U256::from(4u64));
        assert_eq!(bits, expected);
    }

    #[test]
    fn slow_blocks_clamp_at_quadruple_timespan() {
        let params = chain_params(Network::Mainnet).consensus;
        let chain = window(&params, 0, params.target_spacing * 100, 0x1c10_0000);
        let bits = get_next_work_required(&chain, None, &params).expect("target");
        let expected = u256_to_compact(compact_to_u256(0x1c10_0000).unwrap() * U256::from(4u64));
        assert_eq!(bits, expected);
    }

    #[test]
    fn retarget_caps_at_pow_limit() {
        let params = chain_params(Network::Mainnet).consensus;
        let chain = window(&params, 0, params.target_spacing * 100, params.pow_limit_bits);
        let bits = get_next_work_required(&chain, None, &params).expect("target");
        assert_eq!(bits, params.pow_limit_bits);
    }

    #[test]
    fn no_retargeting_network_keeps_bits() {
        let params = chain_params(Network::Regtest).consensus;
        let chain = window(&params, 0, params.target_spacing, params.pow_limit_bits);
        let bits = get_next_work_required(&chain, None, &params).expect("target");
        assert_eq!(bits, params.pow_limit_bits);
    }

    #[test]
    fn target_reset_allows_min_difficulty_after_gap() {
        let params = chain_params(Network::Testnet).consensus;
        let last = HeaderInfo {
            height: 100,
            time: 1_300_000_000,
            bits: 0x1c10_0000,
        };
        let late = last.time + params.target_spacing * 2 + 1;
        let bits = get_next_work_required(&[last], Some(late), &params).expect("target");
        assert_eq!(bits, params.pow_limit_bits);

        let on_time = last.time + params.target_spacing;
        let bits = get_next_work_required(&[last], Some(on_time), &params).expect("target");
        assert_eq!(bits, 0x1c10_0000);
    }

    #[test]
    fn target_reset_walks_past_min_difficulty_blocks() {
        let params = chain_params(Network::Testnet).consensus;
        let chain = [
            HeaderInfo {
                height: 99,
                time: 1_300_000_000,
                bits: 0x1c10_0000,
            },
            HeaderInfo {
                height: 100,
                time: 1_300_002_000,
                bits: params.pow_limit_bits,
            },
        ];
        let on_time = chain[1].time + params.target_spacing;
        let bits = get_next_work_required(&chain, Some(on_time), &params).expect("target");
        assert_eq!(bits, 0x1c10_0000);
    }
}
