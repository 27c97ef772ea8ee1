//! Block headers and block bodies.

use std::sync::OnceLock;

use bitcoind_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::merkle::{compute_merkle_root, hash_pair};
use crate::transaction::{var_int_size, Transaction};

pub const HEADER_SIZE: usize = 80;

/// Script prefix of the segwit commitment output in a coinbase:
/// `OP_RETURN` followed by a 36-byte push starting with `0xaa21a9ed`.
pub const WITNESS_COMMITMENT_PREFIX: [u8; 6] = [0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(header)
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash()?,
            merkle_root: decoder.read_hash()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }
}

/// A block body. Blocks received from the network are immutable and
/// memoize their hash and sizes; template blocks under construction are
/// mutable and recompute on every call.
#[derive(Clone, Debug)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    mutable: bool,
    cached_hash: OnceLock<Hash256>,
    cached_sizes: OnceLock<(usize, usize)>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
            mutable: false,
            cached_hash: OnceLock::new(),
            cached_sizes: OnceLock::new(),
        }
    }

    pub fn new_mutable(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            mutable: true,
            ..Self::new(header, transactions)
        }
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Freeze a template block once mining finished, re-enabling
    /// memoization.
    pub fn into_immutable(self) -> Self {
        Self::new(self.header, self.transactions)
    }

    pub fn hash(&self) -> Hash256 {
        if self.mutable {
            return self.header.hash();
        }
        *self.cached_hash.get_or_init(|| self.header.hash())
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.size());
        self.header.encode_into(&mut encoder);
        encoder.write_var_int(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode_into(&mut encoder, tx.has_witness());
        }
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let block = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(block)
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let header = BlockHeader::decode_from(decoder)?;
        let count = decoder.read_var_int()? as usize;
        if count > decoder.remaining() {
            return Err(DecodeError::Oversized);
        }
        let mut transactions = Vec::with_capacity(count);
        for _ in 0..count {
            transactions.push(Transaction::decode_from(decoder)?);
        }
        Ok(Self::new(header, transactions))
    }

    fn compute_sizes(&self) -> (usize, usize) {
        let mut size = HEADER_SIZE + var_int_size(self.transactions.len() as u64);
        let mut stripped = size;
        for tx in &self.transactions {
            size += tx.size();
            stripped += tx.stripped_size();
        }
        (size, stripped)
    }

    pub fn size(&self) -> usize {
        if self.mutable {
            return self.compute_sizes().0;
        }
        self.cached_sizes.get_or_init(|| self.compute_sizes()).0
    }

    pub fn stripped_size(&self) -> usize {
        if self.mutable {
            return self.compute_sizes().1;
        }
        self.cached_sizes.get_or_init(|| self.compute_sizes()).1
    }

    /// Weight per BIP141: three times the stripped size plus the total
    /// size.
    pub fn weight(&self) -> usize {
        let (size, stripped) = if self.mutable {
            self.compute_sizes()
        } else {
            *self.cached_sizes.get_or_init(|| self.compute_sizes())
        };
        3 * stripped + size
    }

    /// Recompute the merkle root over txids. The flag reports the
    /// CVE-2012-2459 duplicate-subtree mutation.
    pub fn merkle_root(&self) -> (Hash256, bool) {
        let txids: Vec<Hash256> = self.transactions.iter().map(Transaction::txid).collect();
        compute_merkle_root(&txids)
    }

    /// Merkle root over wtxids with the coinbase entry zeroed (BIP141).
    pub fn witness_merkle_root(&self) -> Hash256 {
        let mut hashes: Vec<Hash256> = Vec::with_capacity(self.transactions.len());
        for (index, tx) in self.transactions.iter().enumerate() {
            if index == 0 {
                hashes.push([0u8; 32]);
            } else {
                hashes.push(tx.wtxid());
            }
        }
        compute_merkle_root(&hashes).0
    }

    /// Extract the witness commitment from the coinbase, if present.
    /// The last matching output wins.
    pub fn witness_commitment(&self) -> Option<Hash256> {
        let coinbase = self.transactions.first()?;
        if !coinbase.is_coinbase() {
            return None;
        }
        let mut commitment = None;
        for output in &coinbase.vout {
            let script = &output.script_pubkey;
            if script.len() >= 38 && script[..6] == WITNESS_COMMITMENT_PREFIX {
                let mut out = [0u8; 32];
                out.copy_from_slice(&script[6..38]);
                commitment = Some(out);
            }
        }
        commitment
    }

    /// The witness nonce: the single 32-byte item of the coinbase input
    /// witness (BIP141).
    pub fn witness_nonce(&self) -> Option<Hash256> {
        let coinbase = self.transactions.first()?;
        let input = coinbase.vin.first()?;
        if input.witness.len() != 1 || input.witness[0].len() != 32 {
            return None;
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&input.witness[0]);
        Some(out)
    }

    /// `sha256d(witness_merkle_root || nonce)`, the value committed to by
    /// the coinbase output.
    pub fn commitment_hash(&self, nonce: &Hash256) -> Hash256 {
        hash_pair(&self.witness_merkle_root(), nonce)
    }

    pub fn has_witness_data(&self) -> bool {
        self.transactions.iter().any(Transaction::has_witness)
    }

    /// Height committed to by the coinbase script (BIP34), or -1.
    pub fn coinbase_height(&self) -> i32 {
        if self.header.version < 2 {
            return -1;
        }
        let Some(coinbase) = self.transactions.first() else {
            return -1;
        };
        let Some(input) = coinbase.vin.first() else {
            return -1;
        };
        parse_height_push(&input.script_sig).unwrap_or(-1)
    }
}

/// Serialize a block height the way coinbase scripts commit to it
/// (BIP34): small heights use the one-byte numeric opcodes, larger ones a
/// minimal little-endian script-number push.
pub fn encode_height_push(height: i32) -> Vec<u8> {
    debug_assert!(height >= 0);
    if height == 0 {
        return vec![0x00];
    }
    if (1..=16).contains(&height) {
        return vec![0x50 + height as u8];
    }
    let num = encode_script_num(height as i64);
    let mut out = Vec::with_capacity(1 + num.len());
    out.push(num.len() as u8);
    out.extend_from_slice(&num);
    out
}

pub fn parse_height_push(script: &[u8]) -> Option<i32> {
    let op = *script.first()?;
    match op {
        0x00 => Some(0),
        0x51..=0x60 => Some((op - 0x50) as i32),
        0x01..=0x08 => {
            let len = op as usize;
            if script.len() < 1 + len {
                return None;
            }
            let value = decode_script_num(&script[1..1 + len]);
            if value < 0 || value > i32::MAX as i64 {
                return None;
            }
            Some(value as i32)
        }
        _ => None,
    }
}

pub fn encode_script_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if out.last().copied().unwrap_or(0) & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        let last = out.len() - 1;
        out[last] |= 0x80;
    }
    out
}

pub fn decode_script_num(bytes: &[u8]) -> i64 {
    if bytes.is_empty() {
        return 0;
    }
    let mut value = 0i64;
    for (i, byte) in bytes.iter().enumerate() {
        let byte = if i == bytes.len() - 1 {
            byte & 0x7f
        } else {
            *byte
        };
        value |= (byte as i64) << (8 * i);
    }
    if bytes[bytes.len() - 1] & 0x80 != 0 {
        -value
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outpoint::OutPoint;
    use crate::transaction::{TxIn, TxOut};

    fn coinbase(height: i32) -> Transaction {
        Transaction {
            version: 2,
            vin: vec![TxIn::new(OutPoint::null(), encode_height_push(height), 0)],
            vout: vec![TxOut {
                value: 50_0000_0000,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn header_is_eighty_bytes() {
        let header = BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: 0,
            bits: 0x207f_ffff,
            nonce: 0,
        };
        assert_eq!(header.consensus_encode().len(), HEADER_SIZE);
    }

    #[test]
    fn immutable_block_memoizes_hash() {
        let mut block = Block::new(
            BlockHeader {
                version: 2,
                prev_block: [0u8; 32],
                merkle_root: [0u8; 32],
                time: 0,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            vec![coinbase(1)],
        );
        let before = block.hash();
        block.header.nonce = 7;
        // Memoized: the stale hash is intentionally returned.
        assert_eq!(block.hash(), before);

        let mut template = Block::new_mutable(block.header, block.transactions.clone());
        let first = template.hash();
        template.header.nonce = 8;
        assert_ne!(template.hash(), first);
    }

    #[test]
    fn height_push_roundtrip() {
        for height in [0, 1, 16, 17, 127, 128, 255, 500_000, i32::MAX] {
            let push = encode_height_push(height);
            assert_eq!(parse_height_push(&push), Some(height), "height {height}");
        }
    }

    #[test]
    fn coinbase_height_requires_version_two() {
        let mut block = Block::new_mutable(
            BlockHeader {
                version: 1,
                prev_block: [0u8; 32],
                merkle_root: [0u8; 32],
                time: 0,
                bits: 0,
                nonce: 0,
            },
            vec![coinbase(42)],
        );
        assert_eq!(block.coinbase_height(), -1);
        block.header.version = 2;
        assert_eq!(block.coinbase_height(), 42);
    }

    #[test]
    fn witness_commitment_takes_last_matching_output() {
        let mut cb = coinbase(1);
        let mut script_a = WITNESS_COMMITMENT_PREFIX.to_vec();
        script_a.extend_from_slice(&[0xaa; 32]);
        let mut script_b = WITNESS_COMMITMENT_PREFIX.to_vec();
        script_b.extend_from_slice(&[0xbb; 32]);
        cb.vout.push(TxOut {
            value: 0,
            script_pubkey: script_a,
        });
        cb.vout.push(TxOut {
            value: 0,
            script_pubkey: script_b,
        });
        cb.vin[0].witness = vec![vec![0u8; 32]];
        let block = Block::new(
            BlockHeader {
                version: 2,
                prev_block: [0u8; 32],
                merkle_root: [0u8; 32],
                time: 0,
                bits: 0,
                nonce: 0,
            },
            vec![cb],
        );
        assert_eq!(block.witness_commitment(), Some([0xbb; 32]));
        assert_eq!(block.witness_nonce(), Some([0u8; 32]));
    }
}
