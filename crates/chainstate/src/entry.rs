//! One node of the block index.

use bitcoind_consensus::{Hash256, VerifyError};
use bitcoind_primitives::block::Block;
use bitcoind_primitives::encoding::{DecodeError, Decoder, Encoder};
use bitcoind_pow::block_proof;
use primitive_types::U256;

/// An indexed block on any known chain. Entries are immutable once
/// committed; `chainwork` is computed once at insertion.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChainEntry {
    pub hash: Hash256,
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub height: i32,
    /// Cumulative proof of work up to and including this block,
    /// big-endian so byte order matches numeric order.
    pub chainwork: [u8; 32],
    /// Ancestor hash at `skip_height(height)`, giving O(log n) ancestor
    /// walks.
    pub skip: Hash256,
}

impl ChainEntry {
    /// Index a block on top of its parent. The skip pointer is filled in
    /// by the database, which can resolve ancestors.
    pub fn from_block(block: &Block, prev: Option<&ChainEntry>) -> Result<Self, VerifyError> {
        let header = &block.header;
        let proof =
            block_proof(header.bits).map_err(|_| VerifyError::invalid("bad-diffbits", 100))?;
        let (height, chainwork) = match prev {
            Some(prev) => (prev.height + 1, prev.chainwork_value() + proof),
            None => (0, proof),
        };
        Ok(Self {
            hash: block.hash(),
            version: header.version,
            prev_block: header.prev_block,
            merkle_root: header.merkle_root,
            time: header.time,
            bits: header.bits,
            nonce: header.nonce,
            height,
            chainwork: chainwork.to_big_endian(),
            skip: [0u8; 32],
        })
    }

    pub fn chainwork_value(&self) -> U256 {
        U256::from_big_endian(&self.chainwork)
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(148);
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
        encoder.write_u32_le(self.height as u32);
        encoder.write_bytes(&self.chainwork);
        encoder.write_hash(&self.skip);
        encoder.into_inner()
    }

    pub fn decode(hash: Hash256, bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_i32_le()?;
        let prev_block = decoder.read_hash()?;
        let merkle_root = decoder.read_hash()?;
        let time = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let nonce = decoder.read_u32_le()?;
        let height = decoder.read_u32_le()? as i32;
        let chainwork = decoder.read_hash()?;
        let skip = decoder.read_hash()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            hash,
            version,
            prev_block,
            merkle_root,
            time,
            bits,
            nonce,
            height,
            chainwork,
            skip,
        })
    }
}

fn invert_lowest_one(n: i32) -> i32 {
    n & (n - 1)
}

/// Height the skip pointer of an entry at `height` points to. Skips
/// shrink exponentially toward the target of a walk.
pub fn skip_height(height: i32) -> i32 {
    if height < 2 {
        return 0;
    }
    if height & 1 == 1 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_heights_descend() {
        assert_eq!(skip_height(0), 0);
        assert_eq!(skip_height(1), 0);
        assert_eq!(skip_height(2), 0);
        for height in 2..10_000 {
            let skip = skip_height(height);
            assert!(skip < height);
            assert!(skip >= 0);
        }
    }

    #[test]
    fn entry_roundtrips() {
        let entry = ChainEntry {
            hash: [7u8; 32],
            version: 0x2000_0000,
            prev_block: [1u8; 32],
            merkle_root: [2u8; 32],
            time: 1_296_700_000,
            bits: 0x207f_ffff,
            nonce: 99,
            height: 42,
            chainwork: [3u8; 32],
            skip: [4u8; 32],
        };
        let decoded = ChainEntry::decode([7u8; 32], &entry.encode()).expect("decode entry");
        assert_eq!(decoded, entry);
    }
}
