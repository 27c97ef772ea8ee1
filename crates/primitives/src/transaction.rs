//! Transactions and their consensus serialization (BIP144 witness form).

use std::collections::HashSet;

use bitcoind_consensus::constants::{
    LOCKTIME_THRESHOLD, MAX_BLOCK_SIZE, WITNESS_SCALE_FACTOR,
};
use bitcoind_consensus::money::MAX_MONEY;
use bitcoind_consensus::{Hash256, VerifyError};

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

/// Current transaction version produced by this node.
pub const CURRENT_VERSION: i32 = 2;

pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

impl TxIn {
    pub fn new(prevout: OutPoint, script_sig: Vec<u8>, sequence: u32) -> Self {
        Self {
            prevout,
            script_sig,
            sequence,
            witness: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn has_witness(&self) -> bool {
        self.vin.iter().any(|input| !input.witness.is_empty())
    }

    /// Transaction id: hash of the serialization without witness data.
    pub fn txid(&self) -> Hash256 {
        sha256d(&self.encode_stripped())
    }

    /// Witness transaction id: hash of the full serialization. Equal to
    /// `txid` for transactions without witness data.
    pub fn wtxid(&self) -> Hash256 {
        if !self.has_witness() {
            return self.txid();
        }
        sha256d(&self.consensus_encode())
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.size());
        self.encode_into(&mut encoder, self.has_witness());
        encoder.into_inner()
    }

    pub fn encode_stripped(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.stripped_size());
        self.encode_into(&mut encoder, false);
        encoder.into_inner()
    }

    pub fn encode_into(&self, encoder: &mut Encoder, witness: bool) {
        encoder.write_i32_le(self.version);
        if witness {
            encoder.write_u8(0x00);
            encoder.write_u8(0x01);
        }
        encoder.write_var_int(self.vin.len() as u64);
        for input in &self.vin {
            input.prevout.encode_into(encoder);
            encoder.write_var_bytes(&input.script_sig);
            encoder.write_u32_le(input.sequence);
        }
        encoder.write_var_int(self.vout.len() as u64);
        for output in &self.vout {
            encoder.write_i64_le(output.value);
            encoder.write_var_bytes(&output.script_pubkey);
        }
        if witness {
            for input in &self.vin {
                encoder.write_var_int(input.witness.len() as u64);
                for item in &input.witness {
                    encoder.write_var_bytes(item);
                }
            }
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(tx)
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let mut count = decoder.read_var_int()? as usize;
        let mut witness = false;
        if count == 0 {
            // BIP144 marker byte: a zero input count signals the witness
            // flag follows.
            if decoder.read_u8()? != 0x01 {
                return Err(DecodeError::InvalidWitnessFlag);
            }
            witness = true;
            count = decoder.read_var_int()? as usize;
        }
        if count > decoder.remaining() {
            return Err(DecodeError::Oversized);
        }
        let mut vin = Vec::with_capacity(count);
        for _ in 0..count {
            let prevout = OutPoint::decode_from(decoder)?;
            let script_sig = decoder.read_var_bytes()?;
            let sequence = decoder.read_u32_le()?;
            vin.push(TxIn {
                prevout,
                script_sig,
                sequence,
                witness: Vec::new(),
            });
        }
        let count = decoder.read_var_int()? as usize;
        if count > decoder.remaining() {
            return Err(DecodeError::Oversized);
        }
        let mut vout = Vec::with_capacity(count);
        for _ in 0..count {
            let value = decoder.read_i64_le()?;
            let script_pubkey = decoder.read_var_bytes()?;
            vout.push(TxOut {
                value,
                script_pubkey,
            });
        }
        if witness {
            for input in &mut vin {
                let items = decoder.read_var_int()? as usize;
                if items > decoder.remaining() {
                    return Err(DecodeError::Oversized);
                }
                let mut stack = Vec::with_capacity(items);
                for _ in 0..items {
                    stack.push(decoder.read_var_bytes()?);
                }
                input.witness = stack;
            }
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }

    pub fn size(&self) -> usize {
        let stripped = self.stripped_size();
        if !self.has_witness() {
            return stripped;
        }
        let mut size = stripped + 2;
        for input in &self.vin {
            size += var_int_size(input.witness.len() as u64);
            for item in &input.witness {
                size += var_int_size(item.len() as u64) + item.len();
            }
        }
        size
    }

    pub fn stripped_size(&self) -> usize {
        let mut size = 4 + 4;
        size += var_int_size(self.vin.len() as u64);
        for input in &self.vin {
            size += 36 + var_int_size(input.script_sig.len() as u64) + input.script_sig.len() + 4;
        }
        size += var_int_size(self.vout.len() as u64);
        for output in &self.vout {
            size += 8
                + var_int_size(output.script_pubkey.len() as u64)
                + output.script_pubkey.len();
        }
        size
    }

    /// Weight per BIP141: three times the stripped size plus the total size.
    pub fn weight(&self) -> usize {
        (WITNESS_SCALE_FACTOR - 1) * self.stripped_size() + self.size()
    }

    pub fn output_value(&self) -> i64 {
        self.vout
            .iter()
            .fold(0i64, |total, output| total.saturating_add(output.value))
    }

    /// Absolute lock-time check. `height` and `time` describe the block
    /// the transaction would be included in.
    pub fn is_final(&self, height: i32, time: i64) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let threshold = if self.lock_time < LOCKTIME_THRESHOLD {
            height as i64
        } else {
            time
        };
        if (self.lock_time as i64) < threshold {
            return true;
        }
        self.vin
            .iter()
            .all(|input| input.sequence == SEQUENCE_FINAL)
    }

    /// Context-free transaction checks.
    pub fn check_sanity(&self) -> Result<(), VerifyError> {
        if self.vin.is_empty() {
            return Err(VerifyError::invalid("bad-txns-vin-empty", 100));
        }
        if self.vout.is_empty() {
            return Err(VerifyError::invalid("bad-txns-vout-empty", 100));
        }
        if self.stripped_size() > MAX_BLOCK_SIZE {
            return Err(VerifyError::invalid("bad-txns-oversize", 100));
        }

        let mut total = 0i64;
        for output in &self.vout {
            if output.value < 0 {
                return Err(VerifyError::invalid("bad-txns-vout-negative", 100));
            }
            if output.value > MAX_MONEY {
                return Err(VerifyError::invalid("bad-txns-vout-toolarge", 100));
            }
            total = total
                .checked_add(output.value)
                .ok_or_else(|| VerifyError::invalid("bad-txns-txouttotal-toolarge", 100))?;
            if total > MAX_MONEY {
                return Err(VerifyError::invalid("bad-txns-txouttotal-toolarge", 100));
            }
        }

        let mut seen = HashSet::with_capacity(self.vin.len());
        for input in &self.vin {
            if !seen.insert(input.prevout) {
                return Err(VerifyError::invalid("bad-txns-inputs-duplicate", 100));
            }
        }

        if self.is_coinbase() {
            let len = self.vin[0].script_sig.len();
            if !(2..=100).contains(&len) {
                return Err(VerifyError::invalid("bad-cb-length", 100));
            }
        } else {
            for input in &self.vin {
                if input.prevout.is_null() {
                    return Err(VerifyError::invalid("bad-txns-prevout-null", 10));
                }
            }
        }

        Ok(())
    }
}

pub fn var_int_size(value: u64) -> usize {
    if value < 0xfd {
        1
    } else if value <= 0xffff {
        3
    } else if value <= 0xffff_ffff {
        5
    } else {
        9
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_tx() -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn::new(
                OutPoint::new([0x11; 32], 0),
                vec![0x51],
                SEQUENCE_FINAL,
            )],
            vout: vec![TxOut {
                value: 5_000_000_000,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn stripped_and_full_size_agree_without_witness() {
        let tx = simple_tx();
        let encoded = tx.consensus_encode();
        assert_eq!(encoded.len(), tx.size());
        assert_eq!(tx.size(), tx.stripped_size());
        assert_eq!(tx.weight(), 4 * tx.size());
        assert_eq!(tx.txid(), tx.wtxid());
    }

    #[test]
    fn witness_roundtrip_preserves_txid() {
        let mut tx = simple_tx();
        tx.vin[0].witness = vec![vec![0xab; 70], vec![0xcd; 33]];
        let encoded = tx.consensus_encode();
        assert_eq!(encoded.len(), tx.size());
        let decoded = Transaction::consensus_decode(&encoded).expect("decode witness tx");
        assert_eq!(decoded, tx);
        assert_eq!(decoded.txid(), tx.txid());
        assert_ne!(decoded.wtxid(), decoded.txid());
        assert!(tx.weight() < 4 * tx.size());
    }

    #[test]
    fn duplicate_inputs_rejected() {
        let mut tx = simple_tx();
        tx.vin.push(tx.vin[0].clone());
        let err = tx.check_sanity().expect_err("duplicate inputs");
        assert_eq!(err.reason, "bad-txns-inputs-duplicate");
    }

    #[test]
    fn coinbase_script_length_bounds() {
        let mut tx = simple_tx();
        tx.vin[0].prevout = OutPoint::null();
        tx.vin[0].script_sig = vec![0x00];
        assert_eq!(
            tx.check_sanity().expect_err("short script").reason,
            "bad-cb-length"
        );
        tx.vin[0].script_sig = vec![0x00; 2];
        tx.check_sanity().expect("valid coinbase");
    }

    #[test]
    fn locktime_finality() {
        let mut tx = simple_tx();
        tx.lock_time = 100;
        tx.vin[0].sequence = 0;
        assert!(!tx.is_final(100, 0));
        assert!(tx.is_final(101, 0));
        tx.lock_time = 1_600_000_000;
        assert!(!tx.is_final(101, 1_600_000_000));
        assert!(tx.is_final(101, 1_600_000_001));
        tx.vin[0].sequence = SEQUENCE_FINAL;
        assert!(tx.is_final(0, 0));
    }
}
