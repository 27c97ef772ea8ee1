//! Transaction digests committed to by signatures.

use bitcoind_consensus::Hash256;
use bitcoind_primitives::encoding::Encoder;
use bitcoind_primitives::hash::sha256d;
use bitcoind_primitives::transaction::Transaction;

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SigVersion {
    /// Legacy digest algorithm.
    Base,
    /// Version-0 witness digest (BIP143).
    WitnessV0,
}

pub fn signature_hash(
    tx: &Transaction,
    index: usize,
    script_code: &[u8],
    value: i64,
    hash_type: u32,
    version: SigVersion,
) -> Hash256 {
    match version {
        SigVersion::Base => legacy_hash(tx, index, script_code, hash_type),
        SigVersion::WitnessV0 => witness_v0_hash(tx, index, script_code, value, hash_type),
    }
}

fn legacy_hash(tx: &Transaction, index: usize, script_code: &[u8], hash_type: u32) -> Hash256 {
    let base_type = hash_type & 0x1f;
    let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;

    // Historical quirk: SIGHASH_SINGLE with no matching output signs the
    // digest 0x01.
    if base_type == SIGHASH_SINGLE && index >= tx.vout.len() {
        let mut one = [0u8; 32];
        one[0] = 0x01;
        return one;
    }

    let script_code = strip_code_separators(script_code);

    let mut encoder = Encoder::new();
    encoder.write_i32_le(tx.version);

    if anyone_can_pay {
        encoder.write_var_int(1);
        let input = &tx.vin[index];
        input.prevout.encode_into(&mut encoder);
        encoder.write_var_bytes(&script_code);
        encoder.write_u32_le(input.sequence);
    } else {
        encoder.write_var_int(tx.vin.len() as u64);
        for (i, input) in tx.vin.iter().enumerate() {
            input.prevout.encode_into(&mut encoder);
            if i == index {
                encoder.write_var_bytes(&script_code);
            } else {
                encoder.write_var_int(0);
            }
            if i != index && matches!(base_type, SIGHASH_NONE | SIGHASH_SINGLE) {
                encoder.write_u32_le(0);
            } else {
                encoder.write_u32_le(input.sequence);
            }
        }
    }

    match base_type {
        SIGHASH_NONE => encoder.write_var_int(0),
        SIGHASH_SINGLE => {
            encoder.write_var_int(index as u64 + 1);
            for _ in 0..index {
                encoder.write_i64_le(-1);
                encoder.write_var_int(0);
            }
            let output = &tx.vout[index];
            encoder.write_i64_le(output.value);
            encoder.write_var_bytes(&output.script_pubkey);
        }
        _ => {
            encoder.write_var_int(tx.vout.len() as u64);
            for output in &tx.vout {
                encoder.write_i64_le(output.value);
                encoder.write_var_bytes(&output.script_pubkey);
            }
        }
    }

    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(hash_type);
    sha256d(&encoder.into_inner())
}

fn witness_v0_hash(
    tx: &Transaction,
    index: usize,
    script_code: &[u8],
    value: i64,
    hash_type: u32,
) -> Hash256 {
    let base_type = hash_type & 0x1f;
    let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;

    let hash_prevouts = if anyone_can_pay {
        [0u8; 32]
    } else {
        let mut encoder = Encoder::new();
        for input in &tx.vin {
            input.prevout.encode_into(&mut encoder);
        }
        sha256d(&encoder.into_inner())
    };

    let hash_sequence = if anyone_can_pay || matches!(base_type, SIGHASH_NONE | SIGHASH_SINGLE) {
        [0u8; 32]
    } else {
        let mut encoder = Encoder::new();
        for input in &tx.vin {
            encoder.write_u32_le(input.sequence);
        }
        sha256d(&encoder.into_inner())
    };

    let hash_outputs = match base_type {
        SIGHASH_NONE => [0u8; 32],
        SIGHASH_SINGLE => {
            if index < tx.vout.len() {
                let mut encoder = Encoder::new();
                let output = &tx.vout[index];
                encoder.write_i64_le(output.value);
                encoder.write_var_bytes(&output.script_pubkey);
                sha256d(&encoder.into_inner())
            } else {
                [0u8; 32]
            }
        }
        _ => {
            let mut encoder = Encoder::new();
            for output in &tx.vout {
                encoder.write_i64_le(output.value);
                encoder.write_var_bytes(&output.script_pubkey);
            }
            sha256d(&encoder.into_inner())
        }
    };

    let input = &tx.vin[index];
    let mut encoder = Encoder::new();
    encoder.write_i32_le(tx.version);
    encoder.write_hash(&hash_prevouts);
    encoder.write_hash(&hash_sequence);
    input.prevout.encode_into(&mut encoder);
    encoder.write_var_bytes(script_code);
    encoder.write_i64_le(value);
    encoder.write_u32_le(input.sequence);
    encoder.write_hash(&hash_outputs);
    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(hash_type);
    sha256d(&encoder.into_inner())
}

fn strip_code_separators(script: &[u8]) -> Vec<u8> {
    use crate::standard::next_op;
    const OP_CODESEPARATOR: u8 = 0xab;
    if !script.contains(&OP_CODESEPARATOR) {
        return script.to_vec();
    }
    let mut out = Vec::with_capacity(script.len());
    let mut pos = 0;
    loop {
        let start = pos;
        match next_op(script, &mut pos) {
            Some((OP_CODESEPARATOR, None)) => {}
            Some(_) => out.extend_from_slice(&script[start..pos]),
            None => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoind_primitives::transaction::{TxIn, TxOut};
    use bitcoind_primitives::OutPoint;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            vin: vec![
                TxIn::new(OutPoint::new([1u8; 32], 0), Vec::new(), 0xffff_fffe),
                TxIn::new(OutPoint::new([2u8; 32], 1), Vec::new(), 0xffff_fffe),
            ],
            vout: vec![TxOut {
                value: 40_000,
                script_pubkey: vec![0x51],
            }],
            lock_time: 17,
        }
    }

    #[test]
    fn digests_differ_per_input_and_type() {
        let tx = sample_tx();
        let code = vec![0x76, 0xa9, 0x14];
        let a = signature_hash(&tx, 0, &code, 50_000, SIGHASH_ALL, SigVersion::Base);
        let b = signature_hash(&tx, 1, &code, 50_000, SIGHASH_ALL, SigVersion::Base);
        let c = signature_hash(&tx, 0, &code, 50_000, SIGHASH_NONE, SigVersion::Base);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn single_out_of_range_signs_digest_one() {
        let tx = sample_tx();
        let digest = signature_hash(&tx, 1, &[0x51], 0, SIGHASH_SINGLE, SigVersion::Base);
        let mut one = [0u8; 32];
        one[0] = 0x01;
        assert_eq!(digest, one);
    }

    #[test]
    fn witness_digest_commits_to_value() {
        let tx = sample_tx();
        let a = signature_hash(&tx, 0, &[0x51], 50_000, SIGHASH_ALL, SigVersion::WitnessV0);
        let b = signature_hash(&tx, 0, &[0x51], 50_001, SIGHASH_ALL, SigVersion::WitnessV0);
        assert_ne!(a, b);
    }
}
