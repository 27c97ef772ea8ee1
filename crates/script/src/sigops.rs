//! Signature-operation accounting.
//!
//! Legacy and P2SH sigops weigh four times a witness sigop in the block
//! cost limit (BIP141).

use bitcoind_primitives::transaction::Transaction;
use bitcoind_primitives::OutPoint;

use crate::standard::{is_p2sh, last_push, next_op, witness_program};
use crate::{VERIFY_P2SH, VERIFY_WITNESS};

const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKSIGVERIFY: u8 = 0xad;
const OP_CHECKMULTISIG: u8 = 0xae;
const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

/// Upper bound assumed for CHECKMULTISIG when the key count is unknown.
pub const MAX_MULTISIG_PUBKEYS: u32 = 20;

/// Count sigops in a raw script. With `accurate`, CHECKMULTISIG preceded
/// by a small-integer opcode counts that many keys; otherwise the
/// maximum is assumed.
pub fn count_sigops(script: &[u8], accurate: bool) -> u32 {
    let mut count = 0u32;
    let mut last_op = 0xffu8;
    let mut pos = 0;
    while pos < script.len() {
        let Some((op, data)) = next_op(script, &mut pos) else {
            break;
        };
        match op {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                if accurate && (0x51..=0x60).contains(&last_op) {
                    count += (last_op - 0x50) as u32;
                } else {
                    count += MAX_MULTISIG_PUBKEYS;
                }
            }
            _ => {}
        }
        if data.is_none() {
            last_op = op;
        } else {
            last_op = 0xff;
        }
    }
    count
}

/// Unscaled legacy sigops of a transaction: input and output scripts,
/// inaccurate multisig counting. This is what the per-block legacy limit
/// constrains.
pub fn tx_legacy_sigops(tx: &Transaction) -> u64 {
    let mut count = 0u64;
    for input in &tx.vin {
        count += count_sigops(&input.script_sig, false) as u64;
    }
    for output in &tx.vout {
        count += count_sigops(&output.script_pubkey, false) as u64;
    }
    count
}

/// Sigops contributed by a P2SH spend: the redeem script counted
/// accurately.
pub fn p2sh_sigops(prev_script: &[u8], script_sig: &[u8]) -> u32 {
    if !is_p2sh(prev_script) {
        return 0;
    }
    match last_push(script_sig) {
        Some(redeem) => count_sigops(&redeem, true),
        None => 0,
    }
}

/// Sigops contributed by a witness spend, unscaled (BIP141): one for
/// P2WPKH, an accurate count of the witness script for P2WSH.
pub fn witness_sigops(prev_script: &[u8], script_sig: &[u8], witness: &[Vec<u8>]) -> u32 {
    if let Some((version, program)) = witness_program(prev_script) {
        return program_sigops(version, program.len(), witness);
    }
    if is_p2sh(prev_script) {
        // P2SH-wrapped witness program.
        if let Some(redeem) = last_push(script_sig) {
            if let Some((version, program)) = witness_program(&redeem) {
                return program_sigops(version, program.len(), witness);
            }
        }
    }
    0
}

fn program_sigops(version: u8, program_len: usize, witness: &[Vec<u8>]) -> u32 {
    if version != 0 {
        return 0;
    }
    match program_len {
        20 => 1,
        32 => match witness.last() {
            Some(script) => count_sigops(script, true),
            None => 0,
        },
        _ => 0,
    }
}

/// Weighted sigop cost of a transaction (BIP141): legacy and P2SH count
/// four times, witness once. `prev_script` resolves an outpoint to the
/// coin script being spent.
pub fn tx_sigops_cost<F>(tx: &Transaction, flags: u32, prev_script: F) -> u64
where
    F: Fn(&OutPoint) -> Option<Vec<u8>>,
{
    let mut cost = tx_legacy_sigops(tx) * 4;
    if tx.is_coinbase() {
        return cost;
    }
    for input in &tx.vin {
        let Some(script) = prev_script(&input.prevout) else {
            continue;
        };
        if flags & VERIFY_P2SH != 0 {
            cost += p2sh_sigops(&script, &input.script_sig) as u64 * 4;
        }
        if flags & VERIFY_WITNESS != 0 {
            cost += witness_sigops(&script, &input.script_sig, &input.witness) as u64;
        }
    }
    cost
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksig_counts_one() {
        // P2PKH template.
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&[0u8; 20]);
        script.extend_from_slice(&[0x88, OP_CHECKSIG]);
        assert_eq!(count_sigops(&script, false), 1);
        assert_eq!(count_sigops(&script, true), 1);
    }

    #[test]
    fn multisig_counting_modes() {
        // 2-of-3 multisig: OP_2 <key> <key> <key> OP_3 OP_CHECKMULTISIG.
        let mut script = vec![0x52];
        for _ in 0..3 {
            script.push(0x21);
            script.extend_from_slice(&[0u8; 33]);
        }
        script.extend_from_slice(&[0x53, OP_CHECKMULTISIG]);
        assert_eq!(count_sigops(&script, true), 3);
        assert_eq!(count_sigops(&script, false), MAX_MULTISIG_PUBKEYS);
    }

    #[test]
    fn p2wpkh_costs_one_witness_sigop() {
        let mut prev = vec![0x00, 0x14];
        prev.extend_from_slice(&[0xaa; 20]);
        assert_eq!(witness_sigops(&prev, &[], &[vec![0x30], vec![0x02]]), 1);
    }

    #[test]
    fn p2wsh_counts_witness_script_accurately() {
        let mut prev = vec![0x00, 0x20];
        prev.extend_from_slice(&[0xbb; 32]);
        let witness_script = vec![OP_CHECKSIG, OP_CHECKSIG];
        assert_eq!(
            witness_sigops(&prev, &[], &[vec![], witness_script]),
            2
        );
    }
}
