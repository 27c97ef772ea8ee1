//! Script execution.
//!
//! Implements the opcodes that occur in standard spends (pushes, flow
//! control, stack and numeric ops, hashing, signature checks, the BIP65
//! and BIP112 lock-time checks) plus P2SH and version-0 witness program
//! dispatch. Disabled opcodes fail unconditionally.

use std::sync::OnceLock;

use bitcoind_consensus::constants::{
    LOCKTIME_THRESHOLD, SEQUENCE_DISABLE_FLAG, SEQUENCE_MASK, SEQUENCE_TYPE_FLAG,
};
use bitcoind_primitives::hash::{hash160, sha256, sha256d};
use bitcoind_primitives::transaction::{Transaction, SEQUENCE_FINAL};
use secp256k1::{ecdsa, Message, PublicKey, Secp256k1, VerifyOnly};

use crate::sighash::{signature_hash, SigVersion};
use crate::standard::{is_p2sh, is_push_only, next_op, witness_program};
use crate::{VERIFY_CHECKLOCKTIMEVERIFY, VERIFY_CHECKSEQUENCEVERIFY, VERIFY_DERSIG, VERIFY_NULLDUMMY, VERIFY_P2SH, VERIFY_WITNESS};

const MAX_SCRIPT_SIZE: usize = 10_000;
const MAX_STACK_SIZE: usize = 1_000;
const MAX_PUSH_SIZE: usize = 520;
const MAX_OPS_PER_SCRIPT: usize = 201;
const MAX_MULTISIG_KEYS: i64 = 20;

const OP_0: u8 = 0x00;
const OP_1NEGATE: u8 = 0x4f;
const OP_RESERVED: u8 = 0x50;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_NOP: u8 = 0x61;
const OP_IF: u8 = 0x63;
const OP_NOTIF: u8 = 0x64;
const OP_ELSE: u8 = 0x67;
const OP_ENDIF: u8 = 0x68;
const OP_VERIFY: u8 = 0x69;
const OP_RETURN: u8 = 0x6a;
const OP_TOALTSTACK: u8 = 0x6b;
const OP_FROMALTSTACK: u8 = 0x6c;
const OP_2DROP: u8 = 0x6d;
const OP_2DUP: u8 = 0x6e;
const OP_DROP: u8 = 0x75;
const OP_DUP: u8 = 0x76;
const OP_NIP: u8 = 0x77;
const OP_OVER: u8 = 0x78;
const OP_ROT: u8 = 0x7b;
const OP_SWAP: u8 = 0x7c;
const OP_SIZE: u8 = 0x82;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_1ADD: u8 = 0x8b;
const OP_1SUB: u8 = 0x8c;
const OP_NEGATE: u8 = 0x8f;
const OP_ABS: u8 = 0x90;
const OP_NOT: u8 = 0x91;
const OP_0NOTEQUAL: u8 = 0x92;
const OP_ADD: u8 = 0x93;
const OP_SUB: u8 = 0x94;
const OP_BOOLAND: u8 = 0x9a;
const OP_BOOLOR: u8 = 0x9b;
const OP_NUMEQUAL: u8 = 0x9c;
const OP_NUMEQUALVERIFY: u8 = 0x9d;
const OP_NUMNOTEQUAL: u8 = 0x9e;
const OP_LESSTHAN: u8 = 0x9f;
const OP_GREATERTHAN: u8 = 0xa0;
const OP_LESSTHANOREQUAL: u8 = 0xa1;
const OP_GREATERTHANOREQUAL: u8 = 0xa2;
const OP_MIN: u8 = 0xa3;
const OP_MAX: u8 = 0xa4;
const OP_WITHIN: u8 = 0xa5;
const OP_SHA256: u8 = 0xa8;
const OP_HASH160: u8 = 0xa9;
const OP_HASH256: u8 = 0xaa;
const OP_CODESEPARATOR: u8 = 0xab;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKSIGVERIFY: u8 = 0xad;
const OP_CHECKMULTISIG: u8 = 0xae;
const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
const OP_CHECKSEQUENCEVERIFY: u8 = 0xb2;

const DISABLED_OPS: [u8; 15] = [
    0x7e, 0x7f, 0x80, 0x81, // CAT SUBSTR LEFT RIGHT
    0x83, 0x84, 0x85, 0x86, // INVERT AND OR XOR
    0x8d, 0x8e, // 2MUL 2DIV
    0x95, 0x96, 0x97, 0x98, 0x99, // MUL DIV MOD LSHIFT RSHIFT
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptError {
    EvalFalse,
    VerifyFailed,
    BadOpcode,
    DisabledOpcode,
    InvalidStackOperation,
    UnbalancedConditional,
    OpCount,
    StackSize,
    PushSize,
    ScriptSize,
    PubkeyCount,
    SigCount,
    SigDer,
    NullDummy,
    SigPushOnly,
    NegativeLocktime,
    UnsatisfiedLocktime,
    WitnessProgramMismatch,
    WitnessProgramEmpty,
    WitnessMalleated,
    WitnessMalleatedP2sh,
    WitnessUnexpected,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ScriptError::EvalFalse => "script evaluated to false",
            ScriptError::VerifyFailed => "verify operation failed",
            ScriptError::BadOpcode => "unknown or malformed opcode",
            ScriptError::DisabledOpcode => "disabled opcode",
            ScriptError::InvalidStackOperation => "stack underflow",
            ScriptError::UnbalancedConditional => "unbalanced conditional",
            ScriptError::OpCount => "operation limit exceeded",
            ScriptError::StackSize => "stack limit exceeded",
            ScriptError::PushSize => "push size exceeded",
            ScriptError::ScriptSize => "script too large",
            ScriptError::PubkeyCount => "invalid pubkey count",
            ScriptError::SigCount => "invalid signature count",
            ScriptError::SigDer => "non-strict signature encoding",
            ScriptError::NullDummy => "multisig dummy not null",
            ScriptError::SigPushOnly => "signature script is not push-only",
            ScriptError::NegativeLocktime => "negative locktime operand",
            ScriptError::UnsatisfiedLocktime => "locktime requirement not satisfied",
            ScriptError::WitnessProgramMismatch => "witness program mismatch",
            ScriptError::WitnessProgramEmpty => "witness program witness empty",
            ScriptError::WitnessMalleated => "witness spend has signature script",
            ScriptError::WitnessMalleatedP2sh => "p2sh witness signature script mismatch",
            ScriptError::WitnessUnexpected => "unexpected witness data",
        };
        write!(f, "{text}")
    }
}

impl std::error::Error for ScriptError {}

fn secp() -> &'static Secp256k1<VerifyOnly> {
    static SECP: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::verification_only)
}

struct Checker<'a> {
    tx: &'a Transaction,
    index: usize,
    value: i64,
}

impl Checker<'_> {
    fn check_sig(
        &self,
        sig: &[u8],
        pubkey: &[u8],
        script_code: &[u8],
        flags: u32,
        version: SigVersion,
    ) -> Result<bool, ScriptError> {
        if sig.is_empty() {
            return Ok(false);
        }
        let (der, hash_type) = sig.split_at(sig.len() - 1);
        let hash_type = hash_type[0] as u32;
        let mut signature = match ecdsa::Signature::from_der(der) {
            Ok(signature) => signature,
            Err(_) => {
                if flags & VERIFY_DERSIG != 0 {
                    return Err(ScriptError::SigDer);
                }
                return Ok(false);
            }
        };
        let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
            return Ok(false);
        };
        let digest = signature_hash(
            self.tx,
            self.index,
            script_code,
            self.value,
            hash_type,
            version,
        );
        let message = Message::from_digest(digest);
        signature.normalize_s();
        Ok(secp().verify_ecdsa(&message, &signature, &pubkey).is_ok())
    }

    fn check_locktime(&self, num: i64) -> Result<(), ScriptError> {
        let lock_time = self.tx.lock_time as i64;
        let same_type = (num < LOCKTIME_THRESHOLD as i64) == (lock_time < LOCKTIME_THRESHOLD as i64);
        if !same_type || num > lock_time {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        if self.tx.vin[self.index].sequence == SEQUENCE_FINAL {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        Ok(())
    }

    fn check_sequence(&self, num: i64) -> Result<(), ScriptError> {
        let num = num as u32;
        if num & SEQUENCE_DISABLE_FLAG != 0 {
            return Ok(());
        }
        if self.tx.version < 2 {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        let sequence = self.tx.vin[self.index].sequence;
        if sequence & SEQUENCE_DISABLE_FLAG != 0 {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        if num & SEQUENCE_TYPE_FLAG != sequence & SEQUENCE_TYPE_FLAG {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        if num & SEQUENCE_MASK > sequence & SEQUENCE_MASK {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        Ok(())
    }
}

fn cast_to_bool(bytes: &[u8]) -> bool {
    for (i, byte) in bytes.iter().enumerate() {
        if *byte != 0 {
            // A negative zero is false.
            return !(i == bytes.len() - 1 && *byte == 0x80);
        }
    }
    false
}

fn num_from_bytes(bytes: &[u8], max_len: usize) -> Result<i64, ScriptError> {
    if bytes.len() > max_len {
        return Err(ScriptError::BadOpcode);
    }
    if bytes.is_empty() {
        return Ok(0);
    }
    let mut value = 0i64;
    for (i, byte) in bytes.iter().enumerate() {
        let byte = if i == bytes.len() - 1 { byte & 0x7f } else { *byte };
        value |= (byte as i64) << (8 * i);
    }
    if bytes[bytes.len() - 1] & 0x80 != 0 {
        Ok(-value)
    } else {
        Ok(value)
    }
}

fn num_to_bytes(value: i64) -> Vec<u8> {
    bitcoind_primitives::block::encode_script_num(value)
}

fn eval(
    script: &[u8],
    stack: &mut Vec<Vec<u8>>,
    flags: u32,
    checker: &Checker<'_>,
    version: SigVersion,
) -> Result<(), ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }

    let mut alt: Vec<Vec<u8>> = Vec::new();
    let mut exec: Vec<bool> = Vec::new();
    let mut op_count = 0usize;
    let mut last_sep = 0usize;
    let mut pos = 0usize;

    while pos < script.len() {
        let Some((op, data)) = next_op(script, &mut pos) else {
            return Err(ScriptError::BadOpcode);
        };
        let executing = exec.iter().all(|flag| *flag);

        if DISABLED_OPS.contains(&op) {
            return Err(ScriptError::DisabledOpcode);
        }
        if op > 0x60 {
            op_count += 1;
            if op_count > MAX_OPS_PER_SCRIPT {
                return Err(ScriptError::OpCount);
            }
        }

        if let Some(data) = data {
            if data.len() > MAX_PUSH_SIZE {
                return Err(ScriptError::PushSize);
            }
            if executing {
                stack.push(data.to_vec());
            }
        } else if executing || (OP_IF..=OP_ENDIF).contains(&op) {
            match op {
                OP_0 => stack.push(Vec::new()),
                OP_1NEGATE => stack.push(vec![0x81]),
                OP_1..=OP_16 => stack.push(vec![op - OP_RESERVED]),
                OP_NOP => {}
                OP_IF | OP_NOTIF => {
                    let mut value = false;
                    if executing {
                        let top = stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                        value = cast_to_bool(&top);
                        if op == OP_NOTIF {
                            value = !value;
                        }
                    }
                    exec.push(value);
                }
                OP_ELSE => {
                    let last = exec.last_mut().ok_or(ScriptError::UnbalancedConditional)?;
                    *last = !*last;
                }
                OP_ENDIF => {
                    exec.pop().ok_or(ScriptError::UnbalancedConditional)?;
                }
                OP_VERIFY => {
                    let top = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                    if !cast_to_bool(&top) {
                        return Err(ScriptError::VerifyFailed);
                    }
                }
                OP_RETURN => return Err(ScriptError::EvalFalse),
                OP_TOALTSTACK => {
                    alt.push(stack.pop().ok_or(ScriptError::InvalidStackOperation)?);
                }
                OP_FROMALTSTACK => {
                    stack.push(alt.pop().ok_or(ScriptError::InvalidStackOperation)?);
                }
                OP_2DROP => {
                    pop2(stack)?;
                }
                OP_2DUP => {
                    if stack.len() < 2 {
                        return Err(ScriptError::InvalidStackOperation);
                    }
                    let a = stack[stack.len() - 2].clone();
                    let b = stack[stack.len() - 1].clone();
                    stack.push(a);
                    stack.push(b);
                }
                OP_DROP => {
                    stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                }
                OP_DUP => {
                    let top = stack.last().ok_or(ScriptError::InvalidStackOperation)?.clone();
                    stack.push(top);
                }
                OP_NIP => {
                    if stack.len() < 2 {
                        return Err(ScriptError::InvalidStackOperation);
                    }
                    let len = stack.len();
                    stack.remove(len - 2);
                }
                OP_OVER => {
                    if stack.len() < 2 {
                        return Err(ScriptError::InvalidStackOperation);
                    }
                    let item = stack[stack.len() - 2].clone();
                    stack.push(item);
                }
                OP_ROT => {
                    if stack.len() < 3 {
                        return Err(ScriptError::InvalidStackOperation);
                    }
                    let len = stack.len();
                    let item = stack.remove(len - 3);
                    stack.push(item);
                }
                OP_SWAP => {
                    if stack.len() < 2 {
                        return Err(ScriptError::InvalidStackOperation);
                    }
                    let len = stack.len();
                    stack.swap(len - 2, len - 1);
                }
                OP_SIZE => {
                    let top = stack.last().ok_or(ScriptError::InvalidStackOperation)?;
                    let size = num_to_bytes(top.len() as i64);
                    stack.push(size);
                }
                OP_EQUAL | OP_EQUALVERIFY => {
                    let (b, a) = pop2(stack)?;
                    let equal = a == b;
                    if op == OP_EQUALVERIFY {
                        if !equal {
                            return Err(ScriptError::VerifyFailed);
                        }
                    } else {
                        stack.push(bool_bytes(equal));
                    }
                }
                OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                    let top = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                    let num = num_from_bytes(&top, 4)?;
                    let result = match op {
                        OP_1ADD => num + 1,
                        OP_1SUB => num - 1,
                        OP_NEGATE => -num,
                        OP_ABS => num.abs(),
                        OP_NOT => (num == 0) as i64,
                        _ => (num != 0) as i64,
                    };
                    stack.push(num_to_bytes(result));
                }
                OP_ADD | OP_SUB | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL | OP_NUMEQUALVERIFY
                | OP_NUMNOTEQUAL | OP_LESSTHAN | OP_GREATERTHAN | OP_LESSTHANOREQUAL
                | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                    let (b, a) = pop2(stack)?;
                    let b = num_from_bytes(&b, 4)?;
                    let a = num_from_bytes(&a, 4)?;
                    let result = match op {
                        OP_ADD => a + b,
                        OP_SUB => a - b,
                        OP_BOOLAND => (a != 0 && b != 0) as i64,
                        OP_BOOLOR => (a != 0 || b != 0) as i64,
                        OP_NUMEQUAL | OP_NUMEQUALVERIFY => (a == b) as i64,
                        OP_NUMNOTEQUAL => (a != b) as i64,
                        OP_LESSTHAN => (a < b) as i64,
                        OP_GREATERTHAN => (a > b) as i64,
                        OP_LESSTHANOREQUAL => (a <= b) as i64,
                        OP_GREATERTHANOREQUAL => (a >= b) as i64,
                        OP_MIN => a.min(b),
                        _ => a.max(b),
                    };
                    if op == OP_NUMEQUALVERIFY {
                        if result == 0 {
                            return Err(ScriptError::VerifyFailed);
                        }
                    } else {
                        stack.push(num_to_bytes(result));
                    }
                }
                OP_WITHIN => {
                    let max = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                    let (min, value) = pop2(stack)?;
                    let max = num_from_bytes(&max, 4)?;
                    let min = num_from_bytes(&min, 4)?;
                    let value = num_from_bytes(&value, 4)?;
                    stack.push(bool_bytes(value >= min && value < max));
                }
                OP_SHA256 => {
                    let top = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                    stack.push(sha256(&top).to_vec());
                }
                OP_HASH160 => {
                    let top = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                    stack.push(hash160(&top).to_vec());
                }
                OP_HASH256 => {
                    let top = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                    stack.push(sha256d(&top).to_vec());
                }
                OP_CODESEPARATOR => {
                    last_sep = pos;
                }
                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    let (pubkey, sig) = pop2(stack)?;
                    let result =
                        checker.check_sig(&sig, &pubkey, &script[last_sep..], flags, version)?;
                    if op == OP_CHECKSIGVERIFY {
                        if !result {
                            return Err(ScriptError::VerifyFailed);
                        }
                    } else {
                        stack.push(bool_bytes(result));
                    }
                }
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    let key_count = num_from_bytes(
                        &stack.pop().ok_or(ScriptError::InvalidStackOperation)?,
                        4,
                    )?;
                    if !(0..=MAX_MULTISIG_KEYS).contains(&key_count) {
                        return Err(ScriptError::PubkeyCount);
                    }
                    op_count += key_count as usize;
                    if op_count > MAX_OPS_PER_SCRIPT {
                        return Err(ScriptError::OpCount);
                    }
                    let mut pubkeys = pop_n(stack, key_count as usize)?;
                    let sig_count = num_from_bytes(
                        &stack.pop().ok_or(ScriptError::InvalidStackOperation)?,
                        4,
                    )?;
                    if sig_count < 0 || sig_count > key_count {
                        return Err(ScriptError::SigCount);
                    }
                    let mut sigs = pop_n(stack, sig_count as usize)?;
                    let dummy = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                    if flags & VERIFY_NULLDUMMY != 0 && !dummy.is_empty() {
                        return Err(ScriptError::NullDummy);
                    }
                    let script_code = &script[last_sep..];
                    let mut success = true;
                    while let Some(sig) = sigs.pop() {
                        let mut matched = false;
                        while let Some(pubkey) = pubkeys.pop() {
                            if checker.check_sig(&sig, &pubkey, script_code, flags, version)? {
                                matched = true;
                                break;
                            }
                        }
                        if !matched {
                            success = false;
                            break;
                        }
                    }
                    if op == OP_CHECKMULTISIGVERIFY {
                        if !success {
                            return Err(ScriptError::VerifyFailed);
                        }
                    } else {
                        stack.push(bool_bytes(success));
                    }
                }
                OP_CHECKLOCKTIMEVERIFY => {
                    if flags & VERIFY_CHECKLOCKTIMEVERIFY != 0 {
                        let top = stack.last().ok_or(ScriptError::InvalidStackOperation)?;
                        let num = num_from_bytes(top, 5)?;
                        if num < 0 {
                            return Err(ScriptError::NegativeLocktime);
                        }
                        checker.check_locktime(num)?;
                    }
                }
                OP_CHECKSEQUENCEVERIFY => {
                    if flags & VERIFY_CHECKSEQUENCEVERIFY != 0 {
                        let top = stack.last().ok_or(ScriptError::InvalidStackOperation)?;
                        let num = num_from_bytes(top, 5)?;
                        if num < 0 {
                            return Err(ScriptError::NegativeLocktime);
                        }
                        checker.check_sequence(num)?;
                    }
                }
                // Remaining NOPs are upgrade hooks.
                0xb0 | 0xb3..=0xb9 => {}
                _ => return Err(ScriptError::BadOpcode),
            }
        }

        if stack.len() + alt.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
    }

    if !exec.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }
    Ok(())
}

fn pop2(stack: &mut Vec<Vec<u8>>) -> Result<(Vec<u8>, Vec<u8>), ScriptError> {
    let b = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
    let a = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
    Ok((b, a))
}

fn pop_n(stack: &mut Vec<Vec<u8>>, n: usize) -> Result<Vec<Vec<u8>>, ScriptError> {
    if stack.len() < n {
        return Err(ScriptError::InvalidStackOperation);
    }
    Ok(stack.split_off(stack.len() - n))
}

fn bool_bytes(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

/// Verify that `script_sig` and `witness` satisfy the spending conditions
/// of `script_pubkey` for input `index` of `tx`.
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    witness: &[Vec<u8>],
    tx: &Transaction,
    index: usize,
    value: i64,
    flags: u32,
) -> Result<(), ScriptError> {
    let checker = Checker { tx, index, value };

    let mut stack: Vec<Vec<u8>> = Vec::new();
    eval(script_sig, &mut stack, flags, &checker, SigVersion::Base)?;
    let sig_stack = stack.clone();
    eval(script_pubkey, &mut stack, flags, &checker, SigVersion::Base)?;
    if !matches!(stack.last(), Some(top) if cast_to_bool(top)) {
        return Err(ScriptError::EvalFalse);
    }

    let mut had_witness = false;

    if flags & VERIFY_WITNESS != 0 {
        if let Some((version, program)) = witness_program(script_pubkey) {
            had_witness = true;
            if !script_sig.is_empty() {
                return Err(ScriptError::WitnessMalleated);
            }
            verify_witness_program(version, program, witness, &checker, flags)?;
        }
    }

    if flags & VERIFY_P2SH != 0 && is_p2sh(script_pubkey) {
        if !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }
        let mut stack = sig_stack;
        let Some(redeem) = stack.pop() else {
            return Err(ScriptError::EvalFalse);
        };
        eval(&redeem, &mut stack, flags, &checker, SigVersion::Base)?;
        if !matches!(stack.last(), Some(top) if cast_to_bool(top)) {
            return Err(ScriptError::EvalFalse);
        }
        if flags & VERIFY_WITNESS != 0 {
            if let Some((version, program)) = witness_program(&redeem) {
                had_witness = true;
                // The signature script must be exactly the redeem push.
                if script_sig != push_bytes(&redeem).as_slice() {
                    return Err(ScriptError::WitnessMalleatedP2sh);
                }
                verify_witness_program(version, program, witness, &checker, flags)?;
            }
        }
    }

    if !had_witness && !witness.is_empty() {
        return Err(ScriptError::WitnessUnexpected);
    }

    Ok(())
}

fn verify_witness_program(
    version: u8,
    program: &[u8],
    witness: &[Vec<u8>],
    checker: &Checker<'_>,
    flags: u32,
) -> Result<(), ScriptError> {
    if version != 0 {
        // Future witness versions are anyone-can-spend here.
        return Ok(());
    }
    match program.len() {
        32 => {
            let Some(witness_script) = witness.last() else {
                return Err(ScriptError::WitnessProgramEmpty);
            };
            if sha256(witness_script)[..] != *program {
                return Err(ScriptError::WitnessProgramMismatch);
            }
            let mut stack: Vec<Vec<u8>> = witness[..witness.len() - 1].to_vec();
            for item in &stack {
                if item.len() > MAX_PUSH_SIZE {
                    return Err(ScriptError::PushSize);
                }
            }
            eval(
                witness_script,
                &mut stack,
                flags,
                checker,
                SigVersion::WitnessV0,
            )?;
            if stack.len() != 1 || !cast_to_bool(&stack[0]) {
                return Err(ScriptError::EvalFalse);
            }
            Ok(())
        }
        20 => {
            if witness.len() != 2 {
                return Err(ScriptError::WitnessProgramMismatch);
            }
            // Implied P2PKH script over the key hash.
            let mut script_code = vec![OP_DUP, OP_HASH160, 0x14];
            script_code.extend_from_slice(program);
            script_code.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
            let mut stack = witness.to_vec();
            eval(
                &script_code,
                &mut stack,
                flags,
                checker,
                SigVersion::WitnessV0,
            )?;
            if stack.len() != 1 || !cast_to_bool(&stack[0]) {
                return Err(ScriptError::EvalFalse);
            }
            Ok(())
        }
        _ => Err(ScriptError::WitnessProgramMismatch),
    }
}

fn push_bytes(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 3);
    match data.len() {
        0..=0x4b => out.push(data.len() as u8),
        0x4c..=0xff => {
            out.push(0x4c);
            out.push(data.len() as u8);
        }
        _ => {
            out.push(0x4d);
            out.extend_from_slice(&(data.len() as u16).to_le_bytes());
        }
    }
    out.extend_from_slice(data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoind_primitives::transaction::{TxIn, TxOut};
    use bitcoind_primitives::OutPoint;
    use secp256k1::SecretKey;

    fn spend_tx() -> Transaction {
        Transaction {
            version: 2,
            vin: vec![TxIn::new(OutPoint::new([9u8; 32], 0), Vec::new(), 0xffff_fffe)],
            vout: vec![TxOut {
                value: 90_000,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn verify(script_sig: &[u8], script_pubkey: &[u8], tx: &Transaction) -> Result<(), ScriptError> {
        verify_script(script_sig, script_pubkey, &[], tx, 0, 100_000, VERIFY_P2SH)
    }

    #[test]
    fn anyone_can_spend() {
        let tx = spend_tx();
        verify(&[], &[0x51], &tx).expect("OP_TRUE spends");
        assert_eq!(verify(&[], &[0x00], &tx), Err(ScriptError::EvalFalse));
    }

    #[test]
    fn equalverify_gates_spend() {
        let tx = spend_tx();
        // <x> EQUALVERIFY TRUE with push of x in the signature script.
        let script_pubkey = [0x01, 0x2a, OP_EQUALVERIFY, 0x51];
        verify(&[0x01, 0x2a], &script_pubkey, &tx).expect("matching preimage");
        assert_eq!(
            verify(&[0x01, 0x2b], &script_pubkey, &tx),
            Err(ScriptError::VerifyFailed)
        );
    }

    #[test]
    fn p2sh_redeem_script_executes() {
        let tx = spend_tx();
        let redeem = vec![0x51];
        let hash = hash160(&redeem);
        let mut script_pubkey = vec![0xa9, 0x14];
        script_pubkey.extend_from_slice(&hash);
        script_pubkey.push(0x87);
        let script_sig = push_bytes(&redeem);
        verify(&script_sig, &script_pubkey, &tx).expect("p2sh spend");

        // Wrong redeem script fails the outer EQUAL.
        let bad_sig = push_bytes(&[0x52]);
        assert_eq!(
            verify(&bad_sig, &script_pubkey, &tx),
            Err(ScriptError::EvalFalse)
        );
    }

    #[test]
    fn p2pkh_signature_roundtrip() {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[0x42; 32]).expect("secret key");
        let pubkey = secret.public_key(&secp);
        let pubkey_bytes = pubkey.serialize();

        let mut script_pubkey = vec![OP_DUP, OP_HASH160, 0x14];
        script_pubkey.extend_from_slice(&hash160(&pubkey_bytes));
        script_pubkey.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);

        let mut tx = spend_tx();
        let digest = signature_hash(&tx, 0, &script_pubkey, 100_000, 0x01, SigVersion::Base);
        let message = Message::from_digest(digest);
        let signature = secp.sign_ecdsa(&message, &secret);
        let mut sig = signature.serialize_der().to_vec();
        sig.push(0x01);

        let mut script_sig = push_bytes(&sig);
        script_sig.extend_from_slice(&push_bytes(&pubkey_bytes));
        tx.vin[0].script_sig = script_sig.clone();

        verify(&script_sig, &script_pubkey, &tx).expect("valid signature");

        // Corrupting the digest (different output) invalidates it.
        let mut altered = tx.clone();
        altered.vout[0].value = 1;
        assert_eq!(
            verify(&script_sig, &script_pubkey, &altered),
            Err(ScriptError::EvalFalse)
        );
    }

    #[test]
    fn p2wsh_witness_spend() {
        let mut tx = spend_tx();
        let witness_script = vec![0x51];
        let mut script_pubkey = vec![0x00, 0x20];
        script_pubkey.extend_from_slice(&sha256(&witness_script));
        tx.vin[0].witness = vec![witness_script.clone()];

        verify_script(
            &[],
            &script_pubkey,
            &tx.vin[0].witness.clone(),
            &tx,
            0,
            100_000,
            VERIFY_P2SH | VERIFY_WITNESS,
        )
        .expect("witness spend");

        // Without the witness flag the program is anyone-can-spend but
        // carrying witness data is rejected.
        assert_eq!(
            verify_script(
                &[],
                &script_pubkey,
                &tx.vin[0].witness.clone(),
                &tx,
                0,
                100_000,
                VERIFY_P2SH,
            ),
            Err(ScriptError::WitnessUnexpected)
        );
    }

    #[test]
    fn conditionals_and_numerics() {
        let tx = spend_tx();
        // IF 2 ELSE 3 ENDIF 2 EQUAL, taking the true branch.
        let script_pubkey = [OP_IF, 0x52, OP_ELSE, 0x53, OP_ENDIF, 0x52, OP_EQUAL];
        verify(&[0x51], &script_pubkey, &tx).expect("true branch");
        assert_eq!(
            verify(&[0x00], &script_pubkey, &tx),
            Err(ScriptError::EvalFalse)
        );
    }
}
