//! Proof-of-work verification and difficulty adjustment.

pub mod difficulty;
pub mod validation;

pub use difficulty::{
    block_proof, compact_to_target, compact_to_u256, get_next_work_required, hash_meets_target,
    target_to_compact, u256_to_compact, HeaderInfo,
};
pub use validation::{check_proof_of_work, PowError};
