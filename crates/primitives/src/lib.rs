//! Core block/transaction types and consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod merkle;
pub mod outpoint;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use hash::{sha256, sha256d};
pub use merkle::compute_merkle_root;
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
