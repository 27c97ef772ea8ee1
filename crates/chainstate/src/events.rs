//! Chain event stream.
//!
//! Consumers subscribe through [`crate::chain::Chain::subscribe`].
//! Committed tip transitions are totally ordered: a reorganization is
//! observed as `Disconnect` events newest-to-oldest, `Connect` events
//! oldest-to-newest, then the final `Connect` for the block that
//! triggered it.

use std::sync::Arc;

use bitcoind_consensus::Hash256;
use bitcoind_primitives::Block;

use crate::entry::ChainEntry;

#[derive(Clone, Debug)]
pub enum ChainEvent {
    /// The best tip changed.
    Tip(Arc<ChainEntry>),
    /// A block was accepted (main chain or side chain).
    Block {
        block: Arc<Block>,
        entry: Arc<ChainEntry>,
    },
    /// A block was connected to the main chain.
    Connect {
        entry: Arc<ChainEntry>,
        block: Arc<Block>,
    },
    /// A block was rolled back off the main chain.
    Disconnect {
        entry: Arc<ChainEntry>,
        block: Arc<Block>,
    },
    /// A previously-known side-chain block was re-validated and joined
    /// the main chain during a reorganization.
    Reconnect {
        entry: Arc<ChainEntry>,
        block: Arc<Block>,
    },
    /// A heavier competing chain displaced the tip.
    Reorganize {
        old_tip: Arc<ChainEntry>,
        new_tip: Arc<ChainEntry>,
    },
    /// A valid block was stored on a side chain without connecting.
    Competitor {
        entry: Arc<ChainEntry>,
        block: Arc<Block>,
    },
    /// An orphan's parent arrived and the orphan was processed.
    Resolved { block: Arc<Block> },
    /// A block with an unknown parent was stored as an orphan.
    Orphan { block: Arc<Block> },
    /// A block already present in the database was resubmitted.
    Exists(Hash256),
    /// A block failed verification.
    Invalid {
        hash: Hash256,
        reason: &'static str,
    },
    /// A block contradicted a hard-coded checkpoint.
    Fork {
        height: i32,
        hash: Hash256,
        expected: Hash256,
    },
    /// A block landed exactly on a checkpoint.
    Checkpoint { height: i32, hash: Hash256 },
    /// Orphans were evicted under memory pressure.
    Purge { count: usize },
    /// The node considers itself synced with the network.
    Full,
    /// An orphan resolution failed after its parent connected.
    Error(String),
    /// The chain was rewound to an earlier entry.
    Reset(Arc<ChainEntry>),
}

impl ChainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ChainEvent::Tip(_) => "tip",
            ChainEvent::Block { .. } => "block",
            ChainEvent::Connect { .. } => "connect",
            ChainEvent::Disconnect { .. } => "disconnect",
            ChainEvent::Reconnect { .. } => "reconnect",
            ChainEvent::Reorganize { .. } => "reorganize",
            ChainEvent::Competitor { .. } => "competitor",
            ChainEvent::Resolved { .. } => "resolved",
            ChainEvent::Orphan { .. } => "orphan",
            ChainEvent::Exists(_) => "exists",
            ChainEvent::Invalid { .. } => "invalid",
            ChainEvent::Fork { .. } => "fork",
            ChainEvent::Checkpoint { .. } => "checkpoint",
            ChainEvent::Purge { .. } => "purge",
            ChainEvent::Full => "full",
            ChainEvent::Error(_) => "error",
            ChainEvent::Reset(_) => "reset",
        }
    }
}
