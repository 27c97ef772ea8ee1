//! Soft-fork deployment state.

use bitcoind_consensus::constants::{LOCK_MEDIAN_TIME_PAST, LOCK_VERIFY_SEQUENCE};
use bitcoind_script::{
    VERIFY_CHECKSEQUENCEVERIFY, VERIFY_P2SH, VERIFY_WITNESS,
};

/// BIP9 threshold state of one deployment bit at one period boundary.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThresholdState {
    Defined,
    Started,
    LockedIn,
    Active,
    Failed,
}

impl ThresholdState {
    pub fn as_u8(self) -> u8 {
        match self {
            ThresholdState::Defined => 0,
            ThresholdState::Started => 1,
            ThresholdState::LockedIn => 2,
            ThresholdState::Active => 3,
            ThresholdState::Failed => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => ThresholdState::Defined,
            1 => ThresholdState::Started,
            2 => ThresholdState::LockedIn,
            3 => ThresholdState::Active,
            4 => ThresholdState::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ThresholdState::Active | ThresholdState::Failed)
    }
}

/// Consensus rules in force at one height: script-verify flags,
/// lock-verify flags and the BIP34 coinbase-height rule.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DeploymentState {
    pub script_flags: u32,
    pub lock_flags: u32,
    pub bip34: bool,
}

impl DeploymentState {
    pub fn has_p2sh(&self) -> bool {
        self.script_flags & VERIFY_P2SH != 0
    }

    pub fn has_csv(&self) -> bool {
        self.script_flags & VERIFY_CHECKSEQUENCEVERIFY != 0
    }

    pub fn has_witness(&self) -> bool {
        self.script_flags & VERIFY_WITNESS != 0
    }

    pub fn has_mtp(&self) -> bool {
        self.lock_flags & LOCK_MEDIAN_TIME_PAST != 0
    }

    pub fn has_sequence_locks(&self) -> bool {
        self.lock_flags & LOCK_VERIFY_SEQUENCE != 0
    }
}
