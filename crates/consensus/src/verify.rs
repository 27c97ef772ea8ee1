//! Verification failure taxonomy.
//!
//! Every consensus failure carries a kind, a short machine-readable reason
//! and a ban score for the delivering peer. The orthogonal `malleated` flag
//! marks failures a peer could have produced by mutating an otherwise valid
//! block; those are never cached as permanently invalid.

use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// A consensus rule violation.
    Invalid,
    /// A rule superseded by a later soft fork (e.g. version too low).
    Obsolete,
    /// Divergence from a hard-coded checkpoint.
    Checkpoint,
    /// Already known. Peers frequently resend; not a bug.
    Duplicate,
    /// Failed to deserialize.
    Malformed,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Invalid => "invalid",
            ErrorKind::Obsolete => "obsolete",
            ErrorKind::Checkpoint => "checkpoint",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::Malformed => "malformed",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VerifyError {
    pub kind: ErrorKind,
    pub reason: &'static str,
    pub score: u32,
    pub malleated: bool,
}

impl VerifyError {
    pub fn new(kind: ErrorKind, reason: &'static str, score: u32) -> Self {
        Self {
            kind,
            reason,
            score,
            malleated: false,
        }
    }

    pub fn invalid(reason: &'static str, score: u32) -> Self {
        Self::new(ErrorKind::Invalid, reason, score)
    }

    pub fn obsolete(reason: &'static str) -> Self {
        Self::new(ErrorKind::Obsolete, reason, 0)
    }

    pub fn duplicate(reason: &'static str, score: u32) -> Self {
        Self::new(ErrorKind::Duplicate, reason, score)
    }

    pub fn malleated(mut self) -> Self {
        self.malleated = true;
        self
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} (score={})",
            self.kind.as_str(),
            self.reason,
            self.score
        )
    }
}

impl std::error::Error for VerifyError {}
