use bitcoind_consensus::VerifyError;
use bitcoind_primitives::encoding::DecodeError;
use bitcoind_storage::StoreError;

#[derive(Debug)]
pub enum ChainError {
    Verify(VerifyError),
    Store(StoreError),
    Decode(DecodeError),
    /// The database contradicts itself; resync required.
    Corrupt(&'static str),
    MissingEntry,
    MissingBlock,
}

impl ChainError {
    /// The verification failure behind this error, if that is what it is.
    pub fn verify_error(&self) -> Option<&VerifyError> {
        match self {
            ChainError::Verify(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Verify(err) => write!(f, "{err}"),
            ChainError::Store(err) => write!(f, "{err}"),
            ChainError::Decode(err) => write!(f, "{err}"),
            ChainError::Corrupt(message) => write!(f, "{message}"),
            ChainError::MissingEntry => write!(f, "missing chain entry"),
            ChainError::MissingBlock => write!(f, "missing block data"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<VerifyError> for ChainError {
    fn from(err: VerifyError) -> Self {
        ChainError::Verify(err)
    }
}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::Store(err)
    }
}

impl From<DecodeError> for ChainError {
    fn from(err: DecodeError) -> Self {
        ChainError::Decode(err)
    }
}
