//! Consensus-wide constants shared across validation.

/// The maximum allowed size for a serialized block without witness data,
/// in bytes (network rule).
pub const MAX_BLOCK_SIZE: usize = 1_000_000;
/// The maximum allowed weight for a block (network rule, BIP141).
pub const MAX_BLOCK_WEIGHT: usize = 4_000_000;
/// The maximum allowed number of legacy signature check operations in a
/// block (network rule).
pub const MAX_BLOCK_SIGOPS: usize = 20_000;
/// The maximum allowed weighted signature operation cost in a block
/// (network rule, BIP141).
pub const MAX_BLOCK_SIGOPS_COST: u64 = 80_000;
/// Coinbase transaction outputs can only be spent after this number of
/// new blocks.
pub const COINBASE_MATURITY: i32 = 100;
/// Witness scale factor used by weight and sigop-cost accounting (BIP141).
pub const WITNESS_SCALE_FACTOR: usize = 4;
/// Lock times at or above this value are interpreted as unix timestamps
/// rather than block heights.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;
/// Blocks with timestamps more than this far ahead of adjusted time are
/// rejected (may become valid later).
pub const MAX_TIME_DRIFT: i64 = 2 * 60 * 60;
/// The number of ancestor timestamps contributing to the median time past.
pub const MEDIAN_TIME_SPAN: usize = 11;
/// Version bits reserved for general signaling (BIP9 top bits).
pub const VERSION_TOP_BITS: u32 = 0x2000_0000;
/// Mask for the version bits available to BIP9 deployments.
pub const VERSION_TOP_MASK: u32 = 0xe000_0000;

/// Sequence number marker disabling relative lock-time for an input (BIP68).
pub const SEQUENCE_DISABLE_FLAG: u32 = 1 << 31;
/// Sequence bit selecting time-based rather than height-based locks (BIP68).
pub const SEQUENCE_TYPE_FLAG: u32 = 1 << 22;
/// Mask extracting the lock value from a sequence number (BIP68).
pub const SEQUENCE_MASK: u32 = 0x0000_ffff;
/// Shift converting a time-based sequence lock value to seconds (BIP68).
pub const SEQUENCE_GRANULARITY: u32 = 9;

/// Validate transaction locks against the median time past rather than
/// the block timestamp.
pub const LOCK_MEDIAN_TIME_PAST: u32 = 1 << 1;
/// Enforce BIP68 relative lock-times.
pub const LOCK_VERIFY_SEQUENCE: u32 = 1 << 0;
