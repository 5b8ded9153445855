//! Consensus-wide constants shared across validation and networking.

/// The minimum allowed block header version (network rule).
pub const MIN_BLOCK_VERSION: u32 = 1;
/// Transactions with version 0 are malformed.
pub const MIN_TX_VERSION: u32 = 1;
/// The maximum allowed size for a serialized block, in bytes.
pub const MAX_BLOCK_SIZE: u32 = 1_000_000;
/// The maximum number of transactions (coinbase included) in one block.
pub const MAX_TX_PER_BLOCK: u32 = 4_096;
/// The maximum size of a single serialized transaction, in bytes.
pub const MAX_TX_SIZE: u32 = 100_000;
/// Accepted clock skew around local time for block timestamps.
pub const MAX_FUTURE_SKEW_SECS: i64 = 2 * 60 * 60;
/// Deepest fork segment the chain selector will buffer or reorganize.
pub const MAX_FORK_LENGTH: u32 = 100;
/// Coinbase outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: u32 = 100;
/// Maximum length of a coin-type tag on an output.
pub const MAX_COIN_TAG_LEN: usize = 8;
/// Coin tag used by the reward transaction when none is configured.
pub const DEFAULT_COIN: &str = "POW";

/// Current network protocol version exchanged in the handshake.
pub const PROTOCOL_VERSION: u32 = 70_001;
/// Oldest protocol version a peer may announce and still be served.
pub const MIN_PEER_PROTO_VERSION: u32 = 70_000;
/// Blocks requested per sync round trip.
pub const SYNC_BATCH_SIZE: u32 = 100;
