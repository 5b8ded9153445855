//! Proof-of-work targets, retargeting, and nonce search.

pub mod adjuster;
pub mod difficulty;
pub mod search;
pub mod validation;

pub use adjuster::DifficultyAdjuster;
pub use difficulty::{
    block_proof, compact_to_target, compact_to_u256, difficulty_from_bits, hash_meets_target,
    next_work_required, retarget, target_to_compact, u256_to_compact, CompactError,
    DifficultyError, HeaderInfo,
};
pub use search::{search_nonces, NonceRange, SearchOutcome};
pub use validation::{check_proof_of_work, validate_pow_header, PowError};
