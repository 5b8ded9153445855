use powd_consensus::ConsensusParams;
use powd_primitives::block::BlockHeader;
use primitive_types::U256;

use crate::difficulty::{compact_to_u256, CompactError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowError {
    BitsMismatch { expected: u32, found: u32 },
    InvalidBits(&'static str),
    HashAboveTarget,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::BitsMismatch { expected, found } => {
                write!(f, "bits {found:#010x} do not match required {expected:#010x}")
            }
            PowError::InvalidBits(message) => write!(f, "{message}"),
            PowError::HashAboveTarget => write!(f, "pow hash does not meet target"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Checks that `header` carries the required bits and that its hash meets them.
pub fn validate_pow_header(
    header: &BlockHeader,
    expected_bits: u32,
    params: &ConsensusParams,
) -> Result<(), PowError> {
    if header.bits != expected_bits {
        return Err(PowError::BitsMismatch {
            expected: expected_bits,
            found: header.bits,
        });
    }
    check_proof_of_work(header, params)
}

/// Context-free half of the header check: the bits decode to a target within
/// the network limit and the hash meets it. Needs no chain state.
pub fn check_proof_of_work(header: &BlockHeader, params: &ConsensusParams) -> Result<(), PowError> {
    let target = compact_to_u256(header.bits)?;
    if target.is_zero() {
        return Err(PowError::InvalidBits("pow target is zero"));
    }
    if target > U256::from_little_endian(&params.pow_limit) {
        return Err(PowError::InvalidBits("pow target above limit"));
    }

    if U256::from_little_endian(&header.hash()) > target {
        return Err(PowError::HashAboveTarget);
    }
    Ok(())
}
