//! Compact target encoding, chain work, and interval retargeting.

use std::cmp::Ordering;

use powd_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

/// Largest ratio between two consecutive targets.
pub const MAX_RETARGET_FACTOR: i64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    NonContiguous,
    InsufficientHistory { needed: usize, have: usize },
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::NonContiguous => write!(f, "header list must be contiguous by height"),
            DifficultyError::InsufficientHistory { needed, have } => {
                write!(f, "retarget needs {needed} headers, have {have}")
            }
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

/// The fields of a header that retargeting looks at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderInfo {
    pub height: u64,
    pub time: i64,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    if bits & 0x0080_0000 != 0 {
        return Err(CompactError::Negative);
    }
    let size = bits >> 24;
    let mantissa = bits & 0x007f_ffff;
    if size <= 3 {
        return Ok(U256::from(mantissa >> (8 * (3 - size))));
    }
    let too_wide = size > 34 || (mantissa > 0xff && size > 33) || (mantissa > 0xffff && size > 32);
    if mantissa != 0 && too_wide {
        return Err(CompactError::Overflow);
    }
    Ok(U256::from(mantissa) << (8 * (size - 3)))
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }
    let mut size = value.bits().div_ceil(8) as u32;
    let mut mantissa = if size <= 3 {
        value.low_u32() << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3))).low_u32()
    };
    // Keep the sign bit clear by moving one byte into the exponent.
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        size += 1;
    }
    (size << 24) | (mantissa & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    Ok(compact_to_u256(bits)?.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    u256_to_compact(U256::from_little_endian(target))
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    U256::from_little_endian(hash) <= U256::from_little_endian(target)
}

/// Expected number of hashes to find a block at `bits`: 2^256 / (target + 1).
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::one();
    Ok((!target / (target + one)) + one)
}

pub fn cmp_be(a: &Hash256, b: &Hash256) -> Ordering {
    U256::from_little_endian(a).cmp(&U256::from_little_endian(b))
}

pub fn u256_to_f64(value: U256) -> f64 {
    value
        .0
        .iter()
        .rev()
        .fold(0.0f64, |acc, limb| acc * 18_446_744_073_709_551_616.0 + *limb as f64)
}

/// `pow_limit / target`: 1.0 at the easiest target, doubling as the target halves.
pub fn difficulty_from_bits(bits: u32, params: &ConsensusParams) -> Result<f64, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(f64::INFINITY);
    }
    let limit = U256::from_little_endian(&params.pow_limit);
    Ok(u256_to_f64(limit) / u256_to_f64(target))
}

/// Scales the target of `bits` by `actual / expected`, with the timespan
/// clamped to a factor of four either way and the result kept inside
/// `[pow_floor, pow_limit]`.
pub fn retarget(
    bits: u32,
    actual_timespan: i64,
    expected_timespan: i64,
    params: &ConsensusParams,
) -> Result<u32, CompactError> {
    let expected = expected_timespan.max(1);
    let actual = actual_timespan.clamp(
        (expected / MAX_RETARGET_FACTOR).max(1),
        expected.saturating_mul(MAX_RETARGET_FACTOR),
    );
    let current = compact_to_u256(bits)?;
    let mut next = mul_div_u256(current, actual as u64, expected as u64);

    let limit = U256::from_little_endian(&params.pow_limit);
    let floor = U256::from_little_endian(&params.pow_floor);
    if next > limit {
        next = limit;
    }
    if next < floor {
        next = floor;
    }
    Ok(u256_to_compact(next))
}

/// Bits required for the block after the last entry of `chain`.
///
/// `chain` must be contiguous and hold at least the last `difficulty_window + 1`
/// headers, or start at genesis. Heights before genesis contribute a synthetic
/// interval equal to the target spacing.
pub fn next_work_required(
    chain: &[HeaderInfo],
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let Some(tip) = chain.last() else {
        return Ok(params.genesis_bits);
    };
    ensure_contiguous(chain)?;

    let next_height = tip.height + 1;
    if !params.is_retarget_height(next_height) {
        return Ok(tip.bits);
    }

    let window = params.difficulty_window.max(1) as u64;
    let first = tip.height.saturating_sub(window - 1);
    let base = chain[0].height;
    let needs_predecessor = first > 0;
    if base > first || (needs_predecessor && base == first) {
        return Err(DifficultyError::InsufficientHistory {
            needed: window as usize + 1,
            have: chain.len(),
        });
    }

    let mut actual = 0i64;
    let synthetic = window - (tip.height - first + 1);
    actual += synthetic as i64 * params.target_spacing_secs;
    for height in first..=tip.height {
        let idx = (height - base) as usize;
        actual += if height == 0 {
            params.target_spacing_secs
        } else {
            chain[idx].time - chain[idx - 1].time
        };
    }

    Ok(retarget(
        tip.bits,
        actual,
        params.expected_window_timespan(),
        params,
    )?)
}

fn ensure_contiguous(chain: &[HeaderInfo]) -> Result<(), DifficultyError> {
    let base = chain[0].height;
    let contiguous = chain
        .iter()
        .enumerate()
        .all(|(idx, header)| header.height == base + idx as u64);
    if contiguous {
        Ok(())
    } else {
        Err(DifficultyError::NonContiguous)
    }
}

fn mul_div_u256(value: U256, mul: u64, div: u64) -> U256 {
    if div == 0 {
        return U256::max_value();
    }
    let div_u = U256::from(div);
    let quotient = value / div_u;
    let remainder = value - quotient * div_u;
    let (scaled, overflow) = quotient.overflowing_mul(U256::from(mul));
    if overflow {
        return U256::max_value();
    }
    scaled.saturating_add(remainder * U256::from(mul) / div_u)
}
