//! Nonce search over a strided slice of the nonce space.

use powd_consensus::Hash256;
use powd_primitives::block::{BlockHeader, HEADER_SIZE};
use powd_primitives::encoding::encode;
use powd_primitives::hash::sha256d;
use primitive_types::U256;

const NONCE_OFFSET: usize = HEADER_SIZE - 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchOutcome {
    Found { nonce: u64, hash: Hash256 },
    /// `max_attempts` hashes without a hit.
    Exhausted { next_nonce: u64 },
    Stopped { attempts: u64 },
}

#[derive(Clone, Copy, Debug)]
pub struct NonceRange {
    pub start: u64,
    pub stride: u64,
    pub max_attempts: u64,
    /// Hashes between calls to the stop check.
    pub poll_every: u64,
}

/// Tries `start, start + stride, start + 2 * stride, ...` until the header hash
/// is at or below `target`, the attempt budget runs out, or `should_stop` fires.
pub fn search_nonces(
    header: &BlockHeader,
    target: &Hash256,
    range: NonceRange,
    mut should_stop: impl FnMut() -> bool,
) -> SearchOutcome {
    let target = U256::from_little_endian(target);
    let mut bytes = encode(header);
    let stride = range.stride.max(1);
    let poll_every = range.poll_every.max(1);
    let mut nonce = range.start;

    for attempt in 0..range.max_attempts {
        if attempt % poll_every == 0 && should_stop() {
            return SearchOutcome::Stopped { attempts: attempt };
        }
        bytes[NONCE_OFFSET..NONCE_OFFSET + 8].copy_from_slice(&nonce.to_le_bytes());
        let hash = sha256d(&bytes);
        if U256::from_little_endian(&hash) <= target {
            return SearchOutcome::Found { nonce, hash };
        }
        nonce = nonce.wrapping_add(stride);
    }
    SearchOutcome::Exhausted { next_nonce: nonce }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::difficulty::compact_to_target;

    fn header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: [1u8; 32],
            time: 1_700_000_000,
            bits: 0x207f_ffff,
            nonce: 0,
            height: 1,
        }
    }

    #[test]
    fn found_nonce_reproduces_hash() {
        let header = header();
        let target = compact_to_target(header.bits).expect("target");
        let range = NonceRange {
            start: 3,
            stride: 4,
            max_attempts: 10_000,
            poll_every: 1_000,
        };
        match search_nonces(&header, &target, range, || false) {
            SearchOutcome::Found { nonce, hash } => {
                assert_eq!(nonce % 4, 3);
                let mut solved = header.clone();
                solved.nonce = nonce;
                assert_eq!(solved.hash(), hash);
            }
            other => panic!("expected a solution, got {other:?}"),
        }
    }

    #[test]
    fn stop_is_polled_before_hashing() {
        let range = NonceRange {
            start: 0,
            stride: 1,
            max_attempts: 1_000,
            poll_every: 10,
        };
        let outcome = search_nonces(&header(), &[0u8; 32], range, || true);
        assert_eq!(outcome, SearchOutcome::Stopped { attempts: 0 });
    }

    #[test]
    fn impossible_target_exhausts() {
        let range = NonceRange {
            start: 0,
            stride: 2,
            max_attempts: 50,
            poll_every: 10,
        };
        let outcome = search_nonces(&header(), &[0u8; 32], range, || false);
        assert_eq!(outcome, SearchOutcome::Exhausted { next_nonce: 100 });
    }
}
