//! Block reward schedule and fee floor.

use crate::money::Amount;
use crate::params::ConsensusParams;

/// Reward paid by the coinbase at `height`.
///
/// Halves every `reward_halving_interval` blocks using integer floor
/// division, and stays at zero once the halved value drops below one unit.
pub fn block_reward(height: u64, params: &ConsensusParams) -> Amount {
    let interval = u64::from(params.reward_halving_interval.max(1));
    let halvings = height / interval;
    if halvings >= 63 {
        return 0;
    }
    params.initial_reward.max(0) >> halvings
}

/// Smallest fee accepted for a transaction of `size` serialized bytes.
pub fn min_fee(size: usize, params: &ConsensusParams) -> Amount {
    let size = Amount::try_from(size).unwrap_or(Amount::MAX);
    size.saturating_mul(params.fee_per_byte).max(1)
}
