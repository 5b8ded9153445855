//! Stateful difficulty adjuster over a ring of recent block intervals.

use std::collections::VecDeque;

use powd_consensus::ConsensusParams;

use crate::difficulty::{difficulty_from_bits, retarget, CompactError, HeaderInfo};

#[derive(Clone, Debug)]
pub struct DifficultyAdjuster {
    params: ConsensusParams,
    intervals: VecDeque<i64>,
    last_time: Option<i64>,
    tip_height: Option<u64>,
    next_bits: u32,
}

impl DifficultyAdjuster {
    /// Adjuster for an empty chain; the first block uses the genesis bits.
    pub fn new(params: &ConsensusParams) -> Self {
        Self {
            params: params.clone(),
            intervals: VecDeque::with_capacity(params.difficulty_window.max(1)),
            last_time: None,
            tip_height: None,
            next_bits: params.genesis_bits,
        }
    }

    /// Replays `headers`, which must run up to the current tip and either start
    /// at genesis or cover the last `difficulty_window + 1` blocks.
    pub fn rebuild(params: &ConsensusParams, headers: &[HeaderInfo]) -> Result<Self, CompactError> {
        let mut adjuster = Self::new(params);
        let window = params.difficulty_window.max(1);
        if let Some(first) = headers.first() {
            if first.height > 0 && headers.len() > window {
                let skip = headers.len() - window - 1;
                let seed = &headers[skip];
                adjuster.last_time = Some(seed.time);
                adjuster.tip_height = Some(seed.height);
                adjuster.next_bits = seed.bits;
                for header in &headers[skip + 1..] {
                    adjuster.adjust(header)?;
                }
                return Ok(adjuster);
            }
        }
        for header in headers {
            adjuster.adjust(header)?;
        }
        Ok(adjuster)
    }

    /// Records a connected block and returns the bits required for its successor.
    pub fn adjust(&mut self, header: &HeaderInfo) -> Result<u32, CompactError> {
        let interval = match self.last_time {
            Some(previous) => header.time - previous,
            None => self.params.target_spacing_secs,
        };
        self.intervals.push_back(interval);
        while self.intervals.len() > self.params.difficulty_window.max(1) {
            self.intervals.pop_front();
        }
        self.last_time = Some(header.time);
        self.tip_height = Some(header.height);

        self.next_bits = if self.params.is_retarget_height(header.height + 1) {
            retarget(
                header.bits,
                self.observed_timespan(),
                self.params.expected_window_timespan(),
                &self.params,
            )?
        } else {
            header.bits
        };
        Ok(self.next_bits)
    }

    /// Sum of the window, with missing slots filled at the target spacing.
    fn observed_timespan(&self) -> i64 {
        let missing = self
            .params
            .difficulty_window
            .max(1)
            .saturating_sub(self.intervals.len());
        self.intervals.iter().sum::<i64>() + missing as i64 * self.params.target_spacing_secs
    }

    pub fn next_bits(&self) -> u32 {
        self.next_bits
    }

    pub fn tip_height(&self) -> Option<u64> {
        self.tip_height
    }

    pub fn intervals(&self) -> impl Iterator<Item = &i64> {
        self.intervals.iter()
    }

    /// Difficulty of the next block relative to the easiest target.
    pub fn get_difficulty(&self) -> f64 {
        difficulty_from_bits(self.next_bits, &self.params).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::difficulty::next_work_required;
    use powd_consensus::params::{consensus_params, Network};

    fn chain(count: u64, spacing: i64, bits: u32) -> Vec<HeaderInfo> {
        (0..count)
            .map(|height| HeaderInfo {
                height,
                time: 5_000 + height as i64 * spacing,
                bits,
            })
            .collect()
    }

    #[test]
    fn first_interval_is_synthetic() {
        let params = consensus_params(Network::Regtest);
        let mut adjuster = DifficultyAdjuster::new(&params);
        adjuster
            .adjust(&HeaderInfo {
                height: 0,
                time: 0,
                bits: params.genesis_bits,
            })
            .expect("adjust");
        assert_eq!(
            adjuster.intervals().copied().collect::<Vec<_>>(),
            vec![params.target_spacing_secs]
        );
    }

    #[test]
    fn ring_is_bounded_by_window() {
        let params = consensus_params(Network::Regtest);
        let headers = chain(35, 3, params.genesis_bits);
        let adjuster = DifficultyAdjuster::rebuild(&params, &headers).expect("rebuild");
        assert_eq!(adjuster.intervals().count(), params.difficulty_window);
        assert_eq!(adjuster.tip_height(), Some(34));
    }

    #[test]
    fn agrees_with_pure_next_work() {
        let params = consensus_params(Network::Regtest);
        let mut headers = Vec::new();
        let mut adjuster = DifficultyAdjuster::new(&params);
        let mut time = 10_000i64;
        for height in 0..40u64 {
            let bits = next_work_required(&headers, &params).expect("pure");
            assert_eq!(bits, adjuster.next_bits(), "height {height}");
            time += 1 + (height as i64 % 7);
            let header = HeaderInfo { height, time, bits };
            adjuster.adjust(&header).expect("adjust");
            headers.push(header);
        }
    }

    #[test]
    fn rebuild_from_tail_matches_full_replay() {
        let params = consensus_params(Network::Regtest);
        let headers = chain(29, 4, params.genesis_bits);
        let full = DifficultyAdjuster::rebuild(&params, &headers).expect("full");
        let tail = DifficultyAdjuster::rebuild(&params, &headers[15..]).expect("tail");
        assert_eq!(full.next_bits(), tail.next_bits());
        assert_eq!(
            full.intervals().collect::<Vec<_>>(),
            tail.intervals().collect::<Vec<_>>()
        );
    }
}
