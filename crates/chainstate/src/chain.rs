//! Chain selection: the fork-resolution state machine, best-chain choice by
//! cumulative work, and the bounded buffer of blocks that do not extend the
//! active tip.

use std::collections::{HashMap, VecDeque};

use powd_consensus::Hash256;
use powd_primitives::block::Block;
use primitive_types::U256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Synced,
    ForkDetected,
    Reorganizing,
}

impl SyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::ForkDetected => "fork-detected",
            SyncState::Reorganizing => "reorganizing",
        }
    }
}

/// A tip competing for the best chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub hash: Hash256,
    pub height: u64,
    pub work: U256,
    /// Arrival sequence number; lower was seen earlier.
    pub first_seen: u64,
}

/// Greatest cumulative work wins; equal work goes to the earliest seen.
pub fn select_best_chain(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates.iter().min_by(|a, b| {
        b.work
            .cmp(&a.work)
            .then(a.first_seen.cmp(&b.first_seen))
            .then(a.hash.cmp(&b.hash))
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkDecision {
    Reorganize,
    Discard,
}

/// Tracks the fork-resolution state and first-seen order of tips.
#[derive(Debug)]
pub struct ChainSelector {
    state: SyncState,
    next_seq: u64,
    seen: HashMap<Hash256, u64>,
}

impl Default for ChainSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainSelector {
    pub fn new() -> Self {
        Self {
            state: SyncState::Synced,
            next_seq: 0,
            seen: HashMap::new(),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Sequence number of the first time `hash` was observed.
    pub fn observe(&mut self, hash: &Hash256) -> u64 {
        if let Some(seq) = self.seen.get(hash) {
            return *seq;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.seen.insert(*hash, seq);
        seq
    }

    pub fn first_seen(&self, hash: &Hash256) -> Option<u64> {
        self.seen.get(hash).copied()
    }

    pub fn fork_detected(&mut self) {
        self.state = SyncState::ForkDetected;
    }

    /// Compares a complete fork against the active tip. Only strictly more
    /// work moves the node into `Reorganizing`; otherwise the fork is
    /// discarded and the selector is back to `Synced`.
    pub fn evaluate(&mut self, active: &Candidate, fork: &Candidate) -> ForkDecision {
        if fork.work > active.work {
            self.state = SyncState::Reorganizing;
            ForkDecision::Reorganize
        } else {
            self.state = SyncState::Synced;
            ForkDecision::Discard
        }
    }

    /// Called after a reorganization succeeds or aborts.
    pub fn settle(&mut self) {
        self.state = SyncState::Synced;
    }

    /// Drops first-seen records not in `keep`.
    pub fn retain(&mut self, keep: impl Fn(&Hash256) -> bool) {
        self.seen.retain(|hash, _| keep(hash));
    }
}

/// Outcome of walking a buffered fork back toward stored history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ForkWalk {
    /// Buffered blocks oldest first; the first block's parent is stored.
    Connected { anchor: Hash256, blocks: Vec<Block> },
    /// The walk stopped at a block nobody has given us yet.
    Missing(Hash256),
    TooLong,
}

/// Bounded holding area for blocks that do not extend the active tip.
#[derive(Debug)]
pub struct ForkBuffer {
    capacity: usize,
    max_length: usize,
    blocks: HashMap<Hash256, Block>,
    order: VecDeque<Hash256>,
}

impl ForkBuffer {
    pub fn new(max_length: u32) -> Self {
        let max_length = max_length.max(1) as usize;
        Self {
            capacity: max_length * 2,
            max_length,
            blocks: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash256) -> Option<&Block> {
        self.blocks.get(hash)
    }

    /// Returns false if the block was already buffered. The oldest entry is
    /// evicted once the buffer is full.
    pub fn insert(&mut self, hash: Hash256, block: Block) -> bool {
        if self.blocks.contains_key(&hash) {
            return false;
        }
        while self.blocks.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.blocks.remove(&oldest);
                }
                None => break,
            }
        }
        self.blocks.insert(hash, block);
        self.order.push_back(hash);
        true
    }

    pub fn remove(&mut self, hash: &Hash256) -> Option<Block> {
        let block = self.blocks.remove(hash)?;
        self.order.retain(|entry| entry != hash);
        Some(block)
    }

    /// Buffered blocks whose parent is `parent`, in arrival order.
    pub fn children_of(&self, parent: &Hash256) -> Vec<Hash256> {
        self.order
            .iter()
            .filter(|hash| {
                self.blocks
                    .get(*hash)
                    .is_some_and(|block| block.header.prev_block == *parent)
            })
            .copied()
            .collect()
    }

    /// Walks from `tip` through buffered parents until `is_stored` accepts a
    /// parent hash.
    pub fn walk<E>(
        &self,
        tip: &Hash256,
        mut is_stored: impl FnMut(&Hash256) -> Result<bool, E>,
    ) -> Result<ForkWalk, E> {
        let mut segment = Vec::new();
        let mut cursor = *tip;
        loop {
            let Some(block) = self.blocks.get(&cursor) else {
                return Ok(ForkWalk::Missing(cursor));
            };
            segment.push(block.clone());
            if segment.len() > self.max_length {
                return Ok(ForkWalk::TooLong);
            }
            let parent = block.header.prev_block;
            if is_stored(&parent)? {
                segment.reverse();
                return Ok(ForkWalk::Connected {
                    anchor: parent,
                    blocks: segment,
                });
            }
            cursor = parent;
        }
    }

    /// Drops buffered blocks at or below `height`.
    pub fn prune_below(&mut self, height: u64) {
        let blocks = &mut self.blocks;
        self.order.retain(|hash| match blocks.get(hash) {
            Some(block) if block.header.height <= height => {
                blocks.remove(hash);
                false
            }
            Some(_) => true,
            None => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use powd_primitives::block::BlockHeader;

    fn candidate(tag: u8, work: u64, first_seen: u64) -> Candidate {
        Candidate {
            hash: [tag; 32],
            height: 1,
            work: U256::from(work),
            first_seen,
        }
    }

    fn block(parent: Hash256, height: u64, nonce: u64) -> (Hash256, Block) {
        let block = Block {
            header: BlockHeader {
                version: 1,
                prev_block: parent,
                merkle_root: [0; 32],
                time: 0,
                bits: 0x207f_ffff,
                nonce,
                height,
            },
            transactions: Vec::new(),
        };
        (block.hash(), block)
    }

    #[test]
    fn heavier_chain_wins_regardless_of_order() {
        let light = candidate(1, 10, 0);
        let heavy = candidate(2, 11, 1);
        for set in [vec![light.clone(), heavy.clone()], vec![heavy.clone(), light.clone()]] {
            assert_eq!(select_best_chain(&set), Some(&heavy));
        }
    }

    #[test]
    fn equal_work_prefers_first_seen_and_is_stable() {
        let early = candidate(9, 10, 3);
        let late = candidate(1, 10, 4);
        let set = vec![late.clone(), early.clone()];
        for _ in 0..5 {
            assert_eq!(select_best_chain(&set), Some(&early));
        }
        assert_eq!(select_best_chain(&[]), None);
    }

    #[test]
    fn selector_transitions() {
        let mut selector = ChainSelector::new();
        assert_eq!(selector.state(), SyncState::Synced);
        assert_eq!(selector.observe(&[1; 32]), 0);
        assert_eq!(selector.observe(&[2; 32]), 1);
        assert_eq!(selector.observe(&[1; 32]), 0);

        let active = candidate(1, 10, 0);
        selector.fork_detected();
        assert_eq!(selector.state(), SyncState::ForkDetected);
        assert_eq!(selector.evaluate(&active, &candidate(2, 10, 1)), ForkDecision::Discard);
        assert_eq!(selector.state(), SyncState::Synced);

        selector.fork_detected();
        assert_eq!(selector.evaluate(&active, &candidate(2, 12, 1)), ForkDecision::Reorganize);
        assert_eq!(selector.state(), SyncState::Reorganizing);
        selector.settle();
        assert_eq!(selector.state(), SyncState::Synced);
    }

    #[test]
    fn walk_connects_missing_and_too_long() {
        let stored = [7u8; 32];
        let mut buffer = ForkBuffer::new(3);
        let (a, block_a) = block(stored, 1, 1);
        let (b, block_b) = block(a, 2, 2);
        buffer.insert(a, block_a);
        buffer.insert(b, block_b);

        let walk = buffer.walk::<()>(&b, |hash| Ok(*hash == stored)).unwrap();
        match walk {
            ForkWalk::Connected { anchor, blocks } => {
                assert_eq!(anchor, stored);
                assert_eq!(blocks.iter().map(Block::hash).collect::<Vec<_>>(), vec![a, b]);
            }
            other => panic!("unexpected walk {other:?}"),
        }

        let (orphan, orphan_block) = block([8u8; 32], 5, 3);
        buffer.insert(orphan, orphan_block);
        assert_eq!(
            buffer.walk::<()>(&orphan, |hash| Ok(*hash == stored)).unwrap(),
            ForkWalk::Missing([8u8; 32])
        );

        let mut long = ForkBuffer::new(2);
        let mut parent = stored;
        let mut last = parent;
        for height in 1..=3 {
            let (hash, block) = block(parent, height, height);
            long.insert(hash, block);
            parent = hash;
            last = hash;
        }
        assert_eq!(
            long.walk::<()>(&last, |hash| Ok(*hash == stored)).unwrap(),
            ForkWalk::TooLong
        );
    }

    #[test]
    fn buffer_is_bounded_and_prunes() {
        let mut buffer = ForkBuffer::new(1);
        let (a, block_a) = block([0; 32], 1, 1);
        let (b, block_b) = block([0; 32], 2, 2);
        let (c, block_c) = block([0; 32], 3, 3);
        assert!(buffer.insert(a, block_a.clone()));
        assert!(!buffer.insert(a, block_a));
        buffer.insert(b, block_b);
        buffer.insert(c, block_c);
        assert_eq!(buffer.len(), 2);
        assert!(!buffer.contains(&a));
        assert_eq!(buffer.children_of(&[0; 32]), vec![b, c]);
        buffer.prune_below(2);
        assert!(!buffer.contains(&b));
        assert!(buffer.contains(&c));
    }
}
