//! Block acceptance: extend the tip, buffer side chains, resolve forks by
//! cumulative work, and keep the mempool, difficulty tracker and miner in
//! step with every tip change.

use std::collections::HashSet;

use parking_lot::{RwLockUpgradableReadGuard, RwLockWriteGuard};
use powd_chainstate::{
    Arrival, Candidate, ChainState, ChainStateError, ForkDecision, ForkWalk, StagedUpdate,
};
use powd_consensus::{hash256_to_hex, Amount, Hash256};
use powd_pow::{DifficultyAdjuster, HeaderInfo};
use powd_primitives::block::Block;

use crate::error::NodeError;
use crate::mempool::MempoolEntry;
use crate::node::{BlockOutcome, BlockSource, Node, NodeEvent, SharedStore};
use crate::wire::short_hash;

type ChainGuard<'a> = RwLockUpgradableReadGuard<'a, ChainState<SharedStore>>;

impl Node {
    /// Runs `block` through validation and fork choice. `claimed` is the
    /// hash the sender announced; a mismatch rejects the block outright.
    pub fn process_block(
        &self,
        block: Block,
        claimed: Hash256,
        source: BlockSource,
    ) -> Result<BlockOutcome, NodeError> {
        self.ensure_running()?;
        let hash = block.hash();
        if hash != claimed {
            return Err(NodeError::Validation(format!(
                "claimed hash {} does not match header hash {}",
                hash256_to_hex(&claimed),
                hash256_to_hex(&hash)
            )));
        }
        let outcome = match self.accept_block(hash, block, source) {
            Ok(outcome) => outcome,
            Err(err) => {
                if err.is_fatal() && !self.is_halted() {
                    self.halt(err.to_string());
                }
                return Err(err);
            }
        };
        if outcome.moved_tip() {
            self.connect_buffered_children();
        }
        Ok(outcome)
    }

    fn accept_block(
        &self,
        hash: Hash256,
        block: Block,
        source: BlockSource,
    ) -> Result<BlockOutcome, NodeError> {
        let arrival = Arrival {
            live: source.is_live(),
            now: self.clock.now(),
        };
        let chain = self.chain.upgradable_read();
        if chain.contains_block(&hash)? || self.forks.lock().contains(&hash) {
            return Ok(BlockOutcome::AlreadyKnown);
        }

        if block.header.prev_block == chain.tip().hash {
            self.selector.lock().observe(&hash);
            let staged = match chain.stage_connect(&block, arrival) {
                Ok(staged) => staged,
                Err(err) => {
                    log_warn!("Rejected block {} from {source}: {err}", hash256_to_hex(&hash));
                    return Err(err.into());
                }
            };
            let tip = self.commit_staged(chain, staged, source)?;
            return Ok(BlockOutcome::Connected {
                hash: tip.0,
                height: tip.1,
            });
        }

        if let Err(err) = chain.check_header(&block) {
            log_warn!("Rejected block {} from {source}: {err}", hash256_to_hex(&hash));
            return Err(err.into());
        }
        let walk = {
            let mut forks = self.forks.lock();
            let mut selector = self.selector.lock();
            forks.insert(hash, block);
            selector.observe(&hash);
            selector.fork_detected();
            let leaf = deepest_descendant(&forks, hash);
            forks.walk(&leaf, |parent| chain.contains_block(parent))?
        };

        let fork = match walk {
            ForkWalk::Missing(missing) => {
                log_debug!(
                    "Buffered block {} waiting on {}",
                    short_hash(&hash),
                    short_hash(&missing)
                );
                return Ok(BlockOutcome::Orphan { missing });
            }
            ForkWalk::TooLong => {
                self.forks.lock().remove(&hash);
                self.selector.lock().settle();
                log_warn!("Dropped block {}: fork exceeds maximum length", short_hash(&hash));
                return Err(ChainStateError::ForkTooLong.into());
            }
            ForkWalk::Connected { blocks, .. } => blocks,
        };

        let work = chain.fork_work(&fork)?;
        let Some(leaf) = fork.last() else {
            return Ok(BlockOutcome::Discarded);
        };
        let leaf_hash = leaf.hash();
        let leaf_height = leaf.header.height;
        let decision = {
            let mut selector = self.selector.lock();
            let tip = chain.tip();
            let active = Candidate {
                hash: tip.hash,
                height: tip.height,
                work: tip.chainwork,
                first_seen: selector.observe(&tip.hash),
            };
            let candidate = Candidate {
                hash: leaf_hash,
                height: leaf_height,
                work,
                first_seen: selector.observe(&leaf_hash),
            };
            selector.evaluate(&active, &candidate)
        };
        if decision == ForkDecision::Discard {
            log_info!(
                "Fork at {} (height {}) has no more work than tip {}; keeping current chain",
                short_hash(&leaf_hash),
                leaf_height,
                short_hash(&chain.tip().hash)
            );
            return Ok(BlockOutcome::Discarded);
        }

        log_info!(
            "Fork at {} (height {}) outweighs tip {} (height {}); reorganizing",
            short_hash(&leaf_hash),
            leaf_height,
            short_hash(&chain.tip().hash),
            chain.tip().height
        );
        let staged = match chain.stage_reorganize(&fork, arrival) {
            Ok(staged) => staged,
            Err(err) => {
                if let ChainStateError::InvalidBlock { hash: bad, .. } = &err {
                    self.drop_fork_from(bad);
                }
                self.selector.lock().settle();
                log_warn!("Reorganization to {} aborted: {err}", short_hash(&leaf_hash));
                return Err(err.into());
            }
        };
        let disconnected = staged.disconnected.len();
        let connected = staged.connected.len();
        let (hash, height) = self.commit_staged(chain, staged, source)?;
        Ok(BlockOutcome::Reorganized {
            hash,
            height,
            disconnected,
            connected,
        })
    }

    /// Writes `staged` under the write lock, then finishes bookkeeping with
    /// the lock downgraded so readers are not held up.
    fn commit_staged(
        &self,
        chain: ChainGuard<'_>,
        staged: StagedUpdate,
        source: BlockSource,
    ) -> Result<(Hash256, u64), NodeError> {
        let mut chain = RwLockUpgradableReadGuard::upgrade(chain);
        if let Err(err) = chain.commit(&staged).map(|_| ()) {
            if !matches!(err, ChainStateError::StaleStage) {
                self.halt(format!("commit failed: {err}"));
            }
            self.selector.lock().settle();
            return Err(err.into());
        }
        let chain = RwLockWriteGuard::downgrade(chain);
        self.after_commit(&chain, &staged, source);
        Ok((chain.tip().hash, chain.tip().height))
    }

    fn after_commit(
        &self,
        chain: &ChainState<SharedStore>,
        staged: &StagedUpdate,
        source: BlockSource,
    ) {
        let tip = chain.tip();
        {
            let mut forks = self.forks.lock();
            for connected in &staged.connected {
                forks.remove(&connected.hash);
            }
            forks.prune_below(tip.height.saturating_sub(u64::from(self.params.max_fork_length)));
            let mut selector = self.selector.lock();
            selector.settle();
            selector.observe(&tip.hash);
            selector.retain(|hash| *hash == tip.hash || forks.contains(hash));
        }

        let mut confirmed = 0;
        for connected in &staged.connected {
            confirmed += self.mempool.remove_for_block(&connected.block);
        }
        if !staged.disconnected.is_empty() {
            self.revalidate_mempool(chain, &staged.disconnected);
        }

        self.track_difficulty(chain, staged);
        self.miner.cancel_current();

        let fees: Amount = staged.connected.iter().map(|connected| connected.fees).sum();
        if staged.disconnected.is_empty() {
            log_info!(
                "New tip {} at height {} from {source} ({} tx, fees {fees}, {confirmed} confirmed)",
                hash256_to_hex(&tip.hash),
                tip.height,
                staged
                    .connected
                    .last()
                    .map(|connected| connected.block.transactions.len())
                    .unwrap_or(0)
            );
        } else {
            log_warn!(
                "Reorganized to {} at height {}: {} block(s) disconnected, {} connected",
                hash256_to_hex(&tip.hash),
                tip.height,
                staged.disconnected.len(),
                staged.connected.len()
            );
        }

        if let Some(last) = staged.connected.last() {
            let _ = self.events.send(NodeEvent::NewTip {
                hash: last.hash,
                height: last.block.header.height,
                block: last.block.clone(),
                origin: source.peer(),
                relay: source.relays(),
            });
        }
    }

    /// After a reorganization: drop pool entries the new chain invalidates
    /// and offer transactions from disconnected blocks back to the pool.
    fn revalidate_mempool(&self, chain: &ChainState<SharedStore>, disconnected: &[Block]) {
        let invalid: HashSet<Hash256> = self
            .mempool
            .get_all()
            .into_iter()
            .filter(|entry| chain.validate_transaction(&entry.tx).is_err())
            .map(|entry| entry.txid)
            .collect();
        let dropped = self.mempool.remove(&invalid);

        let mut restored = 0usize;
        // Oldest disconnected block first so parents precede children.
        for block in disconnected.iter().rev() {
            for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
                if self.mempool.contains(&tx.txid()) {
                    continue;
                }
                let Ok(fee) = chain.validate_transaction(tx) else {
                    continue;
                };
                if self.mempool.add(MempoolEntry::new(tx.clone(), fee)).is_ok() {
                    restored += 1;
                }
            }
        }
        if dropped > 0 || restored > 0 {
            log_info!("Mempool after reorg: {dropped} dropped, {restored} restored");
        }
    }

    fn track_difficulty(&self, chain: &ChainState<SharedStore>, staged: &StagedUpdate) {
        let tip = chain.tip();
        let mut adjuster = self.adjuster.lock();
        let extends = staged.disconnected.is_empty()
            && staged.connected.len() == 1
            && adjuster.tip_height() == Some(tip.height.saturating_sub(1));
        let mut in_step = false;
        if extends {
            let header = HeaderInfo {
                height: tip.height,
                time: i64::from(tip.time),
                bits: tip.bits,
            };
            in_step = adjuster.adjust(&header).is_ok();
        }
        if in_step {
            match chain.next_bits() {
                Ok(expected) if expected == adjuster.next_bits() => return,
                Ok(expected) => log_warn!(
                    "Difficulty tracker drifted ({:#010x} vs {expected:#010x}); rebuilding",
                    adjuster.next_bits()
                ),
                Err(err) => log_warn!("Could not read next difficulty: {err}"),
            }
        }
        let rebuilt = chain
            .difficulty_headers()
            .map_err(|err| err.to_string())
            .and_then(|headers| {
                DifficultyAdjuster::rebuild(&self.params, &headers).map_err(|err| err.to_string())
            });
        match rebuilt {
            Ok(fresh) => *adjuster = fresh,
            Err(err) => log_warn!("Difficulty tracker rebuild failed: {err}"),
        }
    }

    /// Connects buffered blocks that now extend the tip, one after another.
    fn connect_buffered_children(&self) {
        loop {
            let tip = self.tip().hash;
            let next = {
                let mut forks = self.forks.lock();
                let child = forks.children_of(&tip).into_iter().next();
                child.and_then(|hash| forks.remove(&hash).map(|block| (hash, block)))
            };
            let Some((hash, block)) = next else {
                break;
            };
            match self.accept_block(hash, block, BlockSource::Buffered) {
                Ok(_) => {}
                Err(err) if err.is_fatal() => {
                    if !self.is_halted() {
                        self.halt(err.to_string());
                    }
                    break;
                }
                Err(err) => {
                    log_debug!("Buffered block {} rejected: {err}", short_hash(&hash));
                }
            }
        }
    }

    /// Removes `bad` and everything buffered on top of it.
    fn drop_fork_from(&self, bad: &Hash256) {
        let mut forks = self.forks.lock();
        let mut pending = vec![*bad];
        while let Some(hash) = pending.pop() {
            pending.extend(forks.children_of(&hash));
            forks.remove(&hash);
        }
    }
}

/// Follows buffered children from `start` to the tallest leaf, preferring
/// the earliest arrival at each step.
fn deepest_descendant(forks: &powd_chainstate::ForkBuffer, start: Hash256) -> Hash256 {
    let mut best = (0usize, start);
    let mut stack = vec![(0usize, start)];
    let mut visited = HashSet::new();
    while let Some((depth, hash)) = stack.pop() {
        if !visited.insert(hash) {
            continue;
        }
        if depth > best.0 {
            best = (depth, hash);
        }
        for child in forks.children_of(&hash).into_iter().rev() {
            stack.push((depth + 1, child));
        }
    }
    best.1
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use powd_chainstate::SyncState;
    use powd_consensus::{block_reward, consensus_params, Network};
    use powd_primitives::crypto::EcdsaVerifier;
    use powd_storage::faulty::FaultyStore;
    use powd_storage::memory::MemoryStore;

    use parking_lot::Mutex;

    use super::*;
    use crate::load::{FixedProbe, LoadProbe, LoadSample};
    use crate::miner::{MinerConfig, MiningError};
    use crate::node::{Collaborators, ManualClock, NodeOptions};

    const START: i64 = 1_767_225_700;

    fn options(owner: u8) -> NodeOptions {
        NodeOptions {
            mempool_max_txs: 100,
            max_peers: 8,
            miner: MinerConfig {
                max_workers: 1,
                deadline: Some(Duration::from_secs(30)),
                ..MinerConfig::default()
            },
            mining_owner: Some([owner; 20]),
            coin: "POW".to_string(),
        }
    }

    fn node_on(store: SharedStore, owner: u8) -> (Node, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let collaborators = Collaborators {
            verifier: Arc::new(EcdsaVerifier),
            probe: Arc::new(FixedProbe(LoadSample {
                cpu_busy: 0.0,
                memory_available: 1.0,
                cores: 2,
            })),
            clock: clock.clone(),
        };
        let node = Node::open_with(
            consensus_params(Network::Regtest),
            store,
            options(owner),
            collaborators,
        )
        .expect("open node");
        (node, clock)
    }

    /// Runs a one-shot hook the first time the miner samples load, which is
    /// after its job is registered and the template is built.
    #[derive(Default)]
    struct HookProbe {
        hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl LoadProbe for HookProbe {
        fn sample(&self) -> LoadSample {
            let hook = self.hook.lock().take();
            if let Some(hook) = hook {
                hook();
            }
            LoadSample {
                cpu_busy: 0.0,
                memory_available: 1.0,
                cores: 2,
            }
        }
    }

    fn node(owner: u8) -> (Node, Arc<ManualClock>) {
        node_on(Arc::new(MemoryStore::new()), owner)
    }

    fn mine(node: &Node, clock: &ManualClock, count: usize) -> Vec<Block> {
        (0..count)
            .map(|_| {
                clock.advance(10);
                node.mine_block().expect("mine");
                node.get_block(&node.tip().hash)
                    .expect("read")
                    .expect("tip block")
            })
            .collect()
    }

    fn announce(node: &Node, block: &Block) -> Result<BlockOutcome, NodeError> {
        node.process_block(block.clone(), block.hash(), BlockSource::Announced(7))
    }

    #[test]
    fn mined_block_extends_tip_and_pays_reward() {
        let (node, clock) = node(1);
        let blocks = mine(&node, &clock, 1);
        assert_eq!(node.height(), 1);
        let coinbase = &blocks[0].transactions[0];
        assert_eq!(blocks[0].transactions.len(), 1);
        assert_eq!(coinbase.outputs[0].value, block_reward(1, node.params()));
    }

    #[test]
    fn claimed_hash_must_match() {
        let (miner, clock) = node(1);
        let blocks = mine(&miner, &clock, 1);
        let (follower, _) = node(2);
        let err = follower
            .process_block(blocks[0].clone(), [9u8; 32], BlockSource::Announced(1))
            .expect_err("mismatch");
        assert!(err.is_rejection());
        assert_eq!(follower.height(), 0);
    }

    #[test]
    fn equal_work_fork_keeps_first_seen_tip() {
        let (a, clock_a) = node(1);
        let (b, clock_b) = node(2);
        let ours = mine(&a, &clock_a, 1);
        let theirs = mine(&b, &clock_b, 1);
        assert_ne!(ours[0].hash(), theirs[0].hash());

        assert_eq!(announce(&a, &theirs[0]).expect("fork"), BlockOutcome::Discarded);
        assert_eq!(a.tip().hash, ours[0].hash());
        assert_eq!(a.sync_state(), SyncState::Synced);
        assert_eq!(announce(&a, &theirs[0]).expect("again"), BlockOutcome::AlreadyKnown);
    }

    #[test]
    fn heavier_fork_reorganizes() {
        let (a, clock_a) = node(1);
        let (b, clock_b) = node(2);
        let ours = mine(&a, &clock_a, 2);
        let theirs = mine(&b, &clock_b, 3);
        let mut events = a.subscribe();

        assert_eq!(announce(&a, &theirs[0]).expect("b1"), BlockOutcome::Discarded);
        assert_eq!(announce(&a, &theirs[1]).expect("b2"), BlockOutcome::Discarded);
        assert_eq!(a.tip().hash, ours[1].hash());
        let outcome = announce(&a, &theirs[2]).expect("b3");
        assert_eq!(
            outcome,
            BlockOutcome::Reorganized {
                hash: theirs[2].hash(),
                height: 3,
                disconnected: 2,
                connected: 3,
            }
        );
        assert!(!a.is_main_chain(&ours[0].hash()).expect("query"));
        assert_eq!(a.sync_state(), SyncState::Synced);
        match events.try_recv().expect("event") {
            NodeEvent::NewTip { hash, origin, relay, .. } => {
                assert_eq!(hash, theirs[2].hash());
                assert_eq!(origin, Some(7));
                assert!(relay);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn out_of_order_blocks_wait_for_their_parent() {
        let (a, clock_a) = node(1);
        let (b, _) = node(2);
        let theirs = mine(&a, &clock_a, 3);

        assert_eq!(
            announce(&b, &theirs[2]).expect("orphan"),
            BlockOutcome::Orphan {
                missing: theirs[1].hash()
            }
        );
        assert_eq!(b.sync_state(), SyncState::ForkDetected);
        assert_eq!(
            announce(&b, &theirs[1]).expect("orphan"),
            BlockOutcome::Orphan {
                missing: theirs[0].hash()
            }
        );
        let outcome = announce(&b, &theirs[0]).expect("connect");
        assert!(outcome.moved_tip());
        assert_eq!(b.height(), 3);
        assert_eq!(b.tip().hash, theirs[2].hash());
        assert_eq!(b.status().fork_blocks, 0);
    }

    #[test]
    fn sync_blocks_are_not_relayed() {
        let (a, clock_a) = node(1);
        let (b, _) = node(2);
        let blocks = mine(&a, &clock_a, 1);
        let mut events = b.subscribe();
        b.process_block(blocks[0].clone(), blocks[0].hash(), BlockSource::Synced(3))
            .expect("sync");
        match events.try_recv().expect("event") {
            NodeEvent::NewTip { relay, origin, .. } => {
                assert!(!relay);
                assert_eq!(origin, Some(3));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn fork_block_with_undecodable_bits_is_rejected_without_halting() {
        let (a, clock_a) = node(1);
        let (b, clock_b) = node(2);
        mine(&a, &clock_a, 1);
        let theirs = mine(&b, &clock_b, 1);

        for bits in [0x0480_0000, 0xff7f_ffff] {
            let mut forged = theirs[0].clone();
            forged.header.bits = bits;
            let err = announce(&a, &forged).expect_err("bad bits");
            assert!(err.is_rejection(), "{err}");
            assert!(!a.is_halted());
            assert_eq!(a.status().fork_blocks, 0);
        }
        assert_eq!(a.sync_state(), SyncState::Synced);
        mine(&a, &clock_a, 1);
        assert_eq!(a.height(), 2);
    }

    #[test]
    fn tip_change_while_mining_cancels_the_job() {
        let (b, clock_b) = node(2);
        let competing = mine(&b, &clock_b, 1).remove(0);

        let probe = Arc::new(HookProbe::default());
        let clock = Arc::new(ManualClock::new(START + 10));
        let collaborators = Collaborators {
            verifier: Arc::new(EcdsaVerifier),
            probe: probe.clone(),
            clock: clock.clone(),
        };
        let a = Arc::new(
            Node::open_with(
                consensus_params(Network::Regtest),
                Arc::new(MemoryStore::new()),
                options(1),
                collaborators,
            )
            .expect("open node"),
        );
        let weak = Arc::downgrade(&a);
        let delivered = competing.clone();
        *probe.hook.lock() = Some(Box::new(move || {
            if let Some(node) = weak.upgrade() {
                announce(&node, &delivered).expect("competing block");
            }
        }));

        let err = a.mine_block().expect_err("job cancelled");
        assert!(matches!(err, NodeError::Resource(MiningError::Cancelled)), "{err}");
        assert_eq!(a.tip().hash, competing.hash());
        assert_eq!(a.miner().blocks_found(), 0);

        clock.advance(10);
        a.mine_block().expect("mines on the new tip");
        assert_eq!(a.height(), 2);
    }

    #[test]
    fn storage_failure_halts_acceptance() {
        let store = Arc::new(FaultyStore::new(MemoryStore::new()));
        let (a, clock_a) = node(1);
        let blocks = mine(&a, &clock_a, 2);
        let (b, _) = node_on(store.clone(), 2);
        announce(&b, &blocks[0]).expect("first");
        store.set_fail_writes(true);

        let err = announce(&b, &blocks[1]).expect_err("write fails");
        assert!(err.is_fatal());
        assert!(b.is_halted());
        assert_eq!(b.height(), 1);
        store.set_fail_writes(false);
        assert!(announce(&b, &blocks[1]).expect_err("halted").is_fatal());
    }
}
