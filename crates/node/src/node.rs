//! The `Node` aggregate: chain state, mempool, miner and peer set behind one
//! handle that every task shares.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use powd_chainstate::utxo::UtxoSet;
use powd_chainstate::{ChainSelector, ChainState, ChainTip, ForkBuffer, SyncState};
use powd_consensus::{hash256_to_hex, ConsensusParams, Hash256};
use powd_pow::DifficultyAdjuster;
use powd_primitives::block::Block;
use powd_primitives::crypto::{EcdsaVerifier, Verifier};
use powd_primitives::transaction::{OwnerHash, Transaction};
use powd_storage::KeyValueStore;
use tokio::sync::{broadcast, watch};

use crate::breaker::BreakerState;
use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::load::{LoadProbe, SystemProbe};
use crate::mempool::{AddOutcome, Mempool, MempoolEntry};
use crate::miner::{Miner, MinerConfig, MiningError};
use crate::p2p::{PeerId, PeerSet};
use crate::template::{assemble_block, BlockTemplate, TemplateRequest};

pub type SharedStore = Arc<dyn KeyValueStore>;

const EVENT_QUEUE_LEN: usize = 1_024;

/// Miner waits for a taller peer this many times in a row without the tip
/// moving before it mines on the local tip anyway.
pub const MAX_STALLED_SYNC_ROUNDS: u32 = 6;

/// Source of the current unix time in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(std::sync::atomic::AtomicI64);

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self(std::sync::atomic::AtomicI64::new(now))
    }

    pub fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Collaborators the node consumes but does not implement.
pub struct Collaborators {
    pub verifier: Arc<dyn Verifier>,
    pub probe: Arc<dyn LoadProbe>,
    pub clock: Arc<dyn Clock>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            verifier: Arc::new(EcdsaVerifier),
            probe: Arc::new(SystemProbe::new()),
            clock: Arc::new(SystemClock),
        }
    }
}

#[derive(Clone, Debug)]
pub struct NodeOptions {
    pub mempool_max_txs: usize,
    pub max_peers: usize,
    pub miner: MinerConfig,
    pub mining_owner: Option<OwnerHash>,
    pub coin: String,
}

impl NodeOptions {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            mempool_max_txs: config.mempool_max_txs,
            max_peers: config.max_peers,
            miner: MinerConfig {
                max_workers: config.max_workers,
                deadline: config.mine_deadline,
                ..MinerConfig::default()
            },
            mining_owner: config.mining_owner,
            coin: config.coin.clone(),
        }
    }
}

/// Where a block came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockSource {
    /// Mined by this node.
    Local,
    /// Announced by a peer as new.
    Announced(PeerId),
    /// Fetched from a peer while catching up.
    Synced(PeerId),
    /// Held in the fork buffer until its parent connected.
    Buffered,
}

impl BlockSource {
    /// Live blocks get the `now - skew` timestamp lower bound.
    pub fn is_live(self) -> bool {
        matches!(self, BlockSource::Local | BlockSource::Announced(_))
    }

    pub fn peer(self) -> Option<PeerId> {
        match self {
            BlockSource::Announced(peer) | BlockSource::Synced(peer) => Some(peer),
            BlockSource::Local | BlockSource::Buffered => None,
        }
    }

    pub(crate) fn relays(self) -> bool {
        self.is_live()
    }
}

impl std::fmt::Display for BlockSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockSource::Local => write!(f, "local miner"),
            BlockSource::Announced(peer) => write!(f, "peer {peer}"),
            BlockSource::Synced(peer) => write!(f, "peer {peer} (sync)"),
            BlockSource::Buffered => write!(f, "fork buffer"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockOutcome {
    Connected {
        hash: Hash256,
        height: u64,
    },
    Reorganized {
        hash: Hash256,
        height: u64,
        disconnected: usize,
        connected: usize,
    },
    AlreadyKnown,
    /// Buffered; `missing` is the first ancestor nobody has sent yet.
    Orphan {
        missing: Hash256,
    },
    /// A side chain without more work than the active one.
    Discarded,
}

impl BlockOutcome {
    pub fn moved_tip(&self) -> bool {
        matches!(
            self,
            BlockOutcome::Connected { .. } | BlockOutcome::Reorganized { .. }
        )
    }
}

/// Things other tasks react to.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    NewTip {
        hash: Hash256,
        height: u64,
        block: Block,
        origin: Option<PeerId>,
        relay: bool,
    },
    NewTransaction {
        tx: Transaction,
        origin: Option<PeerId>,
    },
}

#[derive(Clone, Debug)]
pub struct NodeStatus {
    pub height: u64,
    pub best_hash: Hash256,
    pub difficulty: f64,
    pub next_bits: u32,
    pub sync_state: SyncState,
    pub peers: usize,
    pub mempool: usize,
    pub fork_blocks: usize,
    pub miner_workers: usize,
    pub blocks_mined: u64,
    pub breaker: BreakerState,
    pub halted: bool,
}

pub struct Node {
    pub(crate) params: ConsensusParams,
    pub(crate) options: NodeOptions,
    pub(crate) chain: RwLock<ChainState<SharedStore>>,
    pub(crate) mempool: Mempool,
    pub(crate) miner: Miner,
    pub(crate) peers: Arc<PeerSet>,
    pub(crate) forks: Mutex<ForkBuffer>,
    pub(crate) selector: Mutex<ChainSelector>,
    pub(crate) adjuster: Mutex<DifficultyAdjuster>,
    pub(crate) events: broadcast::Sender<NodeEvent>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) halted: AtomicBool,
    pub(crate) halt_reason: Mutex<Option<String>>,
}

impl Node {
    pub fn open(
        params: ConsensusParams,
        store: SharedStore,
        options: NodeOptions,
    ) -> Result<Self, NodeError> {
        Self::open_with(params, store, options, Collaborators::default())
    }

    pub fn open_with(
        params: ConsensusParams,
        store: SharedStore,
        options: NodeOptions,
        collaborators: Collaborators,
    ) -> Result<Self, NodeError> {
        let chain = ChainState::open(store, params.clone(), collaborators.verifier)?;
        let adjuster = DifficultyAdjuster::rebuild(&params, &chain.difficulty_headers()?)
            .map_err(|err| NodeError::Storage(err.to_string()))?;
        let mut selector = ChainSelector::new();
        selector.observe(&chain.tip().hash);
        let (events, _) = broadcast::channel(EVENT_QUEUE_LEN);
        Ok(Self {
            forks: Mutex::new(ForkBuffer::new(params.max_fork_length)),
            mempool: Mempool::new(options.mempool_max_txs),
            miner: Miner::new(options.miner.clone(), collaborators.probe),
            peers: Arc::new(PeerSet::new(options.max_peers)),
            selector: Mutex::new(selector),
            adjuster: Mutex::new(adjuster),
            chain: RwLock::new(chain),
            events,
            clock: collaborators.clock,
            halted: AtomicBool::new(false),
            halt_reason: Mutex::new(None),
            params,
            options,
        })
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn miner(&self) -> &Miner {
        &self.miner
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub fn tip(&self) -> ChainTip {
        self.chain.read().tip().clone()
    }

    pub fn height(&self) -> u64 {
        self.chain.read().tip().height
    }

    pub fn sync_state(&self) -> SyncState {
        self.selector.lock().state()
    }

    /// Difficulty the next block must meet, relative to the easiest target.
    pub fn difficulty(&self) -> f64 {
        self.adjuster.lock().get_difficulty()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, NodeError> {
        Ok(self.chain.read().get_block(hash)?)
    }

    pub fn contains_block(&self, hash: &Hash256) -> Result<bool, NodeError> {
        if self.forks.lock().contains(hash) {
            return Ok(true);
        }
        Ok(self.chain.read().contains_block(hash)?)
    }

    pub fn blocks_from(&self, start: u64, limit: usize) -> Result<Vec<Block>, NodeError> {
        Ok(self.chain.read().blocks_from(start, limit)?)
    }

    pub fn is_main_chain(&self, hash: &Hash256) -> Result<bool, NodeError> {
        Ok(self.chain.read().is_main_chain(hash)?)
    }

    pub(crate) fn ensure_running(&self) -> Result<(), NodeError> {
        if !self.is_halted() {
            return Ok(());
        }
        let reason = self
            .halt_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "storage failure".to_string());
        Err(NodeError::Storage(format!("block acceptance halted: {reason}")))
    }

    pub(crate) fn halt(&self, reason: String) {
        log_error!("Halting block acceptance: {reason}");
        *self.halt_reason.lock() = Some(reason);
        self.halted.store(true, Ordering::SeqCst);
        self.miner.cancel_current();
    }

    /// Validates `tx` against the confirmed UTXO set and pools it.
    pub fn submit_transaction(
        &self,
        tx: Transaction,
        origin: Option<PeerId>,
    ) -> Result<AddOutcome, NodeError> {
        if tx.is_coinbase() {
            return Err(crate::mempool::MempoolError::Coinbase.into());
        }
        let txid = tx.txid();
        if self.mempool.contains(&txid) {
            return Ok(AddOutcome::AlreadyPresent);
        }
        // Held until the entry is pooled so a block commit cannot confirm
        // the transaction in between.
        let chain = self.chain.read();
        let fee = match chain.validate_transaction(&tx) {
            Ok(fee) => fee,
            Err(err) => {
                log_debug!("Rejected transaction {}: {err}", hash256_to_hex(&txid));
                return Err(err.into());
            }
        };
        let outcome = self.mempool.add(MempoolEntry::new(tx.clone(), fee))?;
        drop(chain);
        match outcome {
            AddOutcome::Added => {
                log_debug!(
                    "Accepted transaction {} (fee {fee}, pool {})",
                    hash256_to_hex(&txid),
                    self.mempool.len()
                );
                let _ = self.events.send(NodeEvent::NewTransaction { tx, origin });
            }
            AddOutcome::Full => {
                log_debug!("Mempool full; dropped {}", hash256_to_hex(&txid));
            }
            AddOutcome::AlreadyPresent => {}
        }
        Ok(outcome)
    }

    /// Candidate block on the current tip paying the configured owner.
    pub fn block_template(&self, now: i64) -> Result<BlockTemplate, NodeError> {
        let owner = self.options.mining_owner.ok_or_else(|| {
            MiningError::Resource("no mining address configured".to_string())
        })?;
        let pool = self.mempool.get_all();
        let chain = self.chain.read();
        let bits = chain.next_bits()?;
        let utxos = UtxoSet::new(chain.store());
        let request = TemplateRequest {
            tip: chain.tip(),
            bits,
            now,
            owner,
            coin: &self.options.coin,
        };
        Ok(assemble_block(
            &request,
            &pool,
            &utxos,
            &self.params,
            chain.verifier(),
        ))
    }

    /// Builds a template, mines it on the worker pool and hands the result
    /// to block processing. Blocks the calling thread while mining.
    pub fn mine_block(&self) -> Result<BlockOutcome, NodeError> {
        self.mine_block_at(self.clock.now())
    }

    pub fn mine_block_at(&self, now: i64) -> Result<BlockOutcome, NodeError> {
        self.ensure_running()?;
        // Registered before the template so a tip change while it is built
        // still cancels this job.
        let token = self.miner.begin_job();
        let template = self.block_template(now)?;
        let mut block = template.block;
        let mined = self.miner.mine(&block.header, &token)?;
        if self.tip().hash != block.header.prev_block {
            log_debug!("Discarding mined block on stale tip");
            return Err(MiningError::Stale.into());
        }
        block.header.nonce = mined.nonce;
        log_info!(
            "Mined block {} at height {} ({} tx, {} worker(s), {:?})",
            hash256_to_hex(&mined.hash),
            block.header.height,
            block.transactions.len(),
            mined.workers,
            mined.elapsed
        );
        self.process_block(block, mined.hash, BlockSource::Local)
    }

    pub fn status(&self) -> NodeStatus {
        let (tip, next_bits) = {
            let chain = self.chain.read();
            let next_bits = chain.next_bits().unwrap_or(0);
            (chain.tip().clone(), next_bits)
        };
        NodeStatus {
            height: tip.height,
            best_hash: tip.hash,
            difficulty: self.difficulty(),
            next_bits,
            sync_state: self.sync_state(),
            peers: self.peers.len(),
            mempool: self.mempool.len(),
            fork_blocks: self.forks.lock().len(),
            miner_workers: self.miner.last_workers(),
            blocks_mined: self.miner.blocks_found(),
            breaker: self.miner.breaker().state(),
            halted: self.is_halted(),
        }
    }

    pub fn log_status(&self) {
        let status = self.status();
        log_info!(
            "Status: height {} best {} difficulty {:.4} bits {:#010x} state {} peers {} mempool {} forks {} workers {} mined {} breaker {}{}",
            status.height,
            crate::wire::short_hash(&status.best_hash),
            status.difficulty,
            status.next_bits,
            status.sync_state.as_str(),
            status.peers,
            status.mempool,
            status.fork_blocks,
            status.miner_workers,
            status.blocks_mined,
            status.breaker.as_str(),
            if status.halted { " HALTED" } else { "" }
        );
    }

    /// Mines until `shutdown` flips. Waits while a peer reports a taller
    /// chain so the node does not mine on a stale tip, but only for
    /// [`MAX_STALLED_SYNC_ROUNDS`] waits in a row without the tip moving.
    pub async fn run_miner(self: Arc<Self>, mut shutdown: watch::Receiver<bool>, wait: Duration) {
        log_info!("Miner started (max {} worker(s))", self.miner.config().max_workers);
        let mut stalled_rounds = 0u32;
        let mut last_height = self.height();
        loop {
            if *shutdown.borrow() || self.is_halted() {
                break;
            }
            let height = self.height();
            if height != last_height {
                stalled_rounds = 0;
                last_height = height;
            }
            let behind = self.peers.best_peer(height).is_some();
            let waiting = behind && stalled_rounds < MAX_STALLED_SYNC_ROUNDS;
            if !behind {
                stalled_rounds = 0;
            }
            let pause = if waiting {
                stalled_rounds += 1;
                if stalled_rounds == MAX_STALLED_SYNC_ROUNDS {
                    log_warn!(
                        "Sync made no progress in {stalled_rounds} round(s) at height {height}; \
                         mining on the local tip"
                    );
                }
                Some(wait)
            } else {
                let node = Arc::clone(&self);
                match tokio::task::spawn_blocking(move || node.mine_block()).await {
                    Ok(Ok(outcome)) => {
                        log_debug!("Mined block outcome: {outcome:?}");
                        // Our own block is not sync progress.
                        last_height = self.height();
                        None
                    }
                    Ok(Err(NodeError::Resource(MiningError::BreakerOpen { retry_after }))) => {
                        log_warn!("Mining paused: breaker open for {retry_after:?}");
                        Some(retry_after.max(Duration::from_millis(100)))
                    }
                    Ok(Err(NodeError::Resource(
                        MiningError::Cancelled | MiningError::Stale,
                    ))) => None,
                    Ok(Err(NodeError::Resource(err))) => {
                        log_warn!("Mining attempt failed: {err}");
                        None
                    }
                    Ok(Err(err)) if err.is_fatal() => {
                        log_error!("Miner stopping: {err}");
                        break;
                    }
                    Ok(Err(err)) => {
                        log_warn!("Mined block rejected: {err}");
                        Some(Duration::from_secs(1))
                    }
                    Err(err) => {
                        log_error!("Mining task failed: {err}");
                        Some(Duration::from_secs(1))
                    }
                }
            };
            if let Some(pause) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        self.miner.cancel_current();
        log_info!("Miner stopped");
    }
}
