//! Chain state: the active tip plus staged, all-or-nothing updates to the
//! block store, header index, undo data and UTXO set.
//!
//! Every mutation is computed first as a [`StagedUpdate`] against the current
//! tip without touching storage, then committed as a single write batch. A
//! failure while staging leaves nothing behind, and a failed commit leaves the
//! in-memory tip where it was.

use std::collections::HashMap;
use std::sync::Arc;

use powd_consensus::constants::DEFAULT_COIN;
use powd_consensus::{block_reward, hash256_to_hex, Amount, ConsensusParams, Hash256};
use powd_log::{log_debug, log_info, log_warn};
use powd_pow::difficulty::{block_proof, next_work_required, CompactError, DifficultyError};
use powd_pow::validation::{check_proof_of_work, PowError};
use powd_pow::HeaderInfo;
use powd_primitives::block::{Block, BlockHeader};
use powd_primitives::crypto::Verifier;
use powd_primitives::outpoint::OutPoint;
use powd_primitives::transaction::Transaction;
use powd_storage::{KeyValueStore, StoreError, WriteBatch};
use primitive_types::U256;

use crate::blocks::BlockStore;
use crate::index::{chainwork_bytes, status_with_block, ChainIndex, ChainTip, HeaderEntry};
use crate::undo::BlockUndo;
use crate::utxo::{UtxoEntry, UtxoOverlay, UtxoSet, UtxoView};
use crate::validation::{apply_block, validate_transaction, BlockContext, ConsensusError, RuleError};

#[derive(Debug)]
pub enum ChainStateError {
    InvalidBlock { hash: Hash256, reason: RuleError },
    Store(StoreError),
    Difficulty(DifficultyError),
    Duplicate(Hash256),
    UnknownParent(Hash256),
    NotExtendingTip,
    InsufficientWork,
    ForkTooLong,
    StaleStage,
    CorruptIndex(&'static str),
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::InvalidBlock { hash, reason } => {
                write!(f, "block {} rejected: {reason}", hash256_to_hex(hash))
            }
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::Difficulty(err) => write!(f, "{err}"),
            ChainStateError::Duplicate(hash) => {
                write!(f, "block {} already stored", hash256_to_hex(hash))
            }
            ChainStateError::UnknownParent(hash) => {
                write!(f, "unknown parent {}", hash256_to_hex(hash))
            }
            ChainStateError::NotExtendingTip => write!(f, "block does not extend the active tip"),
            ChainStateError::InsufficientWork => write!(f, "fork does not have more work"),
            ChainStateError::ForkTooLong => write!(f, "fork exceeds maximum length"),
            ChainStateError::StaleStage => write!(f, "staged update no longer matches the tip"),
            ChainStateError::CorruptIndex(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<DifficultyError> for ChainStateError {
    fn from(err: DifficultyError) -> Self {
        ChainStateError::Difficulty(err)
    }
}

impl From<CompactError> for ChainStateError {
    fn from(err: CompactError) -> Self {
        ChainStateError::Difficulty(DifficultyError::Compact(err))
    }
}

fn pow_rejection(hash: Hash256, err: PowError) -> ChainStateError {
    ChainStateError::InvalidBlock {
        hash,
        reason: RuleError::Consensus(ConsensusError::Pow(err)),
    }
}

/// How a block reached us.
#[derive(Clone, Copy, Debug)]
pub struct Arrival {
    /// Just mined or announced as new, as opposed to fetched by sync.
    pub live: bool,
    pub now: i64,
}

#[derive(Clone, Debug)]
pub struct ConnectedBlock {
    pub hash: Hash256,
    pub block: Block,
    pub fees: Amount,
}

/// A fully validated, not yet written chain transition.
#[derive(Debug)]
pub struct StagedUpdate {
    /// Tip this update was computed against.
    pub base: Hash256,
    pub batch: WriteBatch,
    pub tip: ChainTip,
    /// Oldest first.
    pub connected: Vec<ConnectedBlock>,
    /// Previous tip first.
    pub disconnected: Vec<Block>,
}

pub struct ChainState<S> {
    store: S,
    params: ConsensusParams,
    verifier: Arc<dyn Verifier>,
    tip: ChainTip,
}

/// The deterministic block at height 0: a lone coinbase paying the height-0
/// reward to the all-zero owner.
pub fn genesis_block(params: &ConsensusParams) -> Block {
    let coinbase = Transaction::coinbase(0, block_reward(0, params), [0u8; 20], DEFAULT_COIN);
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: params.genesis_time,
            bits: params.genesis_bits,
            nonce: 0,
            height: 0,
        },
        transactions: vec![coinbase],
    };
    block.header.merkle_root = block.compute_merkle_root().0;
    block
}

impl<S: KeyValueStore> ChainState<S> {
    /// Loads the persisted tip, writing the genesis block into an empty store.
    pub fn open(
        store: S,
        params: ConsensusParams,
        verifier: Arc<dyn Verifier>,
    ) -> Result<Self, ChainStateError> {
        let index = ChainIndex::new(&store);
        let tip = match index.best_block_hash()? {
            Some(hash) => {
                let entry = index
                    .get_header(&hash)?
                    .ok_or(ChainStateError::CorruptIndex("best block has no header entry"))?;
                tip_from_entry(hash, &entry)
            }
            None => write_genesis(&store, &params)?,
        };
        log_info!(
            "Chain state ready at height {} ({})",
            tip.height,
            hash256_to_hex(&tip.hash)
        );
        Ok(Self {
            store,
            params,
            verifier,
            tip,
        })
    }

    pub fn tip(&self) -> &ChainTip {
        &self.tip
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn verifier(&self) -> &dyn Verifier {
        self.verifier.as_ref()
    }

    pub fn header(&self, hash: &Hash256) -> Result<Option<HeaderEntry>, ChainStateError> {
        Ok(self.index().get_header(hash)?)
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainStateError> {
        Ok(self.blocks().get(hash)?)
    }

    pub fn block_at_height(&self, height: u64) -> Result<Option<Block>, ChainStateError> {
        if height > self.tip.height {
            return Ok(None);
        }
        Ok(self.blocks().get_by_height(height)?)
    }

    /// Main-chain blocks starting at `start`, at most `limit`.
    pub fn blocks_from(&self, start: u64, limit: usize) -> Result<Vec<Block>, ChainStateError> {
        let mut out = Vec::new();
        let mut height = start;
        while out.len() < limit && height <= self.tip.height {
            match self.block_at_height(height)? {
                Some(block) => out.push(block),
                None => return Err(ChainStateError::CorruptIndex("height index gap")),
            }
            height += 1;
        }
        Ok(out)
    }

    pub fn contains_block(&self, hash: &Hash256) -> Result<bool, ChainStateError> {
        Ok(self.blocks().contains(hash)?)
    }

    pub fn is_main_chain(&self, hash: &Hash256) -> Result<bool, ChainStateError> {
        match self.index().get_header(hash)? {
            Some(entry) => Ok(self.index().is_main_chain(hash, entry.height)?),
            None => Ok(false),
        }
    }

    pub fn utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, ChainStateError> {
        Ok(UtxoSet::new(&self.store).get(outpoint)?)
    }

    pub fn utxo_count(&self) -> Result<usize, ChainStateError> {
        Ok(UtxoSet::new(&self.store).count()?)
    }

    /// Checks `tx` for inclusion in the next block against confirmed outputs.
    pub fn validate_transaction(&self, tx: &Transaction) -> Result<Amount, RuleError> {
        let utxos = UtxoSet::new(&self.store);
        validate_transaction(
            tx,
            self.tip.height + 1,
            &self.params,
            &utxos,
            self.verifier.as_ref(),
        )
    }

    /// Bits the block after the active tip must carry.
    pub fn next_bits(&self) -> Result<u32, ChainStateError> {
        self.expected_bits(&self.tip.hash, &HashMap::new())
    }

    /// The last `difficulty_window + 1` main-chain headers, oldest first.
    pub fn difficulty_headers(&self) -> Result<Vec<HeaderInfo>, ChainStateError> {
        self.header_window(&self.tip.hash, &HashMap::new())
    }

    /// Cumulative work of the chain ending in `fork`, whose first block's
    /// parent must have a header entry.
    pub fn fork_work(&self, fork: &[Block]) -> Result<U256, ChainStateError> {
        let Some(first) = fork.first() else {
            return Ok(self.tip.chainwork);
        };
        let parent = self
            .index()
            .get_header(&first.header.prev_block)?
            .ok_or(ChainStateError::UnknownParent(first.header.prev_block))?;
        let mut work = parent.chainwork_value();
        for block in fork {
            let proof = block_proof(block.header.bits)
                .map_err(|err| pow_rejection(block.hash(), PowError::Compact(err)))?;
            work = work.saturating_add(proof);
        }
        Ok(work)
    }

    /// Rejects a block whose header carries no valid proof of work on its
    /// own, before it is buffered or weighed as a fork.
    pub fn check_header(&self, block: &Block) -> Result<(), ChainStateError> {
        check_proof_of_work(&block.header, &self.params)
            .map_err(|err| pow_rejection(block.hash(), err))
    }

    /// Validates `block` as the next block on the active tip.
    pub fn stage_connect(
        &self,
        block: &Block,
        arrival: Arrival,
    ) -> Result<StagedUpdate, ChainStateError> {
        if block.header.prev_block != self.tip.hash {
            return Err(ChainStateError::NotExtendingTip);
        }
        let hash = block.hash();
        if self.blocks().contains(&hash)? {
            return Err(ChainStateError::Duplicate(hash));
        }

        let utxos = UtxoSet::new(&self.store);
        let mut overlay = UtxoOverlay::new(&utxos);
        let mut staged_headers = HashMap::new();
        let mut batch = WriteBatch::new();
        let (tip, connected) = self.stage_block(
            &mut batch,
            &mut overlay,
            &mut staged_headers,
            block,
            &self.tip,
            arrival,
        )?;
        overlay.write_to(&utxos, &mut batch);
        self.index().set_best_block(&mut batch, &tip.hash);

        Ok(StagedUpdate {
            base: self.tip.hash,
            batch,
            tip,
            connected: vec![connected],
            disconnected: Vec::new(),
        })
    }

    /// Switches to the chain ending in `fork` (oldest first). Stored blocks
    /// that sit between the fork and the main chain are pulled in
    /// automatically. Every block on the new branch is validated again.
    pub fn stage_reorganize(
        &self,
        fork: &[Block],
        arrival: Arrival,
    ) -> Result<StagedUpdate, ChainStateError> {
        let Some(first) = fork.first() else {
            return Err(ChainStateError::InsufficientWork);
        };
        let index = self.index();
        let blocks = self.blocks();

        let mut segment: Vec<Block> = fork.to_vec();
        let mut anchor = first.header.prev_block;
        let anchor_entry = loop {
            let entry = index
                .get_header(&anchor)?
                .ok_or(ChainStateError::UnknownParent(anchor))?;
            if index.is_main_chain(&anchor, entry.height)? {
                break entry;
            }
            let stored = blocks
                .get(&anchor)?
                .ok_or(ChainStateError::CorruptIndex("stale header without block"))?;
            segment.insert(0, stored);
            if segment.len() > self.params.max_fork_length as usize {
                return Err(ChainStateError::ForkTooLong);
            }
            anchor = entry.prev_hash;
        };
        let depth = self.tip.height.saturating_sub(anchor_entry.height);
        if depth > u64::from(self.params.max_fork_length) {
            return Err(ChainStateError::ForkTooLong);
        }

        let utxos = UtxoSet::new(&self.store);
        let mut overlay = UtxoOverlay::new(&utxos);
        let mut batch = WriteBatch::new();

        let mut disconnected = Vec::new();
        let mut cursor = self.tip.hash;
        while cursor != anchor {
            let block = blocks
                .get(&cursor)?
                .ok_or(ChainStateError::CorruptIndex("main chain block missing"))?;
            let undo = blocks
                .undo(&cursor)?
                .ok_or(ChainStateError::CorruptIndex("main chain undo missing"))?;
            disconnect_block(&mut overlay, &block, &undo)?;
            blocks.stage_drop_undo(&mut batch, &cursor);
            cursor = block.header.prev_block;
            disconnected.push(block);
        }

        let mut staged_headers = HashMap::new();
        let mut parent = tip_from_entry(anchor, &anchor_entry);
        let mut connected = Vec::with_capacity(segment.len());
        let last = segment.len() - 1;
        for (position, block) in segment.iter().enumerate() {
            let block_arrival = Arrival {
                live: arrival.live && position == last,
                now: arrival.now,
            };
            let (tip, summary) = self.stage_block(
                &mut batch,
                &mut overlay,
                &mut staged_headers,
                block,
                &parent,
                block_arrival,
            )?;
            connected.push(summary);
            parent = tip;
        }

        if parent.chainwork <= self.tip.chainwork {
            return Err(ChainStateError::InsufficientWork);
        }
        for height in (parent.height + 1)..=self.tip.height {
            index.clear_height_hash(&mut batch, height);
        }
        overlay.write_to(&utxos, &mut batch);
        index.set_best_block(&mut batch, &parent.hash);

        Ok(StagedUpdate {
            base: self.tip.hash,
            batch,
            tip: parent,
            connected,
            disconnected,
        })
    }

    /// Writes a staged update and moves the tip. On a write failure the tip
    /// is left unchanged.
    pub fn commit(&mut self, staged: &StagedUpdate) -> Result<&ChainTip, ChainStateError> {
        if staged.base != self.tip.hash {
            return Err(ChainStateError::StaleStage);
        }
        if let Err(err) = self.store.write_batch(&staged.batch) {
            log_warn!(
                "Commit of {} failed: {err}",
                hash256_to_hex(&staged.tip.hash)
            );
            return Err(err.into());
        }
        self.tip = staged.tip.clone();
        log_debug!(
            "Committed tip {} at height {} ({} connected, {} disconnected)",
            hash256_to_hex(&self.tip.hash),
            self.tip.height,
            staged.connected.len(),
            staged.disconnected.len()
        );
        Ok(&self.tip)
    }

    pub fn connect_block(
        &mut self,
        block: &Block,
        arrival: Arrival,
    ) -> Result<StagedUpdate, ChainStateError> {
        let staged = self.stage_connect(block, arrival)?;
        self.commit(&staged)?;
        Ok(staged)
    }

    pub fn reorganize(
        &mut self,
        fork: &[Block],
        arrival: Arrival,
    ) -> Result<StagedUpdate, ChainStateError> {
        let staged = self.stage_reorganize(fork, arrival)?;
        self.commit(&staged)?;
        Ok(staged)
    }

    fn index(&self) -> ChainIndex<&S> {
        ChainIndex::new(&self.store)
    }

    fn blocks(&self) -> BlockStore<&S> {
        BlockStore::new(&self.store)
    }

    fn stage_block<V: UtxoView + ?Sized>(
        &self,
        batch: &mut WriteBatch,
        overlay: &mut UtxoOverlay<'_, V>,
        staged_headers: &mut HashMap<Hash256, HeaderEntry>,
        block: &Block,
        parent: &ChainTip,
        arrival: Arrival,
    ) -> Result<(ChainTip, ConnectedBlock), ChainStateError> {
        let hash = block.hash();
        let height = parent.height + 1;
        let expected_bits = self.expected_bits(&parent.hash, staged_headers)?;
        let ctx = BlockContext {
            params: &self.params,
            height,
            expected_bits,
            now: arrival.now,
            live: arrival.live,
            parent_time: Some(i64::from(parent.time)),
        };
        let summary = apply_block(block, &hash, &ctx, overlay, self.verifier.as_ref())
            .map_err(|reason| ChainStateError::InvalidBlock { hash, reason })?;

        let chainwork = parent
            .chainwork
            .saturating_add(block_proof(block.header.bits)?);
        let entry = HeaderEntry {
            prev_hash: parent.hash,
            height,
            time: block.header.time,
            bits: block.header.bits,
            chainwork: chainwork_bytes(chainwork),
            status: status_with_block(0),
        };
        let index = self.index();
        let blocks = self.blocks();
        index.put_header(batch, &hash, &entry);
        index.set_height_hash(batch, height, &hash);
        if !blocks.contains(&hash)? {
            blocks.stage_put(batch, block)?;
        }
        blocks.stage_undo(batch, &hash, &summary.undo);
        staged_headers.insert(hash, entry.clone());

        Ok((
            tip_from_entry(hash, &entry),
            ConnectedBlock {
                hash,
                block: block.clone(),
                fees: summary.fees,
            },
        ))
    }

    fn expected_bits(
        &self,
        parent: &Hash256,
        staged: &HashMap<Hash256, HeaderEntry>,
    ) -> Result<u32, ChainStateError> {
        let window = self.header_window(parent, staged)?;
        Ok(next_work_required(&window, &self.params)?)
    }

    /// Headers ending at `last`, oldest first, enough for one retarget.
    fn header_window(
        &self,
        last: &Hash256,
        staged: &HashMap<Hash256, HeaderEntry>,
    ) -> Result<Vec<HeaderInfo>, ChainStateError> {
        let wanted = self.params.difficulty_window + 1;
        let index = self.index();
        let mut window = Vec::with_capacity(wanted);
        let mut cursor = *last;
        while window.len() < wanted {
            let entry = match staged.get(&cursor) {
                Some(entry) => entry.clone(),
                None => index
                    .get_header(&cursor)?
                    .ok_or(ChainStateError::UnknownParent(cursor))?,
            };
            window.push(entry.info());
            if entry.height == 0 {
                break;
            }
            cursor = entry.prev_hash;
        }
        window.reverse();
        Ok(window)
    }
}

fn tip_from_entry(hash: Hash256, entry: &HeaderEntry) -> ChainTip {
    ChainTip {
        hash,
        height: entry.height,
        chainwork: entry.chainwork_value(),
        time: entry.time,
        bits: entry.bits,
    }
}

fn write_genesis<S: KeyValueStore>(
    store: &S,
    params: &ConsensusParams,
) -> Result<ChainTip, ChainStateError> {
    let block = genesis_block(params);
    let hash = block.hash();
    let entry = HeaderEntry {
        prev_hash: [0u8; 32],
        height: 0,
        time: block.header.time,
        bits: block.header.bits,
        chainwork: chainwork_bytes(block_proof(block.header.bits)?),
        status: status_with_block(0),
    };

    let index = ChainIndex::new(store);
    let blocks = BlockStore::new(store);
    let utxos = UtxoSet::new(store);
    let mut batch = WriteBatch::new();
    blocks.stage_put(&mut batch, &block)?;
    index.put_header(&mut batch, &hash, &entry);
    index.set_height_hash(&mut batch, 0, &hash);
    index.set_best_block(&mut batch, &hash);
    let mut overlay = UtxoOverlay::new(&utxos);
    for tx in &block.transactions {
        overlay.add_outputs(tx, &tx.txid(), 0);
    }
    overlay.write_to(&utxos, &mut batch);
    store.write_batch(&batch)?;
    log_info!("Wrote genesis block {}", hash256_to_hex(&hash));
    Ok(tip_from_entry(hash, &entry))
}

/// Reverses `block` inside `overlay`: last transaction first, each one's
/// outputs removed and its spent inputs restored from `undo`.
fn disconnect_block<V: UtxoView + ?Sized>(
    overlay: &mut UtxoOverlay<'_, V>,
    block: &Block,
    undo: &BlockUndo,
) -> Result<(), ChainStateError> {
    let mut offsets = Vec::with_capacity(block.transactions.len());
    let mut next = 0usize;
    for tx in &block.transactions {
        offsets.push(next);
        if !tx.is_coinbase() {
            next += tx.inputs.len();
        }
    }
    if next != undo.spent.len() {
        return Err(ChainStateError::CorruptIndex("undo does not match block"));
    }

    for (position, tx) in block.transactions.iter().enumerate().rev() {
        let txid = tx.txid();
        for index in 0..tx.outputs.len() {
            overlay.remove(&OutPoint::new(txid, index as u32));
        }
        if tx.is_coinbase() {
            continue;
        }
        let start = offsets[position];
        for spent in undo.spent[start..start + tx.inputs.len()].iter().rev() {
            overlay.insert(spent.outpoint, spent.entry.clone());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use powd_consensus::params::{consensus_params, Network};
    use powd_primitives::crypto::EcdsaVerifier;
    use powd_storage::memory::MemoryStore;

    fn open() -> ChainState<MemoryStore> {
        ChainState::open(
            MemoryStore::new(),
            consensus_params(Network::Regtest),
            Arc::new(EcdsaVerifier),
        )
        .expect("open")
    }

    #[test]
    fn genesis_is_written_once_and_deterministic() {
        let params = consensus_params(Network::Regtest);
        assert_eq!(genesis_block(&params), genesis_block(&params));

        let state = open();
        let genesis = genesis_block(&params);
        assert_eq!(state.tip().height, 0);
        assert_eq!(state.tip().hash, genesis.hash());
        assert_eq!(state.block_at_height(0).unwrap(), Some(genesis.clone()));
        let coinbase = OutPoint::new(genesis.transactions[0].txid(), 0);
        assert!(state.utxo(&coinbase).unwrap().is_some());

        let store = state.store;
        let reopened = ChainState::open(store, params, Arc::new(EcdsaVerifier)).expect("reopen");
        assert_eq!(reopened.tip().hash, genesis.hash());
    }

    #[test]
    fn next_bits_on_fresh_chain_is_genesis_bits() {
        let state = open();
        assert_eq!(state.next_bits().unwrap(), state.params().genesis_bits);
        assert_eq!(state.difficulty_headers().unwrap().len(), 1);
    }

    #[test]
    fn block_not_on_tip_is_refused() {
        let state = open();
        let mut block = genesis_block(state.params());
        block.header.prev_block = [9u8; 32];
        let err = state
            .stage_connect(&block, Arrival { live: false, now: 0 })
            .expect_err("not on tip");
        assert!(matches!(err, ChainStateError::NotExtendingTip));
    }
}
