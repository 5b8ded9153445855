//! Bounded pool of validated, unconfirmed transactions in arrival order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use powd_chainstate::RuleError;
use powd_consensus::{hash256_to_hex, Amount, Hash256};
use powd_primitives::block::Block;
use powd_primitives::outpoint::OutPoint;
use powd_primitives::transaction::Transaction;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MempoolError {
    Rejected(RuleError),
    Coinbase,
    /// Spends an outpoint another pooled transaction already spends.
    Conflict { outpoint: OutPoint, existing: Hash256 },
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MempoolError::Rejected(err) => write!(f, "{err}"),
            MempoolError::Coinbase => write!(f, "coinbase transactions are not relayed"),
            MempoolError::Conflict { existing, .. } => {
                write!(f, "conflicts with pooled transaction {}", hash256_to_hex(existing))
            }
        }
    }
}

impl std::error::Error for MempoolError {}

impl From<RuleError> for MempoolError {
    fn from(err: RuleError) -> Self {
        MempoolError::Rejected(err)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MempoolEntry {
    pub txid: Hash256,
    pub tx: Transaction,
    pub fee: Amount,
    pub size: usize,
    pub time: u64,
}

impl MempoolEntry {
    pub fn new(tx: Transaction, fee: Amount) -> Self {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        Self {
            txid: tx.txid(),
            size: tx.size(),
            tx,
            fee,
            time,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    AlreadyPresent,
    /// The pool is at capacity; the transaction was dropped.
    Full,
}

#[derive(Default)]
struct Pool {
    entries: HashMap<Hash256, MempoolEntry>,
    order: VecDeque<Hash256>,
    spenders: HashMap<OutPoint, Hash256>,
}

impl Pool {
    fn remove(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        for input in &entry.tx.inputs {
            if self.spenders.get(&input.prevout) == Some(txid) {
                self.spenders.remove(&input.prevout);
            }
        }
        Some(entry)
    }

    fn compact_order(&mut self) {
        let entries = &self.entries;
        self.order.retain(|txid| entries.contains_key(txid));
    }
}

pub struct Mempool {
    max_txs: usize,
    inner: Mutex<Pool>,
}

impl Mempool {
    pub fn new(max_txs: usize) -> Self {
        Self {
            max_txs: max_txs.max(1),
            inner: Mutex::new(Pool::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_txs
    }

    /// Inserts an already validated transaction. A full pool drops the
    /// transaction without error.
    pub fn add(&self, entry: MempoolEntry) -> Result<AddOutcome, MempoolError> {
        if entry.tx.is_coinbase() {
            return Err(MempoolError::Coinbase);
        }
        let mut pool = self.inner.lock();
        if pool.entries.contains_key(&entry.txid) {
            return Ok(AddOutcome::AlreadyPresent);
        }
        for input in &entry.tx.inputs {
            if let Some(existing) = pool.spenders.get(&input.prevout) {
                return Err(MempoolError::Conflict {
                    outpoint: input.prevout,
                    existing: *existing,
                });
            }
        }
        if pool.entries.len() >= self.max_txs {
            return Ok(AddOutcome::Full);
        }
        for input in &entry.tx.inputs {
            pool.spenders.insert(input.prevout, entry.txid);
        }
        pool.order.push_back(entry.txid);
        pool.entries.insert(entry.txid, entry);
        Ok(AddOutcome::Added)
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.inner.lock().entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<MempoolEntry> {
        self.inner.lock().entries.get(txid).cloned()
    }

    /// Snapshot copy in arrival order.
    pub fn get_all(&self) -> Vec<MempoolEntry> {
        let pool = self.inner.lock();
        pool.order
            .iter()
            .filter_map(|txid| pool.entries.get(txid).cloned())
            .collect()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        let pool = self.inner.lock();
        pool.order
            .iter()
            .filter(|txid| pool.entries.contains_key(*txid))
            .copied()
            .collect()
    }

    /// Returns how many entries were dropped.
    pub fn remove(&self, txids: &HashSet<Hash256>) -> usize {
        let mut pool = self.inner.lock();
        let removed = txids
            .iter()
            .filter(|txid| pool.remove(txid).is_some())
            .count();
        if removed > 0 {
            pool.compact_order();
        }
        removed
    }

    /// Drops transactions `block` confirms and any that spend an outpoint the
    /// block spends.
    pub fn remove_for_block(&self, block: &Block) -> usize {
        let mut pool = self.inner.lock();
        let mut removed = 0;
        for tx in &block.transactions {
            if pool.remove(&tx.txid()).is_some() {
                removed += 1;
            }
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                if let Some(spender) = pool.spenders.get(&input.prevout).copied() {
                    if pool.remove(&spender).is_some() {
                        removed += 1;
                    }
                }
            }
        }
        if removed > 0 {
            pool.compact_order();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
