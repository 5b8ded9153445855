//! Block and transaction validation.
//!
//! Block checks run in a fixed order and stop at the first failure:
//! header integrity, proof of work, timestamp window, size limits and
//! merkle commitment, coinbase reward, then every other transaction against
//! the UTXO view with outputs spent earlier in the same block excluded.

use std::collections::HashSet;

use powd_consensus::constants::{MAX_COIN_TAG_LEN, MIN_BLOCK_VERSION, MIN_TX_VERSION};
use powd_consensus::{block_reward, min_fee, money_range, Amount, ConsensusParams, Hash256};
use powd_pow::validation::{validate_pow_header, PowError};
use powd_primitives::block::Block;
use powd_primitives::crypto::Verifier;
use powd_primitives::hash::hash160;
use powd_primitives::outpoint::OutPoint;
use powd_primitives::transaction::Transaction;
use powd_storage::StoreError;
use rayon::prelude::*;

use crate::undo::{BlockUndo, SpentOutput};
use crate::utxo::{UtxoEntry, UtxoOverlay, UtxoView};

/// Malformed or rule-violating data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    HashMismatch,
    HeightMismatch { expected: u64, found: u64 },
    BadVersion,
    TimeTooNew,
    TimeTooOld,
    NoTransactions,
    BlockTooLarge { size: usize, max: usize },
    TooManyTransactions { count: usize, max: usize },
    MerkleMismatch,
    MerkleMutated,
    DuplicateTransaction,
    BadCoinbase(&'static str),
    InvalidTransaction(&'static str),
    TxTooLarge { size: usize, max: usize },
    DuplicateInput,
    NonFinal,
    MissingInput(OutPoint),
    DoubleSpend(OutPoint),
    ImmatureCoinbase,
    OwnerMismatch(usize),
    BadSignature(usize),
    MixedCoins,
    InvalidCoinTag,
    ValueOutOfRange,
    InputsBelowOutputs,
    FeeTooLow { fee: Amount, required: Amount },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::HashMismatch => write!(f, "header hash does not match"),
            ValidationError::HeightMismatch { expected, found } => {
                write!(f, "block height {found} does not follow parent (expected {expected})")
            }
            ValidationError::BadVersion => write!(f, "version too low"),
            ValidationError::TimeTooNew => write!(f, "block timestamp too far in the future"),
            ValidationError::TimeTooOld => write!(f, "block timestamp too far in the past"),
            ValidationError::NoTransactions => write!(f, "block has no transactions"),
            ValidationError::BlockTooLarge { size, max } => {
                write!(f, "block size {size} exceeds {max}")
            }
            ValidationError::TooManyTransactions { count, max } => {
                write!(f, "block has {count} transactions, limit {max}")
            }
            ValidationError::MerkleMismatch => write!(f, "merkle root mismatch"),
            ValidationError::MerkleMutated => write!(f, "merkle tree is mutated"),
            ValidationError::DuplicateTransaction => write!(f, "duplicate transaction"),
            ValidationError::BadCoinbase(message) => write!(f, "bad coinbase: {message}"),
            ValidationError::InvalidTransaction(message) => write!(f, "{message}"),
            ValidationError::TxTooLarge { size, max } => {
                write!(f, "transaction size {size} exceeds {max}")
            }
            ValidationError::DuplicateInput => write!(f, "duplicate input"),
            ValidationError::NonFinal => write!(f, "transaction is not final"),
            ValidationError::MissingInput(outpoint) => {
                write!(f, "missing input {}:{}", short_hash(&outpoint.hash), outpoint.index)
            }
            ValidationError::DoubleSpend(outpoint) => write!(
                f,
                "input {}:{} already spent in this block",
                short_hash(&outpoint.hash),
                outpoint.index
            ),
            ValidationError::ImmatureCoinbase => write!(f, "spends immature coinbase"),
            ValidationError::OwnerMismatch(index) => {
                write!(f, "input {index} key does not match output owner")
            }
            ValidationError::BadSignature(index) => write!(f, "input {index} signature invalid"),
            ValidationError::MixedCoins => write!(f, "transaction mixes coin types"),
            ValidationError::InvalidCoinTag => write!(f, "invalid coin tag"),
            ValidationError::ValueOutOfRange => write!(f, "value out of range"),
            ValidationError::InputsBelowOutputs => write!(f, "outputs exceed inputs"),
            ValidationError::FeeTooLow { fee, required } => {
                write!(f, "fee {fee} below minimum {required}")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Proof-of-work or reward rules not met.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    Pow(PowError),
    RewardMismatch { expected: Amount, found: Amount },
}

impl std::fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsensusError::Pow(err) => write!(f, "{err}"),
            ConsensusError::RewardMismatch { expected, found } => {
                write!(f, "coinbase pays {found}, reward is {expected}")
            }
        }
    }
}

impl std::error::Error for ConsensusError {}

/// Any reason a block or transaction was not accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    Validation(ValidationError),
    Consensus(ConsensusError),
    Store(StoreError),
}

impl std::fmt::Display for RuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleError::Validation(err) => write!(f, "{err}"),
            RuleError::Consensus(err) => write!(f, "{err}"),
            RuleError::Store(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for RuleError {}

impl From<ValidationError> for RuleError {
    fn from(err: ValidationError) -> Self {
        RuleError::Validation(err)
    }
}

impl From<ConsensusError> for RuleError {
    fn from(err: ConsensusError) -> Self {
        RuleError::Consensus(err)
    }
}

impl From<PowError> for RuleError {
    fn from(err: PowError) -> Self {
        RuleError::Consensus(ConsensusError::Pow(err))
    }
}

impl From<StoreError> for RuleError {
    fn from(err: StoreError) -> Self {
        RuleError::Store(err)
    }
}

/// Where a block sits and how it arrived.
#[derive(Clone, Copy, Debug)]
pub struct BlockContext<'p> {
    pub params: &'p ConsensusParams,
    pub height: u64,
    pub expected_bits: u32,
    pub now: i64,
    /// Freshly mined or announced; applies the `now - skew` lower bound.
    pub live: bool,
    pub parent_time: Option<i64>,
}

#[derive(Clone, Debug, Default)]
pub struct BlockSummary {
    pub hash: Hash256,
    pub txids: Vec<Hash256>,
    pub fees: Amount,
    pub undo: BlockUndo,
}

/// Full block check against `view`; leaves no trace.
pub fn validate_block<V: UtxoView + ?Sized>(
    block: &Block,
    claimed_hash: &Hash256,
    ctx: &BlockContext<'_>,
    view: &V,
    verifier: &dyn Verifier,
) -> Result<BlockSummary, RuleError> {
    let mut overlay = UtxoOverlay::new(view);
    apply_block(block, claimed_hash, ctx, &mut overlay, verifier)
}

/// Validates `block` and applies its spends and outputs to `overlay`. On
/// error the overlay holds partial changes and must be discarded.
pub fn apply_block<V: UtxoView + ?Sized>(
    block: &Block,
    claimed_hash: &Hash256,
    ctx: &BlockContext<'_>,
    overlay: &mut UtxoOverlay<'_, V>,
    verifier: &dyn Verifier,
) -> Result<BlockSummary, RuleError> {
    let params = ctx.params;
    let header = &block.header;

    // 1. integrity
    let hash = header.hash();
    if hash != *claimed_hash {
        return Err(ValidationError::HashMismatch.into());
    }
    if header.height != ctx.height {
        return Err(ValidationError::HeightMismatch {
            expected: ctx.height,
            found: header.height,
        }
        .into());
    }
    if header.version < MIN_BLOCK_VERSION {
        return Err(ValidationError::BadVersion.into());
    }

    // 2. proof of work
    validate_pow_header(header, ctx.expected_bits, params)?;

    // 3. timestamp window
    let time = i64::from(header.time);
    let skew = params.max_future_skew_secs;
    if time > ctx.now.saturating_add(skew) {
        return Err(ValidationError::TimeTooNew.into());
    }
    if ctx.live && time < ctx.now.saturating_sub(skew) {
        return Err(ValidationError::TimeTooOld.into());
    }
    if let Some(parent_time) = ctx.parent_time {
        if time < parent_time.saturating_sub(skew) {
            return Err(ValidationError::TimeTooOld.into());
        }
    }

    // 4. size, count, merkle commitment
    if block.transactions.is_empty() {
        return Err(ValidationError::NoTransactions.into());
    }
    let max_txs = params.max_tx_per_block as usize;
    if block.transactions.len() > max_txs {
        return Err(ValidationError::TooManyTransactions {
            count: block.transactions.len(),
            max: max_txs,
        }
        .into());
    }
    let size = block.size();
    let max_size = params.max_block_size as usize;
    if size > max_size {
        return Err(ValidationError::BlockTooLarge {
            size,
            max: max_size,
        }
        .into());
    }
    let txids = block.txids();
    let (root, mutated) = powd_primitives::merkle_root(&txids);
    if mutated {
        return Err(ValidationError::MerkleMutated.into());
    }
    if root != header.merkle_root {
        return Err(ValidationError::MerkleMismatch.into());
    }
    let mut seen = HashSet::with_capacity(txids.len());
    if !txids.iter().all(|txid| seen.insert(*txid)) {
        return Err(ValidationError::DuplicateTransaction.into());
    }

    // 5. coinbase
    let height = u32::try_from(ctx.height).map_err(|_| ValidationError::ValueOutOfRange)?;
    check_coinbase(&block.transactions[0], height, params)?;
    overlay.add_outputs(&block.transactions[0], &txids[0], height);

    // 6. remaining transactions, signatures checked up front in parallel
    let bad_signatures: Vec<Option<usize>> = block.transactions[1..]
        .par_iter()
        .map(|tx| first_bad_signature(tx, verifier))
        .collect();

    let mut spent_in_block: HashSet<OutPoint> = HashSet::new();
    let mut undo = BlockUndo::default();
    let mut fees: Amount = 0;
    for (offset, tx) in block.transactions[1..].iter().enumerate() {
        if tx.is_coinbase() {
            return Err(ValidationError::BadCoinbase("coinbase after first position").into());
        }
        let (fee, inputs) = check_transaction(
            tx,
            height,
            params,
            &*overlay,
            Some(&spent_in_block),
            bad_signatures[offset],
        )?;
        for (input, entry) in tx.inputs.iter().zip(inputs) {
            overlay.remove(&input.prevout);
            spent_in_block.insert(input.prevout);
            undo.spent.push(SpentOutput {
                outpoint: input.prevout,
                entry,
            });
        }
        overlay.add_outputs(tx, &txids[offset + 1], height);
        fees = fees
            .checked_add(fee)
            .filter(|sum| money_range(*sum))
            .ok_or(ValidationError::ValueOutOfRange)?;
    }

    Ok(BlockSummary {
        hash,
        txids,
        fees,
        undo,
    })
}

/// Checks a standalone transaction for inclusion in the block at `height`.
/// Returns the fee it pays.
pub fn validate_transaction<V: UtxoView + ?Sized>(
    tx: &Transaction,
    height: u64,
    params: &ConsensusParams,
    view: &V,
    verifier: &dyn Verifier,
) -> Result<Amount, RuleError> {
    let height = u32::try_from(height).map_err(|_| ValidationError::ValueOutOfRange)?;
    let bad_signature = if tx.is_coinbase() {
        None
    } else {
        first_bad_signature(tx, verifier)
    };
    let (fee, _) = check_transaction(tx, height, params, view, None, bad_signature)?;
    Ok(fee)
}

fn check_coinbase(
    tx: &Transaction,
    height: u32,
    params: &ConsensusParams,
) -> Result<(), RuleError> {
    if !tx.is_coinbase() {
        return Err(ValidationError::BadCoinbase("first transaction is not a coinbase").into());
    }
    if tx.version < MIN_TX_VERSION {
        return Err(ValidationError::BadVersion.into());
    }
    if tx.outputs.is_empty() {
        return Err(ValidationError::BadCoinbase("no outputs").into());
    }
    if tx.lock_height != height {
        return Err(ValidationError::BadCoinbase("height does not match block").into());
    }
    check_outputs(tx)?;
    let found = tx.value_out().ok_or(ValidationError::ValueOutOfRange)?;
    let expected = block_reward(u64::from(height), params);
    if found != expected {
        return Err(ConsensusError::RewardMismatch { expected, found }.into());
    }
    Ok(())
}

fn check_outputs(tx: &Transaction) -> Result<(), ValidationError> {
    for output in &tx.outputs {
        if !money_range(output.value) {
            return Err(ValidationError::ValueOutOfRange);
        }
        if !valid_coin_tag(&output.coin) {
            return Err(ValidationError::InvalidCoinTag);
        }
    }
    if tx.outputs.iter().any(|out| out.coin != tx.outputs[0].coin) {
        return Err(ValidationError::MixedCoins);
    }
    tx.value_out().ok_or(ValidationError::ValueOutOfRange)?;
    Ok(())
}

pub fn valid_coin_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= MAX_COIN_TAG_LEN
        && tag
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

fn first_bad_signature(tx: &Transaction, verifier: &dyn Verifier) -> Option<usize> {
    let digest = tx.signing_digest();
    tx.inputs
        .iter()
        .position(|input| !verifier.verify(&digest, &input.signature, &input.pubkey))
}

/// Shared by the block and standalone paths. Returns the fee and the entries
/// each input spends, in input order.
fn check_transaction<V: UtxoView + ?Sized>(
    tx: &Transaction,
    height: u32,
    params: &ConsensusParams,
    view: &V,
    spent_in_block: Option<&HashSet<OutPoint>>,
    bad_signature: Option<usize>,
) -> Result<(Amount, Vec<UtxoEntry>), RuleError> {
    if tx.version < MIN_TX_VERSION {
        return Err(ValidationError::BadVersion.into());
    }
    if tx.inputs.is_empty() {
        return Err(ValidationError::InvalidTransaction("transaction has no inputs").into());
    }
    if tx.outputs.is_empty() {
        return Err(ValidationError::InvalidTransaction("transaction has no outputs").into());
    }
    let size = tx.size();
    let max_size = params.max_tx_size as usize;
    if size > max_size {
        return Err(ValidationError::TxTooLarge {
            size,
            max: max_size,
        }
        .into());
    }
    check_outputs(tx)?;
    let mut prevouts = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if input.prevout.is_null() {
            return Err(ValidationError::InvalidTransaction("null prevout").into());
        }
        if !prevouts.insert(input.prevout) {
            return Err(ValidationError::DuplicateInput.into());
        }
    }
    if tx.lock_height > height {
        return Err(ValidationError::NonFinal.into());
    }

    let coin = &tx.outputs[0].coin;
    let mut entries = Vec::with_capacity(tx.inputs.len());
    let mut value_in: Amount = 0;
    for (index, input) in tx.inputs.iter().enumerate() {
        let Some(entry) = view.utxo(&input.prevout)? else {
            let spent_here = spent_in_block.is_some_and(|spent| spent.contains(&input.prevout));
            return Err(if spent_here {
                ValidationError::DoubleSpend(input.prevout)
            } else {
                ValidationError::MissingInput(input.prevout)
            }
            .into());
        };
        if entry.is_coinbase && height.saturating_sub(entry.height) < params.coinbase_maturity {
            return Err(ValidationError::ImmatureCoinbase.into());
        }
        if hash160(&input.pubkey) != entry.owner {
            return Err(ValidationError::OwnerMismatch(index).into());
        }
        if &entry.coin != coin {
            return Err(ValidationError::MixedCoins.into());
        }
        value_in = value_in
            .checked_add(entry.value)
            .filter(|sum| money_range(*sum))
            .ok_or(ValidationError::ValueOutOfRange)?;
        entries.push(entry);
    }
    if let Some(index) = bad_signature {
        return Err(ValidationError::BadSignature(index).into());
    }

    let value_out = tx.value_out().ok_or(ValidationError::ValueOutOfRange)?;
    let fee = value_in - value_out;
    if fee < 0 {
        return Err(ValidationError::InputsBelowOutputs.into());
    }
    let required = min_fee(size, params);
    if fee < required {
        return Err(ValidationError::FeeTooLow { fee, required }.into());
    }
    Ok((fee, entries))
}

fn short_hash(hash: &Hash256) -> String {
    hash.iter()
        .rev()
        .take(6)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use powd_consensus::params::{consensus_params, Network};
    use powd_primitives::crypto::{sign_inputs, EcdsaVerifier, KeySigner, Signer};
    use powd_primitives::transaction::{TxIn, TxOut};
    use powd_storage::memory::MemoryStore;
    use powd_storage::{KeyValueStore, WriteBatch};

    use crate::utxo::UtxoSet;

    fn funded(
        store: &MemoryStore,
        signer: &KeySigner,
        value: Amount,
        coinbase_height: Option<u32>,
    ) -> OutPoint {
        let outpoint = OutPoint::new([0x33; 32], 0);
        let set = UtxoSet::new(store);
        let mut batch = WriteBatch::new();
        set.create(
            &mut batch,
            &outpoint,
            &UtxoEntry {
                value,
                owner: signer.owner(),
                coin: "POW".to_string(),
                height: coinbase_height.unwrap_or(1),
                is_coinbase: coinbase_height.is_some(),
            },
        );
        store.write_batch(&batch).expect("seed");
        outpoint
    }

    fn spend(outpoint: OutPoint, value: Amount, signer: &KeySigner) -> Transaction {
        let mut tx = Transaction {
            version: 1,
            inputs: vec![TxIn::unsigned(outpoint)],
            outputs: vec![TxOut {
                value,
                owner: [7u8; 20],
                coin: "POW".to_string(),
            }],
            lock_height: 0,
        };
        sign_inputs(&mut tx, &[0], signer).expect("sign");
        tx
    }

    fn signer() -> KeySigner {
        KeySigner::from_secret_bytes(&[0x42; 32]).expect("key")
    }

    #[test]
    fn accepts_signed_spend_and_reports_fee() {
        let params = consensus_params(Network::Regtest);
        let store = MemoryStore::new();
        let signer = signer();
        let outpoint = funded(&store, &signer, 10_000, None);
        let tx = spend(outpoint, 9_000, &signer);
        let set = UtxoSet::new(&store);
        let fee = validate_transaction(&tx, 5, &params, &set, &EcdsaVerifier).expect("valid");
        assert_eq!(fee, 1_000);
    }

    #[test]
    fn fee_below_minimum_is_rejected() {
        let params = consensus_params(Network::Regtest);
        let store = MemoryStore::new();
        let signer = signer();
        let outpoint = funded(&store, &signer, 10_000, None);
        let tx = spend(outpoint, 9_999, &signer);
        let set = UtxoSet::new(&store);
        let err = validate_transaction(&tx, 5, &params, &set, &EcdsaVerifier).expect_err("low fee");
        assert!(matches!(
            err,
            RuleError::Validation(ValidationError::FeeTooLow { fee: 1, .. })
        ));
    }

    #[test]
    fn tampered_output_breaks_signature() {
        let params = consensus_params(Network::Regtest);
        let store = MemoryStore::new();
        let signer = signer();
        let outpoint = funded(&store, &signer, 10_000, None);
        let mut tx = spend(outpoint, 9_000, &signer);
        tx.outputs[0].value = 8_000;
        let set = UtxoSet::new(&store);
        let err = validate_transaction(&tx, 5, &params, &set, &EcdsaVerifier).expect_err("bad sig");
        assert_eq!(err, RuleError::Validation(ValidationError::BadSignature(0)));
    }

    #[test]
    fn wrong_key_does_not_match_owner() {
        let params = consensus_params(Network::Regtest);
        let store = MemoryStore::new();
        let owner = signer();
        let thief = KeySigner::from_secret_bytes(&[0x43; 32]).expect("key");
        let outpoint = funded(&store, &owner, 10_000, None);
        let tx = spend(outpoint, 9_000, &thief);
        let set = UtxoSet::new(&store);
        let err = validate_transaction(&tx, 5, &params, &set, &EcdsaVerifier).expect_err("owner");
        assert_eq!(err, RuleError::Validation(ValidationError::OwnerMismatch(0)));
    }

    #[test]
    fn coinbase_maturity_and_finality() {
        let params = consensus_params(Network::Regtest);
        let store = MemoryStore::new();
        let signer = signer();
        let outpoint = funded(&store, &signer, 10_000, Some(3));
        let set = UtxoSet::new(&store);
        let tx = spend(outpoint, 9_000, &signer);
        let immature = 3 + u64::from(params.coinbase_maturity) - 1;
        assert_eq!(
            validate_transaction(&tx, immature, &params, &set, &EcdsaVerifier),
            Err(RuleError::Validation(ValidationError::ImmatureCoinbase))
        );
        assert!(validate_transaction(&tx, immature + 1, &params, &set, &EcdsaVerifier).is_ok());

        let mut locked = spend(outpoint, 9_000, &signer);
        locked.lock_height = 500;
        sign_inputs(&mut locked, &[0], &signer).expect("sign");
        assert_eq!(
            validate_transaction(&locked, 100, &params, &set, &EcdsaVerifier),
            Err(RuleError::Validation(ValidationError::NonFinal))
        );
    }

    #[test]
    fn missing_input_and_empty_transaction() {
        let params = consensus_params(Network::Regtest);
        let store = MemoryStore::new();
        let set = UtxoSet::new(&store);
        let signer = signer();
        let tx = spend(OutPoint::new([1u8; 32], 4), 10, &signer);
        assert!(matches!(
            validate_transaction(&tx, 5, &params, &set, &EcdsaVerifier),
            Err(RuleError::Validation(ValidationError::MissingInput(_)))
        ));

        let mut empty = tx.clone();
        empty.outputs.clear();
        assert!(matches!(
            validate_transaction(&empty, 5, &params, &set, &EcdsaVerifier),
            Err(RuleError::Validation(ValidationError::InvalidTransaction(_)))
        ));

        let mut zero_version = tx;
        zero_version.version = 0;
        assert_eq!(
            validate_transaction(&zero_version, 5, &params, &set, &EcdsaVerifier),
            Err(RuleError::Validation(ValidationError::BadVersion))
        );
    }

    #[test]
    fn coin_tags() {
        assert!(valid_coin_tag("POW"));
        assert!(valid_coin_tag("X1"));
        assert!(!valid_coin_tag(""));
        assert!(!valid_coin_tag("pow"));
        assert!(!valid_coin_tag("WAYTOOLONG"));
    }
}
