//! Candidate block assembly from the mempool.

use std::collections::HashSet;

use powd_chainstate::validation::{validate_transaction, RuleError};
use powd_chainstate::utxo::{UtxoOverlay, UtxoView};
use powd_chainstate::ChainTip;
use powd_consensus::{block_reward, Amount, ConsensusParams};
use powd_primitives::block::{Block, BlockHeader};
use powd_primitives::crypto::Verifier;
use powd_primitives::outpoint::OutPoint;
use powd_primitives::transaction::{OwnerHash, Transaction};

use crate::mempool::MempoolEntry;

/// Serialized size of a block with no transactions plus the varint count.
const BLOCK_OVERHEAD: usize = powd_primitives::block::HEADER_SIZE + 5;

#[derive(Clone, Debug)]
pub struct BlockTemplate {
    pub block: Block,
    pub fees: Amount,
    /// Pool entries left out of the block.
    pub skipped: usize,
}

pub struct TemplateRequest<'a> {
    pub tip: &'a ChainTip,
    pub bits: u32,
    pub now: i64,
    pub owner: OwnerHash,
    pub coin: &'a str,
}

/// Builds the next block on `request.tip`. Pool entries are taken in arrival
/// order; an entry that conflicts with an earlier pick, no longer validates,
/// or would break a size or count cap is skipped.
pub fn assemble_block<V: UtxoView + ?Sized>(
    request: &TemplateRequest<'_>,
    pool: &[MempoolEntry],
    view: &V,
    params: &ConsensusParams,
    verifier: &dyn Verifier,
) -> BlockTemplate {
    let height = request.tip.height + 1;
    let coinbase = Transaction::coinbase(
        height as u32,
        block_reward(height, params),
        request.owner,
        request.coin,
    );
    let mut size = BLOCK_OVERHEAD + coinbase.size();
    let mut transactions = vec![coinbase];
    let mut overlay = UtxoOverlay::new(view);
    let mut spent: HashSet<OutPoint> = HashSet::new();
    let mut fees: Amount = 0;
    let mut skipped = 0;

    for entry in pool {
        if transactions.len() >= params.max_tx_per_block as usize {
            skipped += 1;
            continue;
        }
        if size + entry.size > params.max_block_size as usize {
            skipped += 1;
            continue;
        }
        if entry
            .tx
            .inputs
            .iter()
            .any(|input| spent.contains(&input.prevout))
        {
            skipped += 1;
            continue;
        }
        let fee = match validate_transaction(&entry.tx, height, params, &overlay, verifier) {
            Ok(fee) => fee,
            Err(RuleError::Store(err)) => {
                log_warn!("Template skipped a transaction on store error: {err}");
                skipped += 1;
                continue;
            }
            Err(_) => {
                skipped += 1;
                continue;
            }
        };
        for input in &entry.tx.inputs {
            overlay.remove(&input.prevout);
            spent.insert(input.prevout);
        }
        overlay.add_outputs(&entry.tx, &entry.txid, height as u32);
        size += entry.size;
        fees += fee;
        transactions.push(entry.tx.clone());
    }

    let time = request.now.max(i64::from(request.tip.time)).clamp(0, i64::from(u32::MAX)) as u32;
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: request.tip.hash,
            merkle_root: [0u8; 32],
            time,
            bits: request.bits,
            nonce: 0,
            height,
        },
        transactions,
    };
    block.header.merkle_root = block.compute_merkle_root().0;
    BlockTemplate {
        block,
        fees,
        skipped,
    }
}
