//! Block header and block types.

use powd_consensus::Hash256;

use crate::encoding::{encode, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::merkle::merkle_root;
use crate::transaction::Transaction;

pub const CURRENT_BLOCK_VERSION: u32 = 1;

/// Serialized header length in bytes.
pub const HEADER_SIZE: usize = 4 + 32 + 32 + 4 + 4 + 8 + 8;

/// Upper bound on transactions accepted while decoding a block.
pub const MAX_DECODE_TXS: usize = 100_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u64,
    pub height: u64,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        sha256d(&encode(self))
    }

    /// Header hash with a different nonce; the miner's inner loop.
    pub fn hash_with_nonce(&self, nonce: u64) -> Hash256 {
        let mut bytes = encode(self);
        let offset = HEADER_SIZE - 16;
        bytes[offset..offset + 8].copy_from_slice(&nonce.to_le_bytes());
        sha256d(&bytes)
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u64_le(self.nonce);
        encoder.write_u64_le(self.height);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_u32_le()?,
            prev_block: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u64_le()?,
            height: decoder.read_u64_le()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::txid).collect()
    }

    /// Merkle root of the current transaction list and its mutation flag.
    pub fn compute_merkle_root(&self) -> (Hash256, bool) {
        merkle_root(&self.txids())
    }

    pub fn size(&self) -> usize {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        self.consensus_encode(&mut encoder);
        encoder.len()
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.header.consensus_encode(encoder);
        encoder.write_list(&self.transactions);
    }
}

impl Decodable for Block {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode(decoder)?;
        let transactions = decoder.read_list(MAX_DECODE_TXS)?;
        Ok(Self {
            header,
            transactions,
        })
    }
}
