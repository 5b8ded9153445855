//! Header index: per-block metadata keyed by hash, the main-chain height
//! index, and the persisted best-block pointer.

use powd_consensus::Hash256;
use powd_primitives::encoding::{Decoder, Encoder};
use powd_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use primitive_types::U256;

use powd_pow::HeaderInfo;

const META_BEST_BLOCK_KEY: &[u8] = b"best_block";

const STATUS_HAS_BLOCK: u8 = 1 << 0;
const STATUS_FAILED_VALIDATION: u8 = 1 << 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderEntry {
    pub prev_hash: Hash256,
    pub height: u64,
    pub time: u32,
    pub bits: u32,
    /// Cumulative work up to and including this block, big-endian.
    pub chainwork: [u8; 32],
    pub status: u8,
}

impl HeaderEntry {
    pub fn has_block(&self) -> bool {
        self.status & STATUS_HAS_BLOCK != 0
    }

    pub fn is_failed(&self) -> bool {
        self.status & STATUS_FAILED_VALIDATION != 0
    }

    pub fn chainwork_value(&self) -> U256 {
        U256::from_big_endian(&self.chainwork)
    }

    pub fn info(&self) -> HeaderInfo {
        HeaderInfo {
            height: self.height,
            time: i64::from(self.time),
            bits: self.bits,
        }
    }
}

pub fn status_with_block(status: u8) -> u8 {
    status | STATUS_HAS_BLOCK
}

pub fn status_with_failed(status: u8) -> u8 {
    status | STATUS_FAILED_VALIDATION
}

pub fn chainwork_bytes(work: U256) -> [u8; 32] {
    work.to_big_endian()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: Hash256,
    pub height: u64,
    pub chainwork: U256,
    pub time: u32,
    pub bits: u32,
}

pub struct ChainIndex<S> {
    store: S,
}

impl<S: KeyValueStore> ChainIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn get_header(&self, hash: &Hash256) -> Result<Option<HeaderEntry>, StoreError> {
        match self.store.get(Column::HeaderIndex, hash)? {
            Some(bytes) => decode_header_entry(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn put_header(&self, batch: &mut WriteBatch, hash: &Hash256, entry: &HeaderEntry) {
        batch.put(Column::HeaderIndex, *hash, encode_header_entry(entry));
    }

    pub fn set_best_block(&self, batch: &mut WriteBatch, hash: &Hash256) {
        batch.put(Column::Meta, META_BEST_BLOCK_KEY, *hash);
    }

    pub fn best_block_hash(&self) -> Result<Option<Hash256>, StoreError> {
        match self.store.get(Column::Meta, META_BEST_BLOCK_KEY)? {
            Some(bytes) => decode_hash(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn height_hash(&self, height: u64) -> Result<Option<Hash256>, StoreError> {
        match self.store.get(Column::HeightIndex, &height_key(height))? {
            Some(bytes) => decode_hash(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn set_height_hash(&self, batch: &mut WriteBatch, height: u64, hash: &Hash256) {
        batch.put(Column::HeightIndex, height_key(height), *hash);
    }

    pub fn clear_height_hash(&self, batch: &mut WriteBatch, height: u64) {
        batch.delete(Column::HeightIndex, height_key(height));
    }

    /// Whether `hash` is the main-chain block at its height.
    pub fn is_main_chain(&self, hash: &Hash256, height: u64) -> Result<bool, StoreError> {
        Ok(self.height_hash(height)?.as_ref() == Some(hash))
    }

    pub fn scan_headers(&self) -> Result<Vec<(Hash256, HeaderEntry)>, StoreError> {
        let entries = self.store.scan_prefix(Column::HeaderIndex, &[])?;
        entries
            .into_iter()
            .map(|(key, value)| Ok((decode_hash(&key)?, decode_header_entry(&value)?)))
            .collect()
    }
}

/// Big-endian so that a prefix scan walks heights in order.
pub fn height_key(height: u64) -> [u8; 8] {
    height.to_be_bytes()
}

fn encode_header_entry(entry: &HeaderEntry) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(32 + 8 + 4 + 4 + 32 + 1);
    encoder.write_hash_le(&entry.prev_hash);
    encoder.write_u64_le(entry.height);
    encoder.write_u32_le(entry.time);
    encoder.write_u32_le(entry.bits);
    encoder.write_bytes(&entry.chainwork);
    encoder.write_u8(entry.status);
    encoder.into_inner()
}

fn decode_header_entry(bytes: &[u8]) -> Result<HeaderEntry, StoreError> {
    let corrupt =
        |err: powd_primitives::DecodeError| StoreError::Corrupt(format!("header entry: {err}"));
    let mut decoder = Decoder::new(bytes);
    let entry = HeaderEntry {
        prev_hash: decoder.read_hash_le().map_err(corrupt)?,
        height: decoder.read_u64_le().map_err(corrupt)?,
        time: decoder.read_u32_le().map_err(corrupt)?,
        bits: decoder.read_u32_le().map_err(corrupt)?,
        chainwork: decoder.read_fixed::<32>().map_err(corrupt)?,
        status: decoder.read_u8().map_err(corrupt)?,
    };
    decoder.finish().map_err(corrupt)?;
    Ok(entry)
}

fn decode_hash(bytes: &[u8]) -> Result<Hash256, StoreError> {
    bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt("invalid hash length".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use powd_storage::memory::MemoryStore;

    #[test]
    fn header_entry_roundtrip_and_height_index() {
        let store = MemoryStore::new();
        let index = ChainIndex::new(&store);
        let hash = [9u8; 32];
        let entry = HeaderEntry {
            prev_hash: [8u8; 32],
            height: 300,
            time: 1_700_000_000,
            bits: 0x207f_ffff,
            chainwork: chainwork_bytes(U256::from(12_345u64)),
            status: status_with_block(0),
        };

        let mut batch = WriteBatch::new();
        index.put_header(&mut batch, &hash, &entry);
        index.set_height_hash(&mut batch, 300, &hash);
        index.set_best_block(&mut batch, &hash);
        store.write_batch(&batch).expect("commit");

        let loaded = index.get_header(&hash).expect("get").expect("present");
        assert_eq!(loaded, entry);
        assert!(loaded.has_block());
        assert!(!loaded.is_failed());
        assert_eq!(loaded.chainwork_value(), U256::from(12_345u64));
        assert!(index.is_main_chain(&hash, 300).expect("main"));
        assert_eq!(index.best_block_hash().expect("best"), Some(hash));

        let mut batch = WriteBatch::new();
        index.clear_height_hash(&mut batch, 300);
        store.write_batch(&batch).expect("commit");
        assert!(!index.is_main_chain(&hash, 300).expect("main"));
    }
}
