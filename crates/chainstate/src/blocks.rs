//! Block/transaction store collaborator: full blocks by hash, main-chain
//! lookup by height, and the chain-state pointer.

use powd_consensus::Hash256;
use powd_primitives::block::Block;
use powd_primitives::encoding::{decode, encode};
use powd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::index::ChainIndex;
use crate::undo::BlockUndo;

pub struct BlockStore<S> {
    store: S,
}

impl<S: KeyValueStore> BlockStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn get(&self, hash: &Hash256) -> Result<Option<Block>, StoreError> {
        match self.store.get(Column::Block, hash)? {
            Some(bytes) => decode::<Block>(&bytes)
                .map(Some)
                .map_err(|err| StoreError::Corrupt(format!("block: {err}"))),
            None => Ok(None),
        }
    }

    pub fn contains(&self, hash: &Hash256) -> Result<bool, StoreError> {
        Ok(self.store.get(Column::Block, hash)?.is_some())
    }

    /// Stores `block` immediately; a block is written at most once.
    pub fn put(&self, block: &Block) -> Result<Hash256, StoreError> {
        let mut batch = WriteBatch::new();
        let hash = self.stage_put(&mut batch, block)?;
        self.store.write_batch(&batch)?;
        Ok(hash)
    }

    /// Adds `block` to `batch`, refusing a hash that is already stored.
    pub fn stage_put(&self, batch: &mut WriteBatch, block: &Block) -> Result<Hash256, StoreError> {
        let hash = block.hash();
        if self.contains(&hash)? {
            return Err(StoreError::Duplicate("block"));
        }
        batch.put(Column::Block, hash, encode(block));
        Ok(hash)
    }

    pub fn get_by_height(&self, height: u64) -> Result<Option<Block>, StoreError> {
        let index = ChainIndex::new(&self.store);
        match index.height_hash(height)? {
            Some(hash) => self.get(&hash),
            None => Ok(None),
        }
    }

    /// Moves the best-block pointer and height index together.
    pub fn update_chain_state(&self, best_hash: &Hash256, height: u64) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        let index = ChainIndex::new(&self.store);
        index.set_height_hash(&mut batch, height, best_hash);
        index.set_best_block(&mut batch, best_hash);
        self.store.write_batch(&batch)
    }

    pub fn undo(&self, hash: &Hash256) -> Result<Option<BlockUndo>, StoreError> {
        match self.store.get(Column::BlockUndo, hash)? {
            Some(bytes) => BlockUndo::decode(&bytes)
                .map(Some)
                .map_err(|err| StoreError::Corrupt(format!("block undo: {err}"))),
            None => Ok(None),
        }
    }

    pub fn stage_undo(&self, batch: &mut WriteBatch, hash: &Hash256, undo: &BlockUndo) {
        batch.put(Column::BlockUndo, *hash, undo.encode());
    }

    pub fn stage_drop_undo(&self, batch: &mut WriteBatch, hash: &Hash256) {
        batch.delete(Column::BlockUndo, *hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use powd_primitives::block::BlockHeader;
    use powd_primitives::transaction::Transaction;
    use powd_storage::memory::MemoryStore;

    fn block(height: u64) -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                prev_block: [0u8; 32],
                merkle_root: [0u8; 32],
                time: 1,
                bits: 0x207f_ffff,
                nonce: height,
                height,
            },
            transactions: vec![Transaction::coinbase(height as u32, 1, [0u8; 20], "POW")],
        }
    }

    #[test]
    fn duplicate_put_is_rejected() {
        let store = MemoryStore::new();
        let blocks = BlockStore::new(&store);
        let hash = blocks.put(&block(1)).expect("first put");
        assert_eq!(blocks.put(&block(1)), Err(StoreError::Duplicate("block")));
        assert_eq!(blocks.get(&hash).expect("get"), Some(block(1)));
    }

    #[test]
    fn get_by_height_follows_chain_state() {
        let store = MemoryStore::new();
        let blocks = BlockStore::new(&store);
        let hash = blocks.put(&block(4)).expect("put");
        assert_eq!(blocks.get_by_height(4).expect("lookup"), None);
        blocks.update_chain_state(&hash, 4).expect("update");
        assert_eq!(blocks.get_by_height(4).expect("lookup"), Some(block(4)));
        assert_eq!(
            ChainIndex::new(&store).best_block_hash().expect("best"),
            Some(hash)
        );
    }
}
