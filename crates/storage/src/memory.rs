use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

type ColumnMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-memory backend; one ordered map per column behind a single lock so a
/// batch is applied atomically with respect to readers.
pub struct MemoryStore {
    columns: RwLock<Vec<ColumnMap>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            columns: RwLock::new(vec![ColumnMap::new(); Column::ALL.len()]),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, column: Column) -> usize {
        self.columns.read()[column.index()].len()
    }

    pub fn is_empty(&self, column: Column) -> bool {
        self.len(column) == 0
    }

    /// Copy of one column, for before/after comparisons in tests.
    pub fn dump(&self, column: Column) -> ScanResult {
        self.columns.read()[column.index()]
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

fn prefix_range<'m>(
    map: &'m ColumnMap,
    prefix: &[u8],
) -> impl Iterator<Item = (&'m Vec<u8>, &'m Vec<u8>)> + 'm {
    let owned = prefix.to_vec();
    map.range::<Vec<u8>, _>((Bound::Included(owned.clone()), Bound::Unbounded))
        .take_while(move |(key, _)| key.starts_with(&owned))
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.columns.read()[column.index()].get(key).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.columns.write()[column.index()].insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.columns.write()[column.index()].remove(key);
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let guard = self.columns.read();
        Ok(prefix_range(&guard[column.index()], prefix)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let guard = self.columns.read();
        for (key, value) in prefix_range(&guard[column.index()], prefix) {
            visitor(key, value)?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.columns.write();
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard[column.index()]
                        .insert(key.as_slice().to_vec(), value.as_slice().to_vec());
                }
                WriteOp::Delete { column, key } => {
                    guard[column.index()].remove(key.as_slice());
                }
            }
        }
        Ok(())
    }
}
