//! Store wrapper that fails writes on demand.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch};

/// Delegates to `inner` until armed, then rejects every write without
/// touching `inner`. Reads always pass through.
pub struct FaultyStore<S> {
    inner: S,
    fail_writes: AtomicBool,
    fail_after: AtomicU64,
    batches: AtomicU64,
}

impl<S: KeyValueStore> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            fail_after: AtomicU64::new(u64::MAX),
            batches: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Lets `count` more batches through, then fails the rest.
    pub fn fail_after_batches(&self, count: u64) {
        let seen = self.batches.load(Ordering::SeqCst);
        self.fail_after
            .store(seen.saturating_add(count), Ordering::SeqCst);
    }

    pub fn batches_committed(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst)
            || self.batches.load(Ordering::SeqCst) >= self.fail_after.load(Ordering::SeqCst)
        {
            return Err(StoreError::Backend("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl<S: KeyValueStore> KeyValueStore for FaultyStore<S> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.inner.scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        self.inner.for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.check()?;
        self.inner.write_batch(batch)?;
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[test]
    fn armed_store_leaves_inner_untouched() {
        let store = FaultyStore::new(MemoryStore::new());
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"k", b"v");

        store.fail_after_batches(1);
        store.write_batch(&batch).expect("first batch");
        assert!(store.write_batch(&batch).is_err());
        assert_eq!(store.batches_committed(), 1);

        store.set_fail_writes(true);
        assert!(store.put(Column::Meta, b"x", b"y").is_err());
        assert_eq!(store.inner().get(Column::Meta, b"x").expect("get"), None);
    }
}
