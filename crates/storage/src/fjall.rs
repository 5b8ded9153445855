//! Durable backend on fjall: one partition per column, batches committed
//! through a single keyspace batch.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fjall::{Batch, Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

const SLOW_COMMIT_THRESHOLD: Duration = Duration::from_millis(500);
const SLOW_COMMIT_LOG_INTERVAL_SECS: u64 = 30;

static LAST_SLOW_COMMIT_LOG_SECS: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Debug, Default)]
pub struct FjallOptions {
    pub cache_bytes: Option<u64>,
    pub journal_bytes: Option<u64>,
    /// Sync every commit to disk instead of leaving it in the OS buffer.
    pub sync_commits: bool,
}

pub struct FjallStore {
    keyspace: Keyspace,
    partitions: Vec<PartitionHandle>,
    persist: PersistMode,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_options(path, FjallOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: FjallOptions,
    ) -> Result<Self, StoreError> {
        let mut config = Config::new(path);
        if let Some(bytes) = options.cache_bytes {
            config = config.cache_size(bytes);
        }
        if let Some(bytes) = options.journal_bytes {
            config = config.max_journaling_size(bytes);
        }
        let keyspace = config.open().map_err(map_err)?;
        let partitions = Column::ALL
            .iter()
            .map(|column| {
                keyspace
                    .open_partition(column.as_str(), PartitionCreateOptions::default())
                    .map_err(map_err)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let persist = if options.sync_commits {
            PersistMode::SyncAll
        } else {
            PersistMode::Buffer
        };
        Ok(Self {
            keyspace,
            partitions,
            persist,
        })
    }

    fn partition(&self, column: Column) -> Result<&PartitionHandle, StoreError> {
        self.partitions
            .get(column.index())
            .ok_or_else(|| StoreError::Backend(format!("missing partition {}", column.as_str())))
    }

    fn note_slow_commit(&self, elapsed: Duration, ops: usize) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let last = LAST_SLOW_COMMIT_LOG_SECS.load(Ordering::Relaxed);
        if now.saturating_sub(last) >= SLOW_COMMIT_LOG_INTERVAL_SECS
            && LAST_SLOW_COMMIT_LOG_SECS
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            powd_log::log_warn!(
                "fjall batch commit took {}ms ({} ops, journals {})",
                elapsed.as_millis(),
                ops,
                self.keyspace.journal_count(),
            );
        }
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.partition(column)?.get(key).map_err(map_err)?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.partition(column)?.insert(key, value).map_err(map_err)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.partition(column)?.remove(key).map_err(map_err)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let mut results = Vec::new();
        self.for_each_prefix(column, prefix, &mut |key, value| {
            results.push((key.to_vec(), value.to_vec()));
            Ok(())
        })?;
        Ok(results)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        for entry in self.partition(column)?.prefix(prefix) {
            let (key, value) = entry.map_err(map_err)?;
            visitor(key.as_ref(), value.as_ref())?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut fjall_batch =
            Batch::with_capacity(self.keyspace.clone(), batch.len()).durability(Some(self.persist));
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    fjall_batch.insert(self.partition(*column)?, key.as_slice(), value.as_slice());
                }
                WriteOp::Delete { column, key } => {
                    fjall_batch.remove(self.partition(*column)?, key.as_slice());
                }
            }
        }
        let started = Instant::now();
        fjall_batch.commit().map_err(map_err)?;
        let elapsed = started.elapsed();
        if elapsed >= SLOW_COMMIT_THRESHOLD {
            self.note_slow_commit(elapsed, batch.len());
        }
        Ok(())
    }
}

fn map_err(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}
