//! Key-value storage collaborator: column families and atomic write batches.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub mod faulty;
pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Backend(String),
    /// A write was refused because the key already holds an immutable record.
    Duplicate(&'static str),
    Corrupt(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
            StoreError::Duplicate(what) => write!(f, "duplicate {what}"),
            StoreError::Corrupt(message) => write!(f, "corrupt record: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    Block,
    HeaderIndex,
    HeightIndex,
    Utxo,
    BlockUndo,
    Meta,
}

impl Column {
    pub const ALL: [Column; 6] = [
        Column::Block,
        Column::HeaderIndex,
        Column::HeightIndex,
        Column::Utxo,
        Column::BlockUndo,
        Column::Meta,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn bit(self) -> u32 {
        1 << self.index()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Column::Block => "block",
            Column::HeaderIndex => "header_index",
            Column::HeightIndex => "height_index",
            Column::Utxo => "utxo",
            Column::BlockUndo => "block_undo",
            Column::Meta => "meta",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteKey(SmallVec<[u8; 40]>);

impl WriteKey {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl AsRef<[u8]> for WriteKey {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for WriteKey {
    fn from(value: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(value))
    }
}

impl From<&[u8]> for WriteKey {
    fn from(value: &[u8]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

impl<const N: usize> From<[u8; N]> for WriteKey {
    fn from(value: [u8; N]) -> Self {
        Self(SmallVec::from_slice(&value))
    }
}

impl<const N: usize> From<&[u8; N]> for WriteKey {
    fn from(value: &[u8; N]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteValue(SmallVec<[u8; 64]>);

impl WriteValue {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl From<Vec<u8>> for WriteValue {
    fn from(value: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(value))
    }
}

impl From<&[u8]> for WriteValue {
    fn from(value: &[u8]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

impl<const N: usize> From<[u8; N]> for WriteValue {
    fn from(value: [u8; N]) -> Self {
        Self(SmallVec::from_slice(&value))
    }
}

impl<const N: usize> From<&[u8; N]> for WriteValue {
    fn from(value: &[u8; N]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        column: Column,
        key: WriteKey,
        value: WriteValue,
    },
    Delete {
        column: Column,
        key: WriteKey,
    },
}

impl WriteOp {
    pub fn column(&self) -> Column {
        match self {
            WriteOp::Put { column, .. } | WriteOp::Delete { column, .. } => *column,
        }
    }
}

/// Ordered set of writes applied all-or-nothing by `KeyValueStore::write_batch`.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, column: Column, key: impl Into<WriteKey>, value: impl Into<WriteValue>) {
        self.ops.push(WriteOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<WriteKey>) {
        self.ops.push(WriteOp::Delete {
            column,
            key: key.into(),
        });
    }

    pub fn append(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Bitmask of the columns this batch touches.
    pub fn touched(&self) -> u32 {
        self.ops.iter().fold(0, |mask, op| mask | op.column().bit())
    }
}

pub type ScanResult = Vec<(Vec<u8>, Vec<u8>)>;
pub type PrefixVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> Result<(), StoreError> + 'a;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError>;
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError>;
    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError>;
    /// Applies every op in `batch` or none of them.
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;
}

macro_rules! forward_store {
    ($ty:ty) => {
        impl<T: KeyValueStore + ?Sized> KeyValueStore for $ty {
            fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
                (**self).get(column, key)
            }

            fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
                (**self).put(column, key, value)
            }

            fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
                (**self).delete(column, key)
            }

            fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
                (**self).scan_prefix(column, prefix)
            }

            fn for_each_prefix<'a>(
                &self,
                column: Column,
                prefix: &[u8],
                visitor: &mut PrefixVisitor<'a>,
            ) -> Result<(), StoreError> {
                (**self).for_each_prefix(column, prefix, visitor)
            }

            fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
                (**self).write_batch(batch)
            }
        }
    };
}

forward_store!(Arc<T>);
forward_store!(&T);
