//! UTXO set backed by the storage trait, plus an in-memory overlay used to
//! stage a block (or a whole reorganization) before it is committed.

use std::collections::HashMap;

use powd_consensus::{Amount, Hash256};
use powd_primitives::encoding::{DecodeError, Decoder, Encoder};
use powd_primitives::outpoint::OutPoint;
use powd_primitives::transaction::{OwnerHash, Transaction};
use powd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

pub const OUTPOINT_KEY_LEN: usize = 36;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UtxoEntry {
    pub value: Amount,
    pub owner: OwnerHash,
    pub coin: String,
    pub height: u32,
    pub is_coinbase: bool,
}

impl UtxoEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(8 + 20 + 1 + self.coin.len() + 5);
        encoder.write_i64_le(self.value);
        encoder.write_bytes(&self.owner);
        encoder.write_var_str(&self.coin);
        encoder.write_u32_le(self.height);
        encoder.write_bool(self.is_coinbase);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let entry = Self::decode_from(&mut decoder)?;
        decoder.finish()?;
        Ok(entry)
    }

    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            value: decoder.read_i64_le()?,
            owner: decoder.read_fixed::<20>()?,
            coin: decoder.read_var_str()?,
            height: decoder.read_u32_le()?,
            is_coinbase: decoder.read_bool()?,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct OutPointKey([u8; OUTPOINT_KEY_LEN]);

impl OutPointKey {
    pub fn new(outpoint: &OutPoint) -> Self {
        let mut bytes = [0u8; OUTPOINT_KEY_LEN];
        bytes[..32].copy_from_slice(&outpoint.hash);
        bytes[32..].copy_from_slice(&outpoint.index.to_le_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Read access to unspent outputs.
pub trait UtxoView {
    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError>;
}

/// The storage collaborator's UTXO column. Writes only go into a batch so
/// that every change for a block commits together.
pub struct UtxoSet<S> {
    store: S,
}

impl<S> UtxoSet<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> UtxoSet<S> {
    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError> {
        let key = OutPointKey::new(outpoint);
        match self.store.get(Column::Utxo, key.as_bytes())? {
            Some(bytes) => UtxoEntry::decode(&bytes)
                .map(Some)
                .map_err(|err| StoreError::Corrupt(format!("utxo entry: {err}"))),
            None => Ok(None),
        }
    }

    pub fn create(&self, batch: &mut WriteBatch, outpoint: &OutPoint, entry: &UtxoEntry) {
        batch.put(Column::Utxo, OutPointKey::new(outpoint).0, entry.encode());
    }

    pub fn spend(&self, batch: &mut WriteBatch, outpoint: &OutPoint) {
        batch.delete(Column::Utxo, OutPointKey::new(outpoint).0);
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let mut count = 0usize;
        self.store.for_each_prefix(Column::Utxo, &[], &mut |_, _| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }
}

impl<S: KeyValueStore> UtxoView for UtxoSet<S> {
    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError> {
        self.get(outpoint)
    }
}

/// Pending changes over a base view. `None` marks an output that no longer
/// exists (spent, or removed by a disconnect).
pub struct UtxoOverlay<'a, V: ?Sized> {
    base: &'a V,
    changes: HashMap<OutPoint, Option<UtxoEntry>>,
}

impl<'a, V: UtxoView + ?Sized> UtxoOverlay<'a, V> {
    pub fn new(base: &'a V) -> Self {
        Self {
            base,
            changes: HashMap::new(),
        }
    }

    pub fn insert(&mut self, outpoint: OutPoint, entry: UtxoEntry) {
        self.changes.insert(outpoint, Some(entry));
    }

    pub fn remove(&mut self, outpoint: &OutPoint) {
        self.changes.insert(*outpoint, None);
    }

    /// Removes and returns the entry, or `None` if it does not exist.
    pub fn take(&mut self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError> {
        let entry = self.utxo(outpoint)?;
        if entry.is_some() {
            self.changes.insert(*outpoint, None);
        }
        Ok(entry)
    }

    /// Adds every output of `tx` as created at `height`.
    pub fn add_outputs(&mut self, tx: &Transaction, txid: &Hash256, height: u32) {
        let is_coinbase = tx.is_coinbase();
        for (index, output) in tx.outputs.iter().enumerate() {
            self.insert(
                OutPoint::new(*txid, index as u32),
                UtxoEntry {
                    value: output.value,
                    owner: output.owner,
                    coin: output.coin.clone(),
                    height,
                    is_coinbase,
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Writes the net changes into `batch` in a stable order.
    pub fn write_to<S: KeyValueStore>(&self, utxos: &UtxoSet<S>, batch: &mut WriteBatch) {
        let mut changes: Vec<_> = self.changes.iter().collect();
        changes.sort_by(|a, b| a.0.cmp(b.0));
        for (outpoint, change) in changes {
            match change {
                Some(entry) => utxos.create(batch, outpoint, entry),
                None => utxos.spend(batch, outpoint),
            }
        }
    }
}

impl<V: UtxoView + ?Sized> UtxoView for UtxoOverlay<'_, V> {
    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError> {
        match self.changes.get(outpoint) {
            Some(change) => Ok(change.clone()),
            None => self.base.utxo(outpoint),
        }
    }
}
