#![cfg(feature = "fjall")]

use powd_storage::fjall::{FjallOptions, FjallStore};
use powd_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn fjall_smoke_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");

    let store = FjallStore::open(dir.path()).expect("open fjall");
    store.put(Column::Meta, b"key", b"value").expect("put");
    store.put(Column::Utxo, b"prefix:1", b"a").expect("put");
    store.put(Column::Utxo, b"prefix:2", b"b").expect("put");
    store.put(Column::Utxo, b"other", b"c").expect("put");

    let scanned = store.scan_prefix(Column::Utxo, b"prefix:").expect("scan");
    assert_eq!(
        scanned,
        vec![
            (b"prefix:1".to_vec(), b"a".to_vec()),
            (b"prefix:2".to_vec(), b"b".to_vec()),
        ]
    );

    let mut batch = WriteBatch::new();
    batch.put(Column::Meta, b"batch", b"ok");
    batch.delete(Column::Meta, b"key");
    store.write_batch(&batch).expect("batch commit");

    assert!(store.get(Column::Meta, b"key").expect("get").is_none());
    assert_eq!(
        store.get(Column::Meta, b"batch").expect("get"),
        Some(b"ok".to_vec())
    );
}

#[test]
fn committed_batch_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let store = FjallStore::open_with_options(
            dir.path(),
            FjallOptions {
                sync_commits: true,
                ..FjallOptions::default()
            },
        )
        .expect("open");
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"tip".as_slice(), b"abc".as_slice());
        batch.put(Column::Utxo, b"u1".as_slice(), b"10".as_slice());
        batch.put(Column::Utxo, b"u2".as_slice(), b"20".as_slice());
        store.write_batch(&batch).expect("commit");

        let mut spend = WriteBatch::new();
        spend.delete(Column::Utxo, b"u1".as_slice());
        store.write_batch(&spend).expect("commit spend");
    }

    let store = FjallStore::open(dir.path()).expect("reopen");
    assert_eq!(
        store.get(Column::Meta, b"tip").expect("get"),
        Some(b"abc".to_vec())
    );
    let utxos = store.scan_prefix(Column::Utxo, b"u").expect("scan");
    assert_eq!(utxos, vec![(b"u2".to_vec(), b"20".to_vec())]);
}
