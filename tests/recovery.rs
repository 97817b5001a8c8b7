//! Crash recovery: WAL replay, torn tails, storage faults and leftovers.

mod common;

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use common::{config, ids, open};
use tempfile::TempDir;
use vectorlake::buffer::wal;
use vectorlake::storage::paths;
use vectorlake::{DistanceMetric, MemoryStore, ObjectStore};

#[test]
fn test_unflushed_writes_replay_after_crash() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    {
        let engine = open(&store, config(2, DistanceMetric::L2, dir.path()));
        engine.insert(1, vec![1.0, 0.0]).unwrap();
        engine.insert(2, vec![2.0, 0.0]).unwrap();
        engine.flush().unwrap();
        engine.insert(3, vec![3.0, 0.0]).unwrap();
        engine.delete(1).unwrap();
        // Dropped without shutdown.
    }

    let engine = open(&store, config(2, DistanceMetric::L2, dir.path()));
    let report = engine.recovery_report();
    assert_eq!(report.entries_replayed, 2);
    assert_eq!(report.torn_tails, 0);
    assert!(engine.get(1).unwrap().is_none());
    assert_eq!(engine.get(3).unwrap().unwrap().vector, vec![3.0, 0.0]);
    assert_eq!(ids(&engine.search(&[0.0, 0.0], 5, None).unwrap()), vec![2, 3]);

    engine.flush().unwrap();
    assert_eq!(engine.current_version().total_vectors, 2);
}

#[test]
fn test_torn_tail_keeps_complete_entries() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    {
        let engine = open(&store, config(2, DistanceMetric::L2, dir.path()));
        engine.insert(1, vec![1.0, 0.0]).unwrap();
        engine.insert(2, vec![2.0, 0.0]).unwrap();
    }

    let wal_dir = dir.path().join("wal");
    let (_, newest) = wal::list_generations(&wal_dir).unwrap().pop().unwrap();
    let mut file = OpenOptions::new().append(true).open(&newest).unwrap();
    file.write_all(&[0x2a, 0x00, 0x00, 0x00, 0x01, 0x02]).unwrap();
    drop(file);

    let engine = open(&store, config(2, DistanceMetric::L2, dir.path()));
    assert_eq!(engine.recovery_report().torn_tails, 1);
    assert_eq!(engine.recovery_report().entries_replayed, 2);
    assert!(engine.get(1).unwrap().is_some());
    assert!(engine.get(2).unwrap().is_some());

    engine.insert(3, vec![3.0, 0.0]).unwrap();
    assert_eq!(ids(&engine.search(&[3.0, 0.0], 1, None).unwrap()), vec![3]);
}

#[test]
fn test_transient_failures_are_retried() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let engine = open(&store, config(2, DistanceMetric::L2, dir.path()));
    engine.insert(1, vec![1.0, 0.0]).unwrap();

    store.inject_transient_failures(3);
    engine.flush().unwrap();
    assert_eq!(engine.current_version().version_id, 1);
    assert_eq!(engine.get(1).unwrap().unwrap().vector, vec![1.0, 0.0]);
}

#[test]
fn test_failed_upload_keeps_data_buffered() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let engine = open(&store, config(2, DistanceMetric::L2, dir.path()));
    engine.insert(1, vec![1.0, 0.0]).unwrap();

    store.fail_puts_with_prefix(Some(paths::DATA_PREFIX));
    assert!(engine.flush().is_err());
    assert_eq!(engine.current_version().version_id, 0);
    assert_eq!(ids(&engine.search(&[0.0, 0.0], 1, None).unwrap()), vec![1]);

    store.fail_puts_with_prefix(None);
    engine.insert(2, vec![2.0, 0.0]).unwrap();
    engine.flush().unwrap();
    let version = engine.current_version();
    assert_eq!(version.total_vectors, 2);
    assert_eq!(engine.stats().buffered_entries, 0);
    assert_eq!(store.list(paths::DATA_PREFIX).unwrap().len(), version.data_files.len());
}

#[test]
fn test_unpublished_files_are_swept_on_open() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    {
        let engine = open(&store, config(2, DistanceMetric::L2, dir.path()));
        engine.insert(1, vec![1.0, 0.0]).unwrap();
        store.fail_puts_with_prefix(Some(paths::VERSION_PREFIX));
        assert!(engine.flush().is_err());
        assert_eq!(store.list(paths::DATA_PREFIX).unwrap().len(), 1);
    }
    store.fail_puts_with_prefix(None);

    let engine = open(&store, config(2, DistanceMetric::L2, dir.path()));
    assert!(store.list(paths::DATA_PREFIX).unwrap().is_empty());
    assert!(store.list(paths::INDEX_PREFIX).unwrap().is_empty());
    assert_eq!(engine.recovery_report().entries_replayed, 1);

    engine.flush().unwrap();
    assert_eq!(engine.current_version().version_id, 1);
    assert_eq!(ids(&engine.search(&[1.0, 0.0], 1, None).unwrap()), vec![1]);
}

#[test]
fn test_corrupt_index_falls_back_to_scan() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    {
        let engine = open(&store, config(2, DistanceMetric::L2, dir.path()));
        for i in 0..20u64 {
            engine.insert(i, vec![i as f32, 0.0]).unwrap();
        }
        engine.shutdown().unwrap();
    }
    let index = store.list(paths::INDEX_PREFIX).unwrap().pop().unwrap();
    assert!(store.corrupt(&index, |bytes| bytes.truncate(10)));

    let engine = open(&store, config(2, DistanceMetric::L2, dir.path()));
    assert_eq!(engine.stats().fallback_segments, 1);
    assert_eq!(ids(&engine.search(&[4.2, 0.0], 3, None).unwrap()), vec![4, 5, 3]);

    // Compaction rebuilds the missing index.
    let report = engine.compact().unwrap();
    assert_eq!(report.input_files, 1);
    assert_eq!(engine.stats().fallback_segments, 0);
    assert_eq!(ids(&engine.search(&[4.2, 0.0], 3, None).unwrap()), vec![4, 5, 3]);
}
