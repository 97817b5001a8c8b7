//! Snapshots keep answering from the state they were taken at, across
//! later writes, flushes, compactions and garbage collection.

mod common;

use common::{ids, memory_engine};
use vectorlake::storage::paths;
use vectorlake::{DistanceMetric, ObjectStore, VexError};

#[test]
fn test_snapshot_ignores_later_writes() {
    let (engine, _store, _dir) = memory_engine(2, DistanceMetric::L2);
    for i in 0..10u64 {
        engine.insert(i, vec![i as f32, 0.0]).unwrap();
    }
    let snapshot = engine.snapshot().unwrap();

    engine.delete(0).unwrap();
    engine.insert(100, vec![0.0, 0.0]).unwrap();
    engine.insert(3, vec![50.0, 50.0]).unwrap();
    engine.flush().unwrap();

    assert_eq!(snapshot.count_live(), 10);
    assert!(snapshot.contains(0));
    assert!(!snapshot.contains(100));
    assert_eq!(snapshot.get(3).unwrap().unwrap().vector, vec![3.0, 0.0]);
    assert_eq!(ids(&snapshot.search(&[0.0, 0.0], 2, None).unwrap()), vec![0, 1]);

    assert_eq!(ids(&engine.search(&[0.0, 0.0], 2, None).unwrap()), vec![100, 1]);
    assert!(engine.get(0).unwrap().is_none());
}

#[test]
fn test_pinned_files_outlive_compaction() {
    let (engine, store, _dir) = memory_engine(2, DistanceMetric::L2);
    for batch in 0..3u64 {
        for i in 0..5u64 {
            let id = batch * 5 + i;
            engine.insert(id, vec![id as f32, 1.0]).unwrap();
        }
        engine.flush().unwrap();
    }
    let snapshot = engine.snapshot().unwrap();
    let pinned_version = snapshot.version_id();
    let old_files: Vec<String> = snapshot
        .descriptor()
        .data_files
        .iter()
        .map(|f| f.path.clone())
        .collect();
    assert_eq!(old_files.len(), 3);

    engine.delete(7).unwrap();
    engine.flush().unwrap();
    let report = engine.compact().unwrap();
    assert_eq!(report.input_files, 3);
    assert_eq!(report.files_collected, 0);
    assert_eq!(engine.current_version().data_files.len(), 1);
    assert!(engine.stats().pinned_versions.contains(&pinned_version));

    // The old files are still there and still serve the snapshot.
    for path in &old_files {
        assert!(store.head(path).unwrap().is_some());
    }
    assert_eq!(snapshot.get(7).unwrap().unwrap().vector, vec![7.0, 1.0]);
    assert_eq!(snapshot.count_live(), 15);
    assert_eq!(engine.current_version().total_vectors, 14);

    drop(snapshot);
    let report = engine.compact().unwrap();
    assert_eq!(report.version_id, None);
    assert_eq!(report.files_collected, 6);
    for path in &old_files {
        assert!(store.head(path).unwrap().is_none());
    }
    assert_eq!(store.list(paths::DATA_PREFIX).unwrap().len(), 1);
    assert_eq!(engine.stats().pending_gc, 0);
}

#[test]
fn test_snapshot_at_reads_an_older_version() {
    let (engine, _store, _dir) = memory_engine(2, DistanceMetric::L2);
    engine.insert(1, vec![1.0, 1.0]).unwrap();
    engine.flush().unwrap();
    let first = engine.current_version().version_id;
    engine.insert(2, vec![2.0, 2.0]).unwrap();
    engine.delete(1).unwrap();
    engine.flush().unwrap();

    let old = engine.snapshot_at(first).unwrap();
    assert_eq!(old.version_id(), first);
    assert!(old.contains(1));
    assert!(!old.contains(2));
    assert_eq!(ids(&old.search(&[0.0, 0.0], 5, None).unwrap()), vec![1]);

    let current = engine.snapshot().unwrap();
    assert_eq!(ids(&current.search(&[0.0, 0.0], 5, None).unwrap()), vec![2]);

    assert!(matches!(
        engine.snapshot_at(99),
        Err(VexError::ObjectNotFound { .. })
    ));
}
