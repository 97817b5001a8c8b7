//! End-to-end behavior of the engine: insert, search, delete, flush.

mod common;

use common::{ids, memory_engine};
use vectorlake::storage::paths;
use vectorlake::{DistanceMetric, Engine, ObjectStore, VexError};

fn line_engine(n: u64) -> (Engine, std::sync::Arc<vectorlake::MemoryStore>, tempfile::TempDir) {
    let (engine, store, dir) = memory_engine(4, DistanceMetric::L2);
    for i in 0..n {
        engine.insert(i, vec![1.0, 0.0, 0.0, i as f32]).unwrap();
    }
    (engine, store, dir)
}

#[test]
fn test_nearest_from_buffer_and_from_files() {
    let (engine, _store, _dir) = line_engine(1000);
    let query = [1.0, 0.0, 0.0, 0.0];

    let buffered = engine.search(&query, 3, None).unwrap();
    assert_eq!(ids(&buffered), vec![0, 1, 2]);
    assert_eq!(buffered[0].score, 0.0);
    assert!((buffered[2].score - 2.0).abs() < 1e-6);

    engine.flush().unwrap();
    assert_eq!(engine.stats().buffered_entries, 0);
    let stored = engine.search(&query, 3, None).unwrap();
    assert_eq!(ids(&stored), vec![0, 1, 2]);
}

#[test]
fn test_deleted_id_never_returned() {
    let (engine, _store, _dir) = line_engine(100);
    engine.delete(0).unwrap();
    let query = [1.0, 0.0, 0.0, 0.0];
    assert_eq!(ids(&engine.search(&query, 3, None).unwrap()), vec![1, 2, 3]);

    engine.flush().unwrap();
    assert_eq!(ids(&engine.search(&query, 3, None).unwrap()), vec![1, 2, 3]);
    assert!(engine.get(0).unwrap().is_none());

    // Deleting a record that only lives in a data file.
    engine.delete(1).unwrap();
    assert_eq!(ids(&engine.search(&query, 2, None).unwrap()), vec![2, 3]);
    engine.flush().unwrap();
    assert_eq!(ids(&engine.search(&query, 2, None).unwrap()), vec![2, 3]);
    assert_eq!(engine.current_version().total_vectors, 98);
    assert!(matches!(engine.delete(1), Err(VexError::NotFound { id: 1 })));
}

#[test]
fn test_threshold_flush_publishes_one_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = std::sync::Arc::new(vectorlake::MemoryStore::new());
    let mut config = common::config(4, DistanceMetric::L2, dir.path());
    // One record with a 4-dim vector and no payload accounts for 28 bytes.
    config.flush_threshold_bytes = 5 * 28;
    let engine = common::open(&store, config);

    let before = engine.current_version();
    for i in 0..8u64 {
        engine.insert(i, vec![i as f32; 4]).unwrap();
    }
    let after = engine.current_version();
    assert_eq!(after.version_id, before.version_id + 1);
    assert_eq!(after.data_files.len(), before.data_files.len() + 1);
    assert_eq!(after.data_files[0].rows, 5);
    assert_eq!(engine.stats().buffered_entries, 3);
    assert_eq!(store.list(paths::DATA_PREFIX).unwrap().len(), 1);
}

#[test]
fn test_upsert_replaces_vector_and_payload() {
    let (engine, _store, _dir) = memory_engine(2, DistanceMetric::L2);
    engine.insert_with_payload(5, vec![0.0, 0.0], b"first".to_vec()).unwrap();
    engine.flush().unwrap();
    engine.insert_with_payload(5, vec![9.0, 9.0], b"second".to_vec()).unwrap();

    let record = engine.get(5).unwrap().unwrap();
    assert_eq!(record.vector, vec![9.0, 9.0]);
    assert_eq!(record.payload, b"second".to_vec());

    engine.flush().unwrap();
    let hits = engine.search_with_records(&[9.0, 9.0], 5, None).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].1.payload, b"second".to_vec());
    assert_eq!(engine.current_version().total_vectors, 1);
}

#[test]
fn test_dot_product_scores_are_similarities() {
    let (engine, _store, _dir) = memory_engine(2, DistanceMetric::DotProduct);
    engine.insert(1, vec![1.0, 0.0]).unwrap();
    engine.insert(2, vec![3.0, 0.0]).unwrap();
    engine.insert(3, vec![-1.0, 0.0]).unwrap();
    engine.flush().unwrap();

    let hits = engine.search(&[1.0, 0.0], 3, None).unwrap();
    assert_eq!(ids(&hits), vec![2, 1, 3]);
    assert!((hits[0].score - 3.0).abs() < 1e-6);
    assert!((hits[2].score + 1.0).abs() < 1e-6);
}

#[test]
fn test_k_larger_than_collection() {
    let (engine, _store, _dir) = line_engine(4);
    engine.flush().unwrap();
    engine.insert(10, vec![1.0, 0.0, 0.0, 10.0]).unwrap();
    let hits = engine.search(&[1.0, 0.0, 0.0, 0.0], 50, Some(8)).unwrap();
    assert_eq!(ids(&hits), vec![0, 1, 2, 3, 10]);
}

#[test]
fn test_extreme_k_and_ef_return_every_live_record() {
    let (engine, _store, _dir) = line_engine(20);
    engine.delete(3).unwrap();
    let query = [1.0, 0.0, 0.0, 0.0];
    let expected: Vec<u64> = (0..20).filter(|&i| i != 3).collect();

    let buffered = engine.search(&query, u32::MAX, Some(u32::MAX)).unwrap();
    assert_eq!(ids(&buffered), expected);

    engine.flush().unwrap();
    let stored = engine.search(&query, u32::MAX, Some(u32::MAX)).unwrap();
    assert_eq!(ids(&stored), expected);
    assert_eq!(ids(&engine.search(&query, 1, Some(u32::MAX)).unwrap()), vec![0]);

    // A mix of buffered and stored records.
    engine.insert(100, vec![1.0, 0.0, 0.0, 0.5]).unwrap();
    let mixed = engine.search_with_records(&query, u32::MAX, None).unwrap();
    assert_eq!(mixed.len(), 20);
    assert_eq!(mixed[1].0.id, 100);
}

#[test]
fn test_empty_engine_returns_nothing() {
    let (engine, _store, _dir) = memory_engine(3, DistanceMetric::Cosine);
    assert!(engine.search(&[1.0, 0.0, 0.0], 5, None).unwrap().is_empty());
    engine.flush().unwrap();
    assert_eq!(engine.current_version().version_id, 0);
}

#[test]
fn test_local_directory_round_trip() {
    let dir = tempfile::TempDir::new().unwrap();
    {
        let engine = Engine::init(dir.path(), 3, DistanceMetric::Cosine).unwrap();
        engine.insert(1, vec![1.0, 0.0, 0.0]).unwrap();
        engine.insert(2, vec![0.0, 1.0, 0.0]).unwrap();
        engine.flush().unwrap();
        engine.insert(3, vec![0.0, 0.0, 1.0]).unwrap();
        engine.shutdown().unwrap();
    }

    let engine = Engine::init(dir.path(), 3, DistanceMetric::Cosine).unwrap();
    assert_eq!(engine.current_version().total_vectors, 3);
    let hits = engine.search(&[0.0, 0.0, 2.0], 1, None).unwrap();
    assert_eq!(hits[0].id, 3);
    assert!((hits[0].score - 1.0).abs() < 1e-5);

    assert!(matches!(
        Engine::init(dir.path(), 4, DistanceMetric::Cosine),
        Err(VexError::Config(_))
    ));
}
