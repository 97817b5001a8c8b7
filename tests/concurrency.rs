//! Writers, flushes, compactions and readers running at the same time.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use common::memory_engine;
use vectorlake::{DistanceMetric, VexError};

const WRITERS: u64 = 4;
const PER_WRITER: u64 = 300;

#[test]
fn test_no_writes_lost_under_flush_and_compaction() {
    let (engine, _store, _dir) = memory_engine(8, DistanceMetric::L2);
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let engine = &engine;
                s.spawn(move || {
                    for i in 0..PER_WRITER {
                        let id = w * PER_WRITER + i;
                        engine.insert(id, vec![id as f32; 8]).unwrap();
                        if i % 10 == 9 {
                            // Delete an id this writer inserted earlier.
                            engine.delete(id - 5).unwrap();
                        }
                    }
                })
            })
            .collect();

        s.spawn(|| {
            while !done.load(Ordering::Acquire) {
                engine.flush().unwrap();
                thread::yield_now();
            }
        });
        s.spawn(|| {
            while !done.load(Ordering::Acquire) {
                match engine.compact() {
                    Ok(_) | Err(VexError::CompactionAborted(_)) => {}
                    Err(e) => panic!("compaction failed: {}", e),
                }
                thread::yield_now();
            }
        });
        s.spawn(|| {
            while !done.load(Ordering::Acquire) {
                let hits = engine.search(&[0.0; 8], 10, None).unwrap();
                let unique: HashSet<u64> = hits.iter().map(|h| h.id).collect();
                assert_eq!(unique.len(), hits.len());
            }
        });

        for w in writers {
            w.join().unwrap();
        }
        done.store(true, Ordering::Release);
    });

    let expected: HashSet<u64> = (0..WRITERS * PER_WRITER)
        .filter(|id| id % PER_WRITER % 10 != 4)
        .collect();
    let check = |label: &str| {
        let snapshot = engine.snapshot().unwrap();
        assert_eq!(snapshot.count_live(), expected.len(), "{}", label);
        for id in 0..WRITERS * PER_WRITER {
            assert_eq!(snapshot.contains(id), expected.contains(&id), "{} id {}", label, id);
        }
    };
    check("before final flush");

    engine.flush().unwrap();
    engine.compact().unwrap();
    check("after final compaction");
    assert_eq!(engine.current_version().total_vectors, expected.len() as u64);
    assert_eq!(engine.stats().buffered_entries, 0);
}

#[test]
fn test_concurrent_readers_see_consistent_results() {
    let (engine, _store, _dir) = memory_engine(2, DistanceMetric::L2);
    for i in 0..200u64 {
        engine.insert(i, vec![i as f32, 0.0]).unwrap();
    }
    engine.flush().unwrap();

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..50 {
                    let hits = engine.search(&[10.0, 0.0], 3, None).unwrap();
                    let first: Vec<u64> = hits.iter().map(|h| h.id).collect();
                    assert_eq!(first[0], 10);
                }
            });
        }
    });
    assert_eq!(engine.metrics().total_queries, 200);
}

#[test]
fn test_background_compactor_merges_files() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = std::sync::Arc::new(vectorlake::MemoryStore::new());
    let mut config = common::config(2, DistanceMetric::L2, dir.path());
    config.compaction.enabled = true;
    config.compaction.interval_ms = 10;
    config.compaction.min_files = 2;
    let engine = common::open(&store, config);

    for batch in 0..2u64 {
        for i in 0..10u64 {
            engine.insert(batch * 10 + i, vec![i as f32, batch as f32]).unwrap();
        }
        engine.flush().unwrap();
    }

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while engine.current_version().data_files.len() > 1 {
        assert!(std::time::Instant::now() < deadline, "compactor never ran");
        thread::sleep(std::time::Duration::from_millis(10));
    }
    assert_eq!(engine.current_version().total_vectors, 20);
    assert_eq!(engine.search(&[0.0, 1.0], 1, None).unwrap()[0].id, 10);
    engine.shutdown().unwrap();
}
