//! Shared setup for the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use vectorlake::{DistanceMetric, Engine, EngineConfig, MemoryStore, ObjectStore};

/// Config with the background compactor off and the WAL under `wal_root`.
pub fn config(dim: usize, metric: DistanceMetric, wal_root: &Path) -> EngineConfig {
    let mut config = EngineConfig::new(dim, metric);
    config.wal_dir = wal_root.join("wal");
    config.compaction.enabled = false;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

/// An engine over a fresh in-memory store. Keep the `TempDir` alive.
pub fn memory_engine(dim: usize, metric: DistanceMetric) -> (Engine, Arc<MemoryStore>, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let engine = open(&store, config(dim, metric, dir.path()));
    (engine, store, dir)
}

pub fn open(store: &Arc<MemoryStore>, config: EngineConfig) -> Engine {
    let store: Arc<dyn ObjectStore> = Arc::clone(store) as Arc<dyn ObjectStore>;
    Engine::open(store, config).unwrap()
}

pub fn ids(hits: &[vectorlake::SearchHit]) -> Vec<u64> {
    hits.iter().map(|h| h.id).collect()
}
