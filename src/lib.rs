//! # vectorlake
//!
//! A vector similarity search engine that keeps its data as immutable files
//! on object storage and serves snapshot-isolated queries over them.
//!
//! This library provides:
//! - Distance metrics (L2, dot product, cosine) with a SIMD kernel
//! - Exact brute-force top-K and an HNSW approximate index
//! - A write buffer backed by a write-ahead log
//! - Versioned metadata with compare-and-swap publication and pins
//! - Background compaction and garbage collection
//!
//! ## Example
//!
//! ```rust,no_run
//! use vectorlake::{DistanceMetric, Engine};
//!
//! let engine = Engine::init("/tmp/vectorlake", 3, DistanceMetric::L2)?;
//! engine.insert(1, vec![1.0, 2.0, 3.0])?;
//! engine.insert(2, vec![3.0, 2.0, 1.0])?;
//!
//! let hits = engine.search(&[1.1, 2.1, 3.1], 5, None)?;
//! assert_eq!(hits[0].id, 1);
//! engine.shutdown()?;
//! # Ok::<(), vectorlake::VexError>(())
//! ```

pub mod brute_force;
pub mod buffer;
pub mod cancel;
pub mod compaction;
pub mod config;
pub mod distance;
pub mod engine;
pub mod error;
pub mod hnsw;
pub mod metrics;
pub mod neighbor_queue;
pub mod record;
pub mod server;
pub mod storage;
pub mod version;

pub use cancel::CancellationToken;
pub use compaction::CompactionReport;
pub use config::{CompactionConfig, EngineConfig, RetryConfig, StorageBackend, StorageConfig};
pub use distance::DistanceMetric;
pub use engine::{Engine, EngineStats, Snapshot};
pub use error::{Result, VexError};
pub use hnsw::{HnswGraph, HnswParams};
pub use record::{SearchHit, VectorRecord};
pub use storage::{LocalStore, MemoryStore, ObjectStore, OpendalStore};
