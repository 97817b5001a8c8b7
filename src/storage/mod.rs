//! Object storage layer.
//!
//! Everything the engine persists goes through [`ObjectStore`]: a flat
//! namespace of immutable byte objects addressed by `/`-separated paths.
//! Data and index files are only ever created ([`PutMode::Create`]); the
//! one overwritable object is the `_metadata/latest` hint.
//!
//! [`open_store`] picks the backend named by [`StorageConfig`]: the local
//! directory store, or an opendal operator for S3, fs or memory.

pub mod data_file;
pub mod local;
pub mod memory;
pub mod remote;
pub mod retry;
pub mod serialization;

pub use data_file::{DataFileFooter, DataFileReader, RowLocation};
pub use local::LocalStore;
pub use memory::MemoryStore;
pub use remote::OpendalStore;
pub use retry::RetryingStore;

use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::Result;

/// How [`ObjectStore::put_file`] treats an existing object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Fail with `AlreadyExists` if the path is taken. This is the
    /// conditional write the version CAS is built on.
    Create,
    /// Replace any existing object.
    Overwrite,
}

/// A pluggable object-storage backend.
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    /// Write a whole object.
    fn put_file(&self, path: &str, bytes: &[u8], mode: PutMode) -> Result<()>;

    /// Read a whole object.
    fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Read `range` (end exclusive) of an object. Ranges past the end fail.
    fn get_range(&self, path: &str, range: Range<u64>) -> Result<Vec<u8>>;

    /// Paths starting with `prefix`, sorted. May lag behind recent writes.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove an object. Removing a missing object succeeds.
    fn delete(&self, path: &str) -> Result<()>;

    /// Size of an object, or `None` if it does not exist. Reads by known
    /// path, so it is not subject to listing lag.
    fn head(&self, path: &str) -> Result<Option<u64>>;
}

/// Build the store described by `config`. Relative `local`/`fs` roots are
/// resolved against `data_dir`.
pub fn open_store(config: &StorageConfig, data_dir: &Path) -> Result<Arc<dyn ObjectStore>> {
    config.validate()?;
    let local_root = || data_dir.join(&config.root);
    let store: Arc<dyn ObjectStore> = match config.backend {
        StorageBackend::Local => Arc::new(LocalStore::new(local_root())?),
        StorageBackend::Fs => Arc::new(OpendalStore::fs(&local_root())?),
        StorageBackend::Memory => Arc::new(OpendalStore::memory()?),
        StorageBackend::S3 => Arc::new(OpendalStore::s3(config)?),
    };
    info!(backend = ?config.backend, "opened object store");
    Ok(store)
}

/// Object path layout under the namespace root.
pub mod paths {
    pub const DATA_PREFIX: &str = "data/";
    pub const INDEX_PREFIX: &str = "index/";
    pub const METADATA_PREFIX: &str = "_metadata/";
    pub const VERSION_PREFIX: &str = "_metadata/version_";
    pub const LATEST: &str = "_metadata/latest";
    pub const ENGINE_META: &str = "_metadata/engine.json";

    /// Partition holding flush output.
    pub const FLUSH_PARTITION: u32 = 0;
    /// Partition holding compaction output.
    pub const COMPACTED_PARTITION: u32 = 1;

    pub fn data_file(partition: u32, seq: u64) -> String {
        format!("{}{}/{:020}.vxd", DATA_PREFIX, partition, seq)
    }

    pub fn index_file(seq: u64) -> String {
        format!("{}{:020}.hnsw", INDEX_PREFIX, seq)
    }

    pub fn version_file(version_id: u64) -> String {
        format!("{}{}.json", VERSION_PREFIX, version_id)
    }

    pub fn parse_version_file(path: &str) -> Option<u64> {
        path.strip_prefix(VERSION_PREFIX)?
            .strip_suffix(".json")?
            .parse()
            .ok()
    }

    /// Sequence number embedded in a data or index file name.
    pub fn parse_seq(path: &str) -> Option<u64> {
        let name = path.rsplit('/').next()?;
        let stem = name.split('.').next()?;
        stem.parse().ok()
    }

}
