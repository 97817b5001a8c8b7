//! Engine configuration.
//!
//! Every field has a default, so a JSON file only needs to name what it
//! changes. The CLI layers its flags on top of whatever the file provides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::distance::DistanceMetric;
use crate::error::{Result, VexError};
use crate::hnsw::HnswParams;

/// Top-level configuration for an [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Vector dimension. Required; fixed for the lifetime of the data.
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub hnsw: HnswParams,
    /// Buffered bytes that trigger an automatic flush.
    pub flush_threshold_bytes: usize,
    /// Local directory holding the write-ahead log.
    pub wal_dir: PathBuf,
    /// Per-query deadline. 0 disables the deadline.
    pub query_timeout_ms: u64,
    /// Candidate count above which brute-force scans go parallel.
    pub parallel_scan_threshold: usize,
    pub compaction: CompactionConfig,
    pub retry: RetryConfig,
    pub storage: StorageConfig,
}

/// Default for [`EngineConfig::parallel_scan_threshold`].
pub const DEFAULT_PARALLEL_SCAN_THRESHOLD: usize = 4096;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dimension: 0,
            metric: DistanceMetric::Cosine,
            hnsw: HnswParams::default(),
            flush_threshold_bytes: 4 * 1024 * 1024,
            wal_dir: PathBuf::from("wal"),
            query_timeout_ms: 5_000,
            parallel_scan_threshold: DEFAULT_PARALLEL_SCAN_THRESHOLD,
            compaction: CompactionConfig::default(),
            retry: RetryConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub enabled: bool,
    /// Period of the background compaction loop.
    pub interval_ms: u64,
    /// Minimum number of small files before a merge runs.
    pub min_files: usize,
    /// Files with fewer rows than this count as small.
    pub small_file_rows: u64,
    /// Upper bound on rows per merged output file.
    pub max_rows_per_file: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 60_000,
            min_files: 4,
            small_file_rows: 50_000,
            max_rows_per_file: 500_000,
        }
    }
}

/// Where data, index and version files live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Files under the data directory, written through this crate's own
    /// local store.
    #[default]
    Local,
    /// A directory served through opendal's filesystem service.
    Fs,
    /// An in-process opendal memory service. Nothing survives the process.
    Memory,
    /// An S3-compatible bucket.
    S3,
}

impl std::str::FromStr for StorageBackend {
    type Err = VexError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(StorageBackend::Local),
            "fs" => Ok(StorageBackend::Fs),
            "memory" => Ok(StorageBackend::Memory),
            "s3" => Ok(StorageBackend::S3),
            other => Err(VexError::Config(format!("unknown storage backend: {}", other))),
        }
    }
}

/// Object storage settings. The S3 fields are ignored by other backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Namespace root inside the backend. For `local` and `fs` a relative
    /// root is resolved against the data directory.
    pub root: String,
    pub endpoint: Option<String>,
    pub bucket: String,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Address buckets as `<bucket>.<endpoint>` instead of by path.
    pub virtual_host_style: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            root: String::new(),
            endpoint: None,
            bucket: "vectorlake".to_string(),
            region: "us-east-1".to_string(),
            access_key_id: None,
            secret_access_key: None,
            virtual_host_style: false,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        if self.backend == StorageBackend::S3 {
            if self.bucket.is_empty() {
                return Err(VexError::Config("storage.bucket is required for s3".into()));
            }
            if self.access_key_id.is_some() != self.secret_access_key.is_some() {
                return Err(VexError::Config(
                    "storage.access_key_id and storage.secret_access_key go together".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Bounded exponential backoff for transient storage errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 10,
            max_delay_ms: 1_000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based): base * 2^attempt, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

impl EngineConfig {
    pub fn new(dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            dimension,
            metric,
            ..Self::default()
        }
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| VexError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(VexError::Config("dimension must be positive".into()));
        }
        self.hnsw.validate()?;
        if self.flush_threshold_bytes == 0 {
            return Err(VexError::Config(
                "flush_threshold_bytes must be positive".into(),
            ));
        }
        if self.compaction.min_files < 2 {
            return Err(VexError::Config("compaction.min_files must be at least 2".into()));
        }
        if self.compaction.enabled && self.compaction.interval_ms == 0 {
            return Err(VexError::Config(
                "compaction.interval_ms must be positive when compaction is enabled".into(),
            ));
        }
        if self.compaction.max_rows_per_file == 0 {
            return Err(VexError::Config(
                "compaction.max_rows_per_file must be positive".into(),
            ));
        }
        self.storage.validate()?;
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(VexError::Config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}
