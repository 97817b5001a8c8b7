//! The engine handle: write buffer, version manager and loaded segments
//! behind the `init / insert / delete / search / flush / shutdown` contract.
//!
//! Lock order: buffer mutex, then the view lock, then the pin table.

pub(crate) mod flush;
pub mod segment;
pub mod snapshot;

pub use segment::{Segment, SegmentIndex};
pub use snapshot::{QuerySettings, Snapshot};

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::buffer::{memtable, BufferOp, Generation, RecoveryReport, WriteBuffer};
use crate::cancel::CancellationToken;
use crate::compaction::{CompactionReport, Compactor};
use crate::config::EngineConfig;
use crate::distance::DistanceMetric;
use crate::error::{Result, VexError};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::record::{validate_vector, SearchHit, VectorRecord};
use crate::storage::serialization::{from_json, to_json};
use crate::storage::{self, paths, ObjectStore, PutMode, RetryingStore};
use crate::version::{VersionDescriptor, VersionManager};

/// Contents of `_metadata/engine.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineMeta {
    pub dimension: usize,
    pub metric: DistanceMetric,
}

impl EngineMeta {
    /// Read the stored metadata, if the namespace was ever initialized.
    pub fn read(store: &dyn ObjectStore) -> Result<Option<Self>> {
        match store.get(paths::ENGINE_META) {
            Ok(bytes) => Ok(Some(from_json(&bytes)?)),
            Err(VexError::ObjectNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// What the engine currently serves: one version, its segments, and the
/// buffer generations not yet contained in it (oldest first, the active
/// generation last).
#[derive(Debug)]
pub(crate) struct View {
    pub version: Arc<VersionDescriptor>,
    pub segments: Vec<Arc<Segment>>,
    pub generations: Vec<Arc<Generation>>,
}

#[derive(Debug)]
pub(crate) struct EngineInner {
    pub config: EngineConfig,
    pub store: Arc<dyn ObjectStore>,
    pub versions: VersionManager,
    pub buffer: Mutex<WriteBuffer>,
    pub view: RwLock<View>,
    /// LSN of the newest acknowledged buffer entry.
    pub committed_lsn: AtomicU64,
    pub next_seq: AtomicU64,
    /// Held by a flush from sequence allocation to install, and by a
    /// compaction while it writes and publishes.
    pub flush_lock: Mutex<()>,
    pub compaction_lock: Mutex<()>,
    /// Compaction inputs waiting for their last pin to go away.
    pub pending_gc: Mutex<Vec<String>>,
    pub metrics: MetricsCollector,
    pub ready: AtomicBool,
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub version_id: u64,
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub data_files: usize,
    pub index_files: usize,
    pub fallback_segments: usize,
    pub tombstones: usize,
    pub total_vectors: u64,
    pub buffered_entries: usize,
    pub buffered_bytes: usize,
    pub pending_generations: usize,
    pub pinned_versions: Vec<u64>,
    pub pins: usize,
    pub pending_gc: usize,
    pub metrics: MetricsSnapshot,
}

impl EngineInner {
    pub fn ensure_ready(&self) -> Result<()> {
        if self.ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(VexError::EngineNotReady)
        }
    }

    fn settings(&self) -> QuerySettings {
        QuerySettings::from_config(&self.config)
    }

    /// Pin the served version and capture everything acknowledged so far.
    pub fn snapshot(&self) -> Snapshot {
        let (pin, segments, generations, cutoff) = {
            let view = self.view.read();
            (
                self.versions.pin_descriptor(Arc::clone(&view.version)),
                view.segments.clone(),
                view.generations.clone(),
                self.committed_lsn.load(Ordering::Acquire),
            )
        };
        let buffer = memtable::resolve(&generations, cutoff);
        Snapshot::new(pin, segments, buffer, self.settings())
    }

    /// Segments for every data file of `descriptor`, reusing loaded ones.
    pub fn segments_for(
        &self,
        descriptor: &VersionDescriptor,
        fresh: &[Arc<Segment>],
    ) -> Result<Vec<Arc<Segment>>> {
        let known: HashMap<u64, Arc<Segment>> = {
            let view = self.view.read();
            view.segments
                .iter()
                .chain(fresh)
                .map(|s| (s.seq(), Arc::clone(s)))
                .collect()
        };
        descriptor
            .data_files
            .iter()
            .map(|file| match known.get(&file.seq) {
                Some(segment) => Ok(Arc::clone(segment)),
                None => Segment::load(
                    &self.store,
                    file,
                    descriptor.index_for(file.seq),
                    self.config.metric,
                    self.config.dimension,
                )
                .map(Arc::new),
            })
            .collect()
    }

    /// Serve `descriptor` if it is newer than the current view. Buffer
    /// generations it contains leave the view in the same step.
    pub fn install(&self, descriptor: &Arc<VersionDescriptor>, fresh: &[Arc<Segment>]) -> Result<()> {
        let segments = self.segments_for(descriptor, fresh)?;
        let mut view = self.view.write();
        if descriptor.version_id > view.version.version_id {
            view.version = Arc::clone(descriptor);
            view.segments = segments;
        }
        let flushed = view.version.flushed_wal_generation;
        view.generations.retain(|g| g.id() > flushed);
        Ok(())
    }

    /// Whether `id` currently has a live copy. Called with the buffer locked.
    fn is_live(&self, id: u64) -> bool {
        let view = self.view.read();
        for generation in view.generations.iter().rev() {
            if let Some(state) = generation.lookup(id, u64::MAX) {
                return state.is_some();
            }
        }
        view.segments
            .iter()
            .any(|s| s.contains(id) && !view.version.is_deleted(id, s.seq()))
    }

    fn append(&self, op: BufferOp, check_live: bool) -> Result<usize> {
        let mut buffer = self.buffer.lock();
        if check_live && !self.is_live(op.id()) {
            return Err(VexError::NotFound { id: op.id() });
        }
        let lsn = buffer.append(op)?;
        self.committed_lsn.store(lsn, Ordering::Release);
        Ok(buffer.active().bytes())
    }
}

/// Handle to a running engine. Cheap to share behind an `Arc`; every
/// method takes `&self`.
#[derive(Debug)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
    compactor: Mutex<Option<Compactor>>,
    recovery: RecoveryReport,
}

impl Engine {
    /// One-time setup of a local data directory. Reopening an existing
    /// directory with a different dimension or metric fails.
    pub fn init<P: AsRef<Path>>(data_dir: P, dimension: usize, metric: DistanceMetric) -> Result<Self> {
        Self::open_local(data_dir, EngineConfig::new(dimension, metric))
    }

    /// Open with the configured storage backend. `data_dir` holds the WAL
    /// (a relative `wal_dir` is placed inside it) and, for the `local` and
    /// `fs` backends, the object files too.
    pub fn open_local<P: AsRef<Path>>(data_dir: P, mut config: EngineConfig) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if config.wal_dir.is_relative() {
            config.wal_dir = data_dir.join(&config.wal_dir);
        }
        let store = storage::open_store(&config.storage, data_dir)?;
        Self::open(store, config)
    }

    /// Open an engine over any object store.
    pub fn open(store: Arc<dyn ObjectStore>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn ObjectStore> = Arc::new(RetryingStore::new(store, config.retry.clone()));
        ensure_engine_meta(store.as_ref(), &config)?;

        let versions = VersionManager::open(
            Arc::clone(&store),
            config.dimension,
            config.metric,
            config.retry.clone(),
        )?;
        let current = versions.current();

        let mut stored = store.list(paths::DATA_PREFIX)?;
        stored.extend(store.list(paths::INDEX_PREFIX)?);
        let next_seq = stored
            .iter()
            .filter_map(|p| paths::parse_seq(p))
            .chain(std::iter::once(current.max_seq()))
            .max()
            .unwrap_or(0)
            + 1;
        sweep_orphans(store.as_ref(), &current, &stored);

        let (buffer, recovery) = WriteBuffer::recover(&config.wal_dir, current.flushed_wal_generation)?;
        let committed_lsn = buffer.last_lsn();
        let active = Arc::clone(buffer.active());

        let inner = Arc::new(EngineInner {
            config,
            store,
            versions,
            buffer: Mutex::new(buffer),
            view: RwLock::new(View {
                version: Arc::clone(&current),
                segments: Vec::new(),
                generations: vec![active],
            }),
            committed_lsn: AtomicU64::new(committed_lsn),
            next_seq: AtomicU64::new(next_seq),
            flush_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            pending_gc: Mutex::new(Vec::new()),
            metrics: MetricsCollector::new(),
            ready: AtomicBool::new(false),
        });
        let segments = inner.segments_for(&current, &[])?;
        let fallback = segments.iter().filter(|s| s.is_fallback()).count();
        inner.view.write().segments = segments;
        inner.ready.store(true, Ordering::Release);

        let compactor = if inner.config.compaction.enabled {
            Some(Compactor::spawn(Arc::clone(&inner))?)
        } else {
            None
        };
        info!(
            version = current.version_id,
            data_files = current.data_files.len(),
            fallback,
            replayed = recovery.entries_replayed,
            next_seq,
            "engine ready"
        );
        Ok(Self {
            inner,
            compactor: Mutex::new(compactor),
            recovery,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn dimension(&self) -> usize {
        self.inner.config.dimension
    }

    pub fn metric(&self) -> DistanceMetric {
        self.inner.config.metric
    }

    /// What WAL replay found when this engine was opened.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Latest published version.
    pub fn current_version(&self) -> Arc<VersionDescriptor> {
        self.inner.versions.current()
    }

    pub fn insert(&self, id: u64, vector: Vec<f32>) -> Result<()> {
        self.insert_with_payload(id, vector, Vec::new())
    }

    /// Durably buffer a record. An existing id is replaced.
    pub fn insert_with_payload(&self, id: u64, mut vector: Vec<f32>, payload: Vec<u8>) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_ready()?;
        validate_vector(&vector, inner.config.dimension)?;
        inner.config.metric.prepare(&mut vector);

        let record = Arc::new(VectorRecord::with_payload(id, vector, payload));
        let buffered = inner.append(BufferOp::Put(record), false)?;
        inner.metrics.record_insert();
        if buffered >= inner.config.flush_threshold_bytes {
            inner.maybe_flush();
        }
        Ok(())
    }

    /// Delete a live record. Fails with [`VexError::NotFound`] otherwise.
    pub fn delete(&self, id: u64) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_ready()?;
        let buffered = inner.append(BufferOp::Delete(id), true)?;
        inner.metrics.record_delete();
        if buffered >= inner.config.flush_threshold_bytes {
            inner.maybe_flush();
        }
        Ok(())
    }

    /// Top-`k` search over the current snapshot. Scores are similarities
    /// for dot/cosine and distances for L2.
    pub fn search(&self, query: &[f32], k: u32, ef: Option<u32>) -> Result<Vec<SearchHit>> {
        self.inner.ensure_ready()?;
        let started = Instant::now();
        let result = self.inner.snapshot().search(query, k, ef);
        self.record_query(&result, started);
        result
    }

    /// [`search`](Self::search) that gives up with [`VexError::Cancelled`]
    /// once `cancel` fires or its deadline passes.
    pub fn search_cancellable(
        &self,
        query: &[f32],
        k: u32,
        ef: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        self.inner.ensure_ready()?;
        let started = Instant::now();
        let result = self.inner.snapshot().search_cancellable(query, k, ef, cancel);
        self.record_query(&result, started);
        result
    }

    /// Search and fetch the full record of every hit.
    pub fn search_with_records(
        &self,
        query: &[f32],
        k: u32,
        ef: Option<u32>,
    ) -> Result<Vec<(SearchHit, VectorRecord)>> {
        self.inner.ensure_ready()?;
        let started = Instant::now();
        let result = self.inner.snapshot().search_with_records(query, k, ef);
        self.record_query(&result, started);
        result
    }

    fn record_query<T>(&self, result: &Result<T>, started: Instant) {
        match result {
            Ok(_) => self.inner.metrics.record_query(started.elapsed()),
            Err(VexError::Cancelled) => self.inner.metrics.record_cancelled(),
            Err(_) => {}
        }
    }

    pub fn get(&self, id: u64) -> Result<Option<VectorRecord>> {
        self.inner.ensure_ready()?;
        self.inner.snapshot().get(id)
    }

    /// Pin the current state for repeatable reads.
    pub fn snapshot(&self) -> Result<Snapshot> {
        self.inner.ensure_ready()?;
        Ok(self.inner.snapshot())
    }

    /// Pin an older version. Buffered writes are not part of it, and its
    /// files must not have been collected yet.
    pub fn snapshot_at(&self, version_id: u64) -> Result<Snapshot> {
        let inner = &self.inner;
        inner.ensure_ready()?;
        let pin = inner.versions.pin(version_id)?;
        let segments = inner.segments_for(pin.descriptor(), &[])?;
        Ok(Snapshot::new(pin, segments, HashMap::new(), inner.settings()))
    }

    /// Write everything buffered so far to storage and publish it.
    pub fn flush(&self) -> Result<()> {
        self.inner.ensure_ready()?;
        self.inner.flush()
    }

    /// Merge small or index-less files now.
    pub fn compact(&self) -> Result<CompactionReport> {
        self.inner.ensure_ready()?;
        self.inner.compact(true)
    }

    pub fn stats(&self) -> EngineStats {
        let inner = &self.inner;
        let pending_gc = inner.pending_gc.lock().len();
        let view = inner.view.read();
        let version = &view.version;
        EngineStats {
            version_id: version.version_id,
            dimension: inner.config.dimension,
            metric: inner.config.metric,
            data_files: version.data_files.len(),
            index_files: version.index_files.len(),
            fallback_segments: view.segments.iter().filter(|s| s.is_fallback()).count(),
            tombstones: version.deleted_ids.len(),
            total_vectors: version.total_vectors,
            buffered_entries: view.generations.iter().map(|g| g.len()).sum(),
            buffered_bytes: view.generations.iter().map(|g| g.bytes()).sum(),
            pending_generations: view.generations.len().saturating_sub(1),
            pinned_versions: inner.versions.pinned_versions(),
            pins: inner.versions.pin_count(),
            pending_gc,
            metrics: inner.metrics.snapshot(),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Ready to serve and the storage namespace is reachable.
    pub fn health_check(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
            && matches!(self.inner.store.head(paths::ENGINE_META), Ok(Some(_)))
    }

    /// Stop background work and flush the buffer. Later calls fail with
    /// [`VexError::EngineNotReady`].
    pub fn shutdown(&self) -> Result<()> {
        if !self.inner.ready.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(compactor) = self.compactor.lock().take() {
            compactor.stop();
        }
        self.inner.flush()?;
        info!(version = self.inner.versions.current().version_id, "engine shut down");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(compactor) = self.compactor.lock().take() {
            compactor.stop();
        }
    }
}

/// Record dimension and metric on first open; reject a mismatch later.
fn ensure_engine_meta(store: &dyn ObjectStore, config: &EngineConfig) -> Result<()> {
    let wanted = EngineMeta {
        dimension: config.dimension,
        metric: config.metric,
    };
    let stored = match EngineMeta::read(store)? {
        Some(meta) => meta,
        None => match store.put_file(paths::ENGINE_META, &to_json(&wanted)?, PutMode::Create) {
            Ok(()) => return Ok(()),
            // Someone initialized it first.
            Err(VexError::AlreadyExists { .. }) => EngineMeta::read(store)?.ok_or_else(|| {
                VexError::Storage(format!("{} vanished", paths::ENGINE_META))
            })?,
            Err(e) => return Err(e),
        },
    };
    if stored != wanted {
        return Err(VexError::Config(format!(
            "namespace was initialized for dimension {} / {}, not {} / {}",
            stored.dimension, stored.metric, wanted.dimension, wanted.metric
        )));
    }
    Ok(())
}

/// Delete data and index objects the current version does not reference.
fn sweep_orphans(store: &dyn ObjectStore, current: &VersionDescriptor, stored: &[String]) {
    let referenced: HashSet<&str> = current.referenced_paths().collect();
    for path in stored {
        if referenced.contains(path.as_str()) || paths::parse_seq(path).is_none() {
            continue;
        }
        match store.delete(path) {
            Ok(()) => warn!(%path, "removed orphaned object"),
            Err(e) => warn!(%path, error = %e, "failed to remove orphaned object"),
        }
    }
}
