//! Flush: drain frozen buffer generations into data + index files and
//! publish them as a new version.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::MutexGuard;
use tracing::{debug, info, warn};

use super::segment::Segment;
use super::EngineInner;
use crate::buffer::{remove_wal_files, Generation};
use crate::error::Result;
use crate::hnsw::{build_index, HnswGraph};
use crate::record::VectorRecord;
use crate::storage::{data_file, paths, DataFileReader, PutMode};
use crate::version::FileRef;

/// A data file and its index, encoded but not yet written.
pub(crate) struct EncodedSegment {
    rows: usize,
    data: Vec<u8>,
    graph: HnswGraph,
    index: Vec<u8>,
}

/// A data file and its index as written to the store.
pub(crate) struct WrittenSegment {
    pub data: FileRef,
    pub index: FileRef,
    pub segment: Arc<Segment>,
}

impl WrittenSegment {
    pub fn paths(&self) -> [&str; 2] {
        [self.data.path.as_str(), self.index.path.as_str()]
    }
}

impl EngineInner {
    /// Flush everything buffered so far. Blocks behind a running flush.
    pub(crate) fn flush(&self) -> Result<()> {
        let guard = self.flush_lock.lock();
        self.flush_locked(&guard)
    }

    /// Threshold-triggered flush. Skipped if another flush is running; a
    /// failure leaves the data buffered and logged in the WAL.
    pub(crate) fn maybe_flush(&self) {
        if let Some(guard) = self.flush_lock.try_lock() {
            if let Err(e) = self.flush_locked(&guard) {
                warn!(error = %e, "automatic flush failed, data stays buffered");
            }
        }
    }

    fn flush_locked(&self, _guard: &MutexGuard<'_, ()>) -> Result<()> {
        self.rotate()?;
        let frozen: Vec<Arc<Generation>> = {
            let view = self.view.read();
            let n = view.generations.len();
            view.generations[..n.saturating_sub(1)].to_vec()
        };
        for generation in frozen {
            self.flush_generation(&generation)?;
        }
        Ok(())
    }

    /// Freeze the active generation. The new one joins the view before any
    /// write can reach it.
    fn rotate(&self) -> Result<()> {
        let mut buffer = self.buffer.lock();
        if buffer.active().is_empty() {
            return Ok(());
        }
        let frozen = buffer.rotate()?;
        self.view.write().generations.push(Arc::clone(buffer.active()));
        debug!(
            generation = frozen.id(),
            entries = frozen.len(),
            bytes = frozen.bytes(),
            "rotated write buffer"
        );
        Ok(())
    }

    fn flush_generation(&self, generation: &Generation) -> Result<()> {
        let current = self.versions.current();
        if generation.id() <= current.flushed_wal_generation {
            // Published earlier, but the view was never updated.
            return self.install(&current, &[]);
        }

        let resolved = generation.resolve_all();
        if resolved.is_empty() {
            let id = generation.id();
            self.view.write().generations.retain(|g| g.id() != id);
            return Ok(());
        }
        let mut touched: Vec<u64> = resolved.keys().copied().collect();
        touched.sort_unstable();
        let mut puts: Vec<VectorRecord> = resolved
            .values()
            .flatten()
            .map(|r| r.as_ref().clone())
            .collect();
        puts.sort_by_key(|r| r.id);
        let deletes = touched.len() - puts.len();

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let written = if puts.is_empty() {
            None
        } else {
            let encoded = self.encode_segment(&puts)?;
            Some(self.upload_segment(encoded, seq, paths::FLUSH_PARTITION)?)
        };
        let fresh: Vec<Arc<Segment>> = written.iter().map(|w| Arc::clone(&w.segment)).collect();

        let generation_id = generation.id();
        let committed = self.versions.commit(|base| {
            let stored = self.segments_for(base, &[])?;
            let mut next = base.clone();
            let mut replaced = 0u64;
            for &id in &touched {
                let live = stored
                    .iter()
                    .any(|s| s.seq() < seq && s.contains(id) && !base.is_deleted(id, s.seq()));
                if live {
                    next.add_tombstone(id, seq);
                    replaced += 1;
                }
            }
            if let Some(w) = &written {
                next.data_files.push(w.data.clone());
                next.index_files.push(w.index.clone());
                next.data_files.sort_by_key(|f| f.seq);
                next.index_files.sort_by_key(|f| f.seq);
            }
            next.total_vectors = base.total_vectors.saturating_sub(replaced) + puts.len() as u64;
            next.flushed_wal_generation = base.flushed_wal_generation.max(generation_id);
            next.prune_tombstones();
            Ok(next)
        });
        let committed = match committed {
            Ok(v) => v,
            Err(e) => {
                // The publish outcome is unknown; leftovers are swept on the next open.
                warn!(generation = generation_id, seq, error = %e, "flush could not publish");
                return Err(e);
            }
        };

        self.install(&committed, &fresh)?;
        self.metrics.record_flush();
        info!(
            version = committed.version_id,
            generation = generation_id,
            seq,
            rows = puts.len(),
            deletes,
            "flushed write buffer"
        );

        let flushed = self.buffer.lock().flushed_files(committed.flushed_wal_generation);
        match flushed.and_then(|paths| remove_wal_files(&paths)) {
            Ok(removed) => debug!(removed, "removed flushed WAL files"),
            Err(e) => warn!(error = %e, "failed to remove flushed WAL files"),
        }
        Ok(())
    }

    /// Encode a batch of rows (sorted by id) and build its graph.
    pub(crate) fn encode_segment(&self, records: &[VectorRecord]) -> Result<EncodedSegment> {
        let dimension = self.config.dimension;
        let metric = self.config.metric;
        let data = data_file::encode(records, dimension, metric)?;
        let graph = build_index(
            metric,
            dimension,
            self.config.hnsw.clone(),
            records.iter().map(|r| (r.id, r.vector.as_slice())),
        )?;
        let index = graph.to_bytes()?;
        Ok(EncodedSegment {
            rows: records.len(),
            data,
            graph,
            index,
        })
    }

    /// Write an encoded segment under `seq`. Nothing is left behind on failure.
    pub(crate) fn upload_segment(
        &self,
        encoded: EncodedSegment,
        seq: u64,
        partition: u32,
    ) -> Result<WrittenSegment> {
        let data = FileRef {
            path: paths::data_file(partition, seq),
            seq,
            partition,
            rows: encoded.rows as u64,
            size_bytes: encoded.data.len() as u64,
        };
        let index = FileRef {
            path: paths::index_file(seq),
            seq,
            partition,
            rows: encoded.rows as u64,
            size_bytes: encoded.index.len() as u64,
        };

        self.store.put_file(&data.path, &encoded.data, PutMode::Create)?;
        if let Err(e) = self.store.put_file(&index.path, &encoded.index, PutMode::Create) {
            self.discard([data.path.as_str()]);
            return Err(e);
        }
        let reader = match DataFileReader::open(Arc::clone(&self.store), &data.path, data.size_bytes) {
            Ok(reader) => reader,
            Err(e) => {
                self.discard([data.path.as_str(), index.path.as_str()]);
                return Err(e);
            }
        };
        let segment = Arc::new(Segment::from_parts(data.clone(), reader, encoded.graph));
        Ok(WrittenSegment {
            data,
            index,
            segment,
        })
    }

    /// Best-effort removal of objects that never made it into a version.
    pub(crate) fn discard<'a>(&self, paths: impl IntoIterator<Item = &'a str>) {
        for path in paths {
            if let Err(e) = self.store.delete(path) {
                warn!(path, error = %e, "failed to remove unpublished object");
            }
        }
    }
}
