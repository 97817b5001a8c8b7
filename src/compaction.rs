//! Compaction: merge small (or index-less) data files into larger ones,
//! rebuild their graphs, publish the result, and collect the files it
//! replaced once no pinned version can reach them.
//!
//! The background [`Compactor`] is just another writer: it pins a version,
//! publishes through [`VersionManager::commit`](crate::version::VersionManager::commit)
//! and never touches the write buffer.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CompactionConfig;
use crate::engine::flush::WrittenSegment;
use crate::engine::{EngineInner, Segment};
use crate::error::{Result, VexError};
use crate::record::VectorRecord;
use crate::storage::paths;

/// Outcome of one compaction pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompactionReport {
    /// The version published by this pass, if it merged anything.
    pub version_id: Option<u64>,
    pub input_files: usize,
    pub output_files: usize,
    pub rows: u64,
    pub files_collected: usize,
}

/// Files worth merging: small ones once there are enough of them, and any
/// file serving without a usable index.
fn select_inputs(segments: &[Arc<Segment>], config: &CompactionConfig, force: bool) -> Vec<Arc<Segment>> {
    let candidates: Vec<Arc<Segment>> = segments
        .iter()
        .filter(|s| s.is_fallback() || (s.len() as u64) < config.small_file_rows)
        .cloned()
        .collect();
    let min_files = if force { 2 } else { config.min_files };
    if candidates.len() >= min_files || candidates.iter().any(|s| s.is_fallback()) {
        candidates
    } else {
        Vec::new()
    }
}

impl EngineInner {
    /// One compaction pass. `force` lowers the small-file threshold to two
    /// files, as for an explicit request.
    pub(crate) fn compact(&self, force: bool) -> Result<CompactionReport> {
        let _running = self.compaction_lock.lock();
        let started = Instant::now();

        let (pin, segments) = {
            let view = self.view.read();
            (
                self.versions.pin_descriptor(Arc::clone(&view.version)),
                view.segments.clone(),
            )
        };
        let base = Arc::clone(pin.descriptor());
        let inputs = select_inputs(&segments, &self.config.compaction, force);
        if inputs.is_empty() {
            drop(pin);
            let files_collected = self.collect_garbage()?;
            return Ok(CompactionReport {
                files_collected,
                ..CompactionReport::default()
            });
        }

        // Live rows of every input. Within one version an id has at most
        // one live copy; prefer the newest file if that ever fails to hold.
        let mut live: BTreeMap<u64, (u64, VectorRecord)> = BTreeMap::new();
        for segment in &inputs {
            for record in segment.reader().read_all()? {
                if base.is_deleted(record.id, segment.seq()) {
                    continue;
                }
                match live.get(&record.id) {
                    Some((seq, _)) if *seq > segment.seq() => {}
                    _ => {
                        live.insert(record.id, (segment.seq(), record));
                    }
                }
            }
        }
        let records: Vec<VectorRecord> = live.into_values().map(|(_, r)| r).collect();
        let output_ids: HashSet<u64> = records.iter().map(|r| r.id).collect();
        let input_seqs: HashSet<u64> = inputs.iter().map(|s| s.seq()).collect();

        let max_rows = self.config.compaction.max_rows_per_file.max(1) as usize;
        let encoded = records
            .par_chunks(max_rows)
            .map(|chunk| self.encode_segment(chunk))
            .collect::<Result<Vec<_>>>()?;

        // Writing and publishing happen under the flush lock: every flush
        // with a lower sequence number is then already published, and every
        // later flush gets a higher one.
        let (committed, written) = {
            let _flush = self.flush_lock.lock();
            let mut written: Vec<WrittenSegment> = Vec::with_capacity(encoded.len());
            for segment in encoded {
                let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                match self.upload_segment(segment, seq, paths::COMPACTED_PARTITION) {
                    Ok(w) => written.push(w),
                    Err(e) => {
                        self.discard(written.iter().flat_map(|w| w.paths()));
                        return Err(e);
                    }
                }
            }

            let result = self.versions.commit(|fresh| {
                for segment in &inputs {
                    if !fresh.data_files.iter().any(|f| f.seq == segment.seq()) {
                        return Err(VexError::CompactionAborted(format!(
                            "input {} is no longer current",
                            segment.file().path
                        )));
                    }
                }
                for (id, seq) in &fresh.deleted_ids {
                    if base.deleted_ids.get(id) != Some(seq) && output_ids.contains(id) {
                        return Err(VexError::CompactionAborted(format!(
                            "id {} was deleted or replaced during compaction",
                            id
                        )));
                    }
                }
                let mut next = fresh.clone();
                next.data_files.retain(|f| !input_seqs.contains(&f.seq));
                next.index_files.retain(|f| !input_seqs.contains(&f.seq));
                for w in &written {
                    next.data_files.push(w.data.clone());
                    next.index_files.push(w.index.clone());
                }
                next.data_files.sort_by_key(|f| f.seq);
                next.index_files.sort_by_key(|f| f.seq);
                next.prune_tombstones();
                Ok(next)
            });
            let committed = match result {
                Ok(v) => v,
                Err(e @ VexError::CompactionAborted(_)) => {
                    self.discard(written.iter().flat_map(|w| w.paths()));
                    self.metrics.record_compaction(true);
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            let fresh: Vec<Arc<Segment>> = written.iter().map(|w| Arc::clone(&w.segment)).collect();
            self.install(&committed, &fresh)?;
            (committed, written)
        };

        {
            let mut pending = self.pending_gc.lock();
            for segment in &inputs {
                pending.push(segment.file().path.clone());
                if let Some(index) = base.index_for(segment.seq()) {
                    pending.push(index.path.clone());
                }
            }
        }
        drop(pin);
        let files_collected = self.collect_garbage()?;
        self.metrics.record_compaction(false);

        info!(
            version = committed.version_id,
            inputs = inputs.len(),
            outputs = written.len(),
            rows = records.len(),
            files_collected,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compaction published"
        );
        Ok(CompactionReport {
            version_id: Some(committed.version_id),
            input_files: inputs.len(),
            output_files: written.len(),
            rows: records.len() as u64,
            files_collected,
        })
    }

    /// Delete retired files that no served or pinned version references.
    pub(crate) fn collect_garbage(&self) -> Result<usize> {
        let mut pending = self.pending_gc.lock();
        if pending.is_empty() {
            return Ok(0);
        }
        let floor = self.view.read().version.version_id;
        let protected = self.versions.protected_paths(floor)?;

        let mut removed = 0;
        let mut kept = Vec::new();
        for path in pending.drain(..) {
            if protected.contains(&path) {
                kept.push(path);
                continue;
            }
            match self.store.delete(&path) {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(%path, error = %e, "failed to collect file");
                    kept.push(path);
                }
            }
        }
        debug!(removed, waiting = kept.len(), "garbage collection");
        *pending = kept;
        self.metrics.record_collected(removed);
        Ok(removed)
    }
}

/// Background thread running a compaction pass every interval.
#[derive(Debug)]
pub(crate) struct Compactor {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Compactor {
    pub(crate) fn spawn(inner: Arc<EngineInner>) -> Result<Self> {
        let (shutdown, stop) = bounded::<()>(1);
        let interval = Duration::from_millis(inner.config.compaction.interval_ms);
        let handle = thread::Builder::new()
            .name("vectorlake-compactor".into())
            .spawn(move || loop {
                match stop.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => run_pass(&inner),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for a running pass to finish.
    pub(crate) fn stop(mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("compactor thread panicked");
            }
        }
    }
}

fn run_pass(inner: &EngineInner) {
    if inner.ensure_ready().is_err() {
        return;
    }
    match inner.compact(false) {
        Ok(report) if report.version_id.is_some() => {
            debug!(?report, "background compaction finished");
        }
        Ok(_) => {}
        Err(VexError::CompactionAborted(reason)) => {
            info!(%reason, "compaction aborted, retrying next interval");
        }
        Err(e) => warn!(error = %e, "background compaction failed"),
    }
}
