//! Pinned, read-only views of the engine.
//!
//! A snapshot holds a pin on one version, the segments of that version, and
//! the buffered operations acknowledged before it was taken. Nothing written
//! afterwards is visible through it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;
use tracing::debug;

use super::segment::Segment;
use crate::brute_force::{scan_partitions, top_k, top_k_parallel, Candidate, Partition};
use crate::buffer::Resolved;
use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::distance::DistanceMetric;
use crate::error::{Result, VexError};
use crate::neighbor_queue::{merge_top_k, Neighbor};
use crate::record::{validate_vector, SearchHit, VectorRecord};
use crate::version::{PinHandle, VersionDescriptor};

/// The query-time knobs a snapshot needs from the engine config.
#[derive(Debug, Clone, Copy)]
pub struct QuerySettings {
    pub metric: DistanceMetric,
    pub dimension: usize,
    pub ef_search: usize,
    pub parallel_scan_threshold: usize,
    pub timeout: Duration,
}

impl QuerySettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            metric: config.metric,
            dimension: config.dimension,
            ef_search: config.hnsw.ef_search,
            parallel_scan_threshold: config.parallel_scan_threshold,
            timeout: config.query_timeout(),
        }
    }
}

/// Where a ranked id lives within the snapshot.
enum Source<'a> {
    Buffer(&'a Arc<VectorRecord>),
    Segment(usize),
}

#[derive(Debug)]
pub struct Snapshot {
    pin: PinHandle,
    segments: Vec<Arc<Segment>>,
    buffer: Resolved,
    settings: QuerySettings,
}

impl Snapshot {
    pub(crate) fn new(
        pin: PinHandle,
        segments: Vec<Arc<Segment>>,
        buffer: Resolved,
        settings: QuerySettings,
    ) -> Self {
        Self {
            pin,
            segments,
            buffer,
            settings,
        }
    }

    pub fn version_id(&self) -> u64 {
        self.pin.version_id()
    }

    pub fn descriptor(&self) -> &VersionDescriptor {
        self.pin.descriptor()
    }

    /// Buffered operations visible to this snapshot (puts and deletes).
    pub fn buffered_ops(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the copy of `id` in `segment` is the visible one.
    fn visible_in(&self, segment: &Segment, id: u64) -> bool {
        !self.buffer.contains_key(&id) && !self.descriptor().is_deleted(id, segment.seq())
    }

    /// Number of live records.
    pub fn count_live(&self) -> usize {
        let buffered = self.buffer.values().filter(|r| r.is_some()).count();
        let stored: usize = self
            .segments
            .iter()
            .map(|s| s.reader().ids().filter(|&id| self.visible_in(s, id)).count())
            .sum();
        buffered + stored
    }

    pub fn contains(&self, id: u64) -> bool {
        match self.buffer.get(&id) {
            Some(entry) => entry.is_some(),
            None => self.locate(id).is_some(),
        }
    }

    fn locate(&self, id: u64) -> Option<usize> {
        self.segments
            .iter()
            .rposition(|s| s.contains(id) && self.visible_in(s, id))
    }

    fn source(&self, id: u64) -> Option<Source<'_>> {
        match self.buffer.get(&id) {
            Some(Some(record)) => Some(Source::Buffer(record)),
            Some(None) => None,
            None => self.locate(id).map(Source::Segment),
        }
    }

    /// Point lookup. Vectors come back as stored (unit length for cosine).
    pub fn get(&self, id: u64) -> Result<Option<VectorRecord>> {
        match self.source(id) {
            Some(Source::Buffer(record)) => Ok(Some(record.as_ref().clone())),
            Some(Source::Segment(i)) => {
                Ok(self.segments[i].reader().read_rows(&[id])?.into_iter().next())
            }
            None => Ok(None),
        }
    }

    /// Top-`k` search. `ef` defaults to the configured value and is raised
    /// to at least `k`.
    pub fn search(&self, query: &[f32], k: u32, ef: Option<u32>) -> Result<Vec<SearchHit>> {
        self.search_cancellable(query, k, ef, &CancellationToken::new())
    }

    /// [`search`](Self::search) that also stops when `cancel` fires. The
    /// configured query timeout still applies.
    pub fn search_cancellable(
        &self,
        query: &[f32],
        k: u32,
        ef: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        let metric = self.settings.metric;
        Ok(self
            .rank(query, k, ef, cancel)?
            .into_iter()
            .map(|n| SearchHit::new(n.id, metric.score(n.distance)))
            .collect())
    }

    /// [`search`](Self::search), plus the full record of every hit. Stored
    /// rows are fetched with range reads covering only the hits.
    pub fn search_with_records(
        &self,
        query: &[f32],
        k: u32,
        ef: Option<u32>,
    ) -> Result<Vec<(SearchHit, VectorRecord)>> {
        let ranked = self.rank(query, k, ef, &CancellationToken::new())?;

        let mut wanted: HashMap<usize, Vec<u64>> = HashMap::new();
        for n in &ranked {
            if let Some(Source::Segment(i)) = self.source(n.id) {
                wanted.entry(i).or_default().push(n.id);
            }
        }
        let mut fetched: HashMap<u64, VectorRecord> = HashMap::new();
        for (i, ids) in wanted {
            for record in self.segments[i].reader().read_rows(&ids)? {
                fetched.insert(record.id, record);
            }
        }

        let metric = self.settings.metric;
        ranked
            .into_iter()
            .map(|n| {
                let record = match self.source(n.id) {
                    Some(Source::Buffer(record)) => Some(record.as_ref().clone()),
                    _ => fetched.remove(&n.id),
                };
                record
                    .map(|r| (SearchHit::new(n.id, metric.score(n.distance)), r))
                    .ok_or_else(|| VexError::Storage(format!("row {} vanished during fetch", n.id)))
            })
            .collect()
    }

    fn rank(
        &self,
        query: &[f32],
        k: u32,
        ef: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Neighbor>> {
        let settings = &self.settings;
        validate_vector(query, settings.dimension)?;
        if k == 0 {
            return Err(VexError::InvalidArgument("k must be at least 1".into()));
        }
        let mut query = query.to_vec();
        settings.metric.prepare(&mut query);
        let k = k as usize;
        let ef = ef.map_or(settings.ef_search, |e| e as usize).max(k);
        let cancel = cancel.child_with_timeout(settings.timeout);

        // Buffered records are few and fresh: scan them exactly.
        let buffered: Vec<Candidate<'_>> = self
            .buffer
            .values()
            .flatten()
            .map(|r| Candidate::new(r.id, &r.vector))
            .collect();
        let buffer_hits = if buffered.len() >= settings.parallel_scan_threshold {
            let partitions = rayon::current_num_threads();
            top_k_parallel(&query, &buffered, k, settings.metric, partitions, &cancel)?
        } else {
            top_k(&query, buffered, k, settings.metric, &cancel)?
        };

        let mut lists = self
            .segments
            .par_iter()
            .filter_map(|segment| {
                let filter = |id: u64| self.visible_in(segment, id);
                segment.search_graph(&query, k, ef, &filter, &cancel)
            })
            .collect::<Result<Vec<_>>>()?;

        if self.segments.iter().any(|s| s.is_fallback()) {
            let partitions: Vec<Partition<'_>> = self
                .segments
                .iter()
                .filter_map(|s| s.partition(&|id| self.visible_in(s, id)))
                .collect();
            let outcome = scan_partitions(&query, &partitions, k, settings.metric, &cancel)?;
            debug!(
                segments = partitions.len(),
                skipped = outcome.skipped_partitions,
                "brute-force fallback scan"
            );
            lists.push(outcome.neighbors);
        }

        lists.push(buffer_hits);
        Ok(merge_top_k(lists, k))
    }
}
