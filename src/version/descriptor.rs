//! Version descriptors: the immutable metadata snapshots published under
//! `_metadata/version_<n>.json`.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::distance::DistanceMetric;

/// A reference to one immutable data or index file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub path: String,
    pub seq: u64,
    pub partition: u32,
    pub rows: u64,
    pub size_bytes: u64,
}

/// The set of files (plus tombstones) that make up one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionDescriptor {
    pub version_id: u64,
    /// Unix time in milliseconds.
    pub created_at: u64,
    /// Data files ordered by sequence number.
    pub data_files: Vec<FileRef>,
    /// One index file per data file, sharing its sequence number.
    pub index_files: Vec<FileRef>,
    /// Tombstones: `id -> seq`. A tombstone hides copies of `id` in data
    /// files with a sequence number below `seq`.
    pub deleted_ids: BTreeMap<u64, u64>,
    /// Highest WAL generation whose entries are contained in this version.
    pub flushed_wal_generation: u64,
    /// Live row count.
    pub total_vectors: u64,
    pub dimension: u32,
    pub metric: DistanceMetric,
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl VersionDescriptor {
    /// Version 0: nothing flushed yet. Never written to storage.
    pub fn empty(dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            version_id: 0,
            created_at: 0,
            data_files: Vec::new(),
            index_files: Vec::new(),
            deleted_ids: BTreeMap::new(),
            flushed_wal_generation: 0,
            total_vectors: 0,
            dimension: dimension as u32,
            metric,
        }
    }

    /// A copy of this descriptor numbered as its direct successor.
    pub fn successor(&self) -> Self {
        Self {
            version_id: self.version_id + 1,
            created_at: now_millis(),
            ..self.clone()
        }
    }

    /// Whether the copy of `id` stored in the file with sequence `file_seq`
    /// is hidden by a tombstone.
    pub fn is_deleted(&self, id: u64, file_seq: u64) -> bool {
        self.deleted_ids.get(&id).map_or(false, |&seq| file_seq < seq)
    }

    /// Record a tombstone hiding `id` in files older than `seq`.
    pub fn add_tombstone(&mut self, id: u64, seq: u64) {
        let entry = self.deleted_ids.entry(id).or_insert(seq);
        *entry = (*entry).max(seq);
    }

    pub fn index_for(&self, seq: u64) -> Option<&FileRef> {
        self.index_files.iter().find(|f| f.seq == seq)
    }

    pub fn max_seq(&self) -> u64 {
        self.data_files
            .iter()
            .chain(&self.index_files)
            .map(|f| f.seq)
            .max()
            .unwrap_or(0)
    }

    /// Every object path this version depends on.
    pub fn referenced_paths(&self) -> impl Iterator<Item = &str> + '_ {
        self.data_files
            .iter()
            .chain(&self.index_files)
            .map(|f| f.path.as_str())
    }

    /// Drop tombstones that no longer hide anything: all data files are at
    /// or above the tombstone's sequence.
    pub fn prune_tombstones(&mut self) {
        let min_seq = self.data_files.iter().map(|f| f.seq).min();
        match min_seq {
            None => self.deleted_ids.clear(),
            Some(min) => self.deleted_ids.retain(|_, seq| *seq > min),
        }
    }
}
