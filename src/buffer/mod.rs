//! Write buffer: the WAL plus the in-memory generations it mirrors.
//!
//! Appends go to the active generation. A flush rotates: the active
//! generation is frozen (and keeps serving reads) while a fresh one with
//! its own WAL file takes new writes. WAL files are deleted only once a
//! published version records their generation as flushed.

pub mod memtable;
pub mod wal;

pub use memtable::{BufferEntry, BufferOp, Generation, Resolved};
pub use wal::{WalEntry, WalOp, WriteAheadLog};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Result, VexError};
use crate::record::VectorRecord;

/// What recovery found in the WAL directory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub files_replayed: usize,
    pub entries_replayed: usize,
    pub files_skipped: usize,
    pub torn_tails: usize,
}

/// Single-writer side of the buffer. The engine keeps it behind a mutex.
#[derive(Debug)]
pub struct WriteBuffer {
    dir: PathBuf,
    wal: WriteAheadLog,
    active: Arc<Generation>,
    next_lsn: u64,
}

impl WriteBuffer {
    /// Replay every WAL file newer than `flushed_generation` into a fresh
    /// active generation, then start a new WAL file for new appends.
    pub fn recover(dir: &Path, flushed_generation: u64) -> Result<(Self, RecoveryReport)> {
        fs::create_dir_all(dir)?;
        let files = wal::list_generations(dir)?;
        let newest = files.last().map_or(0, |(g, _)| *g);
        let generation = newest.max(flushed_generation) + 1;

        let active = Arc::new(Generation::new(generation));
        let mut report = RecoveryReport::default();
        let mut next_lsn = 1;
        for (file_generation, path) in &files {
            if *file_generation <= flushed_generation {
                // Already contained in a published version.
                report.files_skipped += 1;
                if let Err(e) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "failed to remove flushed WAL file");
                }
                continue;
            }
            let replay = WriteAheadLog::replay(path)?;
            if replay.torn_tail {
                report.torn_tails += 1;
                warn!(path = %path.display(), entries = replay.entries.len(), "WAL ends in a torn frame");
            }
            report.files_replayed += 1;
            report.entries_replayed += replay.entries.len();
            for entry in replay.entries {
                active.push(BufferEntry {
                    lsn: next_lsn,
                    op: into_buffer_op(entry.op),
                });
                next_lsn += 1;
            }
        }

        let wal = WriteAheadLog::open(dir, generation)?;
        if report.entries_replayed > 0 || report.files_skipped > 0 {
            info!(
                replayed = report.entries_replayed,
                files = report.files_replayed,
                skipped = report.files_skipped,
                generation,
                "recovered write buffer"
            );
        }
        Ok((
            Self {
                dir: dir.to_path_buf(),
                wal,
                active,
                next_lsn,
            },
            report,
        ))
    }

    pub fn active(&self) -> &Arc<Generation> {
        &self.active
    }

    /// LSN of the last acknowledged entry.
    pub fn last_lsn(&self) -> u64 {
        self.next_lsn - 1
    }

    /// Durably log `op`, then make it visible in the active generation.
    /// Returns the entry's LSN.
    pub fn append(&mut self, op: BufferOp) -> Result<u64> {
        let lsn = self.next_lsn;
        let wal_op = match &op {
            BufferOp::Put(record) => WalOp::Insert {
                id: record.id,
                vector: record.vector.clone(),
                payload: record.payload.clone(),
            },
            BufferOp::Delete(id) => WalOp::Delete { id: *id },
        };
        self.wal.append(&WalEntry { lsn, op: wal_op })?;
        self.active.push(BufferEntry { lsn, op });
        self.next_lsn += 1;
        Ok(lsn)
    }

    /// Freeze the active generation and start a new one with its own WAL
    /// file. Returns the frozen generation.
    pub fn rotate(&mut self) -> Result<Arc<Generation>> {
        let generation = self.active.id() + 1;
        let wal = WriteAheadLog::open(&self.dir, generation)
            .map_err(|e| VexError::Durability(format!("cannot start WAL {}: {}", generation, e)))?;
        self.wal = wal;
        let frozen = std::mem::replace(&mut self.active, Arc::new(Generation::new(generation)));
        Ok(frozen)
    }

    /// WAL files whose generation is at or below `flushed`. The active
    /// file is never included. Unlink them with [`remove_wal_files`] once
    /// the buffer lock is released.
    pub fn flushed_files(&self, flushed: u64) -> Result<Vec<PathBuf>> {
        Ok(wal::list_generations(&self.dir)?
            .into_iter()
            .filter(|(generation, _)| *generation <= flushed && *generation != self.wal.generation())
            .map(|(_, path)| path)
            .collect())
    }

    #[cfg(test)]
    pub(crate) fn replace_wal(&mut self, wal: WriteAheadLog) {
        self.wal = wal;
    }
}

/// Delete `paths`, returning how many were removed. A file that is already
/// gone counts as removed.
pub fn remove_wal_files(paths: &[PathBuf]) -> Result<usize> {
    let mut removed = 0;
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => removed += 1,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(removed)
}

fn into_buffer_op(op: WalOp) -> BufferOp {
    match op {
        WalOp::Insert {
            id,
            vector,
            payload,
        } => BufferOp::Put(Arc::new(VectorRecord::with_payload(id, vector, payload))),
        WalOp::Delete { id } => BufferOp::Delete(id),
    }
}
