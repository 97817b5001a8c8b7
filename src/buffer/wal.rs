//! Write-Ahead Log (WAL) for crash recovery.
//!
//! Each entry is written as: [length: u32][crc32: u32][payload: bincode(WalEntry)]
//! The WAL is append-only and fsynced after each write. Every buffer
//! generation gets its own file, `wal-<generation>.log`.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VexError};
use crate::storage::serialization::{checksum, from_bincode, to_bincode};

/// A logged operation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum WalOp {
    Insert {
        id: u64,
        vector: Vec<f32>,
        payload: Vec<u8>,
    },
    Delete {
        id: u64,
    },
}

/// A single WAL entry.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WalEntry {
    pub lsn: u64,
    pub op: WalOp,
}

/// Result of reading one WAL file back.
#[derive(Debug, Default)]
pub struct Replay {
    pub entries: Vec<WalEntry>,
    /// Replay stopped at a truncated or corrupt frame.
    pub torn_tail: bool,
}

/// Write-Ahead Log file manager.
#[derive(Debug)]
pub struct WriteAheadLog {
    path: PathBuf,
    file: File,
    generation: u64,
    /// Length of the file up to the last acknowledged entry.
    len: u64,
    /// Set when a failed append could not be rolled back.
    poisoned: bool,
}

pub fn file_name(generation: u64) -> String {
    format!("wal-{:020}.log", generation)
}

pub fn parse_generation(name: &str) -> Option<u64> {
    name.strip_prefix("wal-")?.strip_suffix(".log")?.parse().ok()
}

/// WAL files in `dir`, ordered by generation.
pub fn list_generations(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Some(generation) = parse_generation(&entry.file_name().to_string_lossy()) {
            out.push((generation, entry.path()));
        }
    }
    out.sort();
    Ok(out)
}

impl WriteAheadLog {
    /// Create (or reopen for appending) the WAL file for `generation`.
    pub fn open(dir: &Path, generation: u64) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(file_name(generation));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            generation,
            len,
            poisoned: false,
        })
    }

    /// Open an existing WAL file through a handle that refuses writes.
    #[cfg(test)]
    pub(crate) fn open_read_only(dir: &Path, generation: u64) -> Result<Self> {
        let path = dir.join(file_name(generation));
        let file = OpenOptions::new().read(true).open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            generation,
            len,
            poisoned: false,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry to the WAL and fsync.
    ///
    /// On failure the partial frame is truncated away and the call fails
    /// with [`VexError::Durability`].
    pub fn append(&mut self, entry: &WalEntry) -> Result<()> {
        if self.poisoned {
            return Err(VexError::Durability(format!(
                "{} is unusable after an earlier write failure",
                self.path.display()
            )));
        }
        let payload = to_bincode(entry)?;
        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&checksum(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        let written = self
            .file
            .write_all(&frame)
            .and_then(|_| self.file.sync_data());
        match written {
            Ok(()) => {
                self.len += frame.len() as u64;
                Ok(())
            }
            Err(e) => {
                if self.file.set_len(self.len).is_err() {
                    self.poisoned = true;
                }
                Err(VexError::Durability(format!(
                    "append to {} failed: {}",
                    self.path.display(),
                    e
                )))
            }
        }
    }

    /// Replay all valid entries from a WAL file.
    /// Stops at the first corrupted or incomplete entry (crash tolerance).
    pub fn replay(path: &Path) -> Result<Replay> {
        let bytes = fs::read(path)?;
        let mut replay = Replay::default();
        let mut pos = 0usize;

        while pos < bytes.len() {
            let header = match bytes.get(pos..pos + 8) {
                Some(h) => h,
                None => {
                    replay.torn_tail = true;
                    break;
                }
            };
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            let payload = match bytes.get(pos + 8..pos + 8 + len) {
                Some(p) if checksum(p) == crc => p,
                _ => {
                    replay.torn_tail = true;
                    break;
                }
            };
            match from_bincode::<WalEntry>(payload) {
                Ok(entry) => replay.entries.push(entry),
                Err(_) => {
                    replay.torn_tail = true;
                    break;
                }
            }
            pos += 8 + len;
        }

        Ok(replay)
    }
}
