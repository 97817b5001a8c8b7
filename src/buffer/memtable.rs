//! In-memory buffer generations.
//!
//! A generation is an append-only list of operations mirroring one WAL
//! file. Readers resolve it up to an LSN cutoff, so a snapshot never sees
//! entries appended after it was taken, even though the list keeps growing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::record::VectorRecord;

#[derive(Debug, Clone)]
pub enum BufferOp {
    Put(Arc<VectorRecord>),
    Delete(u64),
}

impl BufferOp {
    pub fn id(&self) -> u64 {
        match self {
            BufferOp::Put(record) => record.id,
            BufferOp::Delete(id) => *id,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            BufferOp::Put(record) => record.encoded_len(),
            BufferOp::Delete(_) => 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferEntry {
    pub lsn: u64,
    pub op: BufferOp,
}

/// The newest buffered state of one id: a live record, or `None` if deleted.
pub type Resolved = HashMap<u64, Option<Arc<VectorRecord>>>;

#[derive(Debug)]
pub struct Generation {
    id: u64,
    entries: RwLock<Vec<BufferEntry>>,
    bytes: AtomicUsize,
}

impl Generation {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            entries: RwLock::new(Vec::new()),
            bytes: AtomicUsize::new(0),
        }
    }

    /// WAL generation this buffer mirrors.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn push(&self, entry: BufferEntry) {
        self.bytes.fetch_add(entry.op.encoded_len(), Ordering::Relaxed);
        self.entries.write().push(entry);
    }

    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Fold this generation's entries with `lsn <= cutoff` into `out`,
    /// newest first. Ids already present in `out` (from a newer
    /// generation) are left alone.
    pub fn resolve_into(&self, cutoff: u64, out: &mut Resolved) {
        let entries = self.entries.read();
        for entry in entries.iter().rev() {
            if entry.lsn > cutoff {
                continue;
            }
            let id = entry.op.id();
            out.entry(id).or_insert_with(|| match &entry.op {
                BufferOp::Put(record) => Some(Arc::clone(record)),
                BufferOp::Delete(_) => None,
            });
        }
    }

    /// Final state of every id touched by this generation.
    pub fn resolve_all(&self) -> Resolved {
        let mut out = HashMap::new();
        self.resolve_into(u64::MAX, &mut out);
        out
    }

    /// Newest operation on `id` with `lsn <= cutoff`, if any.
    pub fn lookup(&self, id: u64, cutoff: u64) -> Option<Option<Arc<VectorRecord>>> {
        let entries = self.entries.read();
        entries
            .iter()
            .rev()
            .find(|e| e.lsn <= cutoff && e.op.id() == id)
            .map(|e| match &e.op {
                BufferOp::Put(record) => Some(Arc::clone(record)),
                BufferOp::Delete(_) => None,
            })
    }
}

/// Resolve a stack of generations (oldest first) at `cutoff`.
pub fn resolve(generations: &[Arc<Generation>], cutoff: u64) -> Resolved {
    let mut out = HashMap::new();
    for generation in generations.iter().rev() {
        generation.resolve_into(cutoff, &mut out);
    }
    out
}
