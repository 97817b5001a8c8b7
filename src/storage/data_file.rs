//! Immutable data files.
//!
//! ```text
//! [magic "VXDF"][version u16][dimension u32]
//! row*    [id u64][dimension x f32][payload_len u32][payload]
//! footer  bincode(DataFileFooter)
//! trailer [footer_len u64][footer_crc u32][magic "VXDF"]
//! ```
//!
//! The footer maps every id to its byte range and checksum, so a reader can
//! open a file with two small range reads (trailer, footer) and then fetch
//! only the rows it needs.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::serialization::{checksum, from_bincode, to_bincode};
use super::ObjectStore;
use crate::brute_force::PartitionBound;
use crate::distance::DistanceMetric;
use crate::error::{Result, VexError};
use crate::record::VectorRecord;

const MAGIC: &[u8; 4] = b"VXDF";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: u64 = 10;
const TRAILER_LEN: u64 = 16;
/// Row reads separated by at most this many bytes share one range request.
const COALESCE_GAP: u64 = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowLocation {
    pub id: u64,
    pub offset: u64,
    pub len: u32,
    pub crc: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFileFooter {
    pub dimension: u32,
    pub metric: DistanceMetric,
    pub rows: Vec<RowLocation>,
    /// Centroid/radius of the file's vectors; lets scans skip the file.
    pub bound: Option<PartitionBound>,
}

/// Encode `records` as a complete data file. Ids must be unique.
pub fn encode(records: &[VectorRecord], dimension: usize, metric: DistanceMetric) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(
        HEADER_LEN as usize + records.iter().map(|r| r.encoded_len()).sum::<usize>() + 64,
    );
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(dimension as u32).to_le_bytes());

    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        if record.vector.len() != dimension {
            return Err(VexError::DimensionMismatch {
                expected: dimension,
                actual: record.vector.len(),
            });
        }
        let offset = out.len() as u64;
        out.extend_from_slice(&record.id.to_le_bytes());
        for x in &record.vector {
            out.extend_from_slice(&x.to_le_bytes());
        }
        out.extend_from_slice(&(record.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&record.payload);
        let row = &out[offset as usize..];
        rows.push(RowLocation {
            id: record.id,
            offset,
            len: row.len() as u32,
            crc: checksum(row),
        });
    }

    let footer = DataFileFooter {
        dimension: dimension as u32,
        metric,
        rows,
        bound: PartitionBound::from_vectors(records.iter().map(|r| r.vector.as_slice())),
    };
    let footer_bytes = to_bincode(&footer)?;
    out.extend_from_slice(&footer_bytes);
    out.extend_from_slice(&(footer_bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(&checksum(&footer_bytes).to_le_bytes());
    out.extend_from_slice(MAGIC);
    Ok(out)
}

fn decode_row(bytes: &[u8], loc: &RowLocation, dimension: usize) -> Result<VectorRecord> {
    if checksum(bytes) != loc.crc {
        return Err(VexError::Storage(format!("row {} failed its checksum", loc.id)));
    }
    let fixed = 8 + dimension * 4 + 4;
    if bytes.len() < fixed {
        return Err(VexError::Storage(format!("row {} is truncated", loc.id)));
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&bytes[0..8]);
    let vector = bytes[8..8 + dimension * 4]
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let p = 8 + dimension * 4;
    let payload_len = u32::from_le_bytes([bytes[p], bytes[p + 1], bytes[p + 2], bytes[p + 3]]) as usize;
    if bytes.len() != fixed + payload_len {
        return Err(VexError::Storage(format!("row {} has a bad payload length", loc.id)));
    }
    Ok(VectorRecord::with_payload(
        u64::from_le_bytes(id),
        vector,
        bytes[fixed..].to_vec(),
    ))
}

/// Random-access reader over one data file.
#[derive(Debug, Clone)]
pub struct DataFileReader {
    store: Arc<dyn ObjectStore>,
    path: String,
    footer: DataFileFooter,
    by_id: HashMap<u64, usize>,
}

impl DataFileReader {
    /// Open by known path and size; reads only the trailer and the footer.
    pub fn open(store: Arc<dyn ObjectStore>, path: &str, size: u64) -> Result<Self> {
        if size < HEADER_LEN + TRAILER_LEN {
            return Err(VexError::Storage(format!("{} is too small to be a data file", path)));
        }
        let trailer = store.get_range(path, size - TRAILER_LEN..size)?;
        if &trailer[12..16] != MAGIC {
            return Err(VexError::Storage(format!("{} has a bad trailer", path)));
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(&trailer[0..8]);
        let footer_len = u64::from_le_bytes(len);
        let footer_crc = u32::from_le_bytes([trailer[8], trailer[9], trailer[10], trailer[11]]);
        if footer_len > size - HEADER_LEN - TRAILER_LEN {
            return Err(VexError::Storage(format!("{} has a bad footer length", path)));
        }
        let footer_start = size - TRAILER_LEN - footer_len;
        let footer_bytes = store.get_range(path, footer_start..size - TRAILER_LEN)?;
        if checksum(&footer_bytes) != footer_crc {
            return Err(VexError::Storage(format!("{} footer failed its checksum", path)));
        }
        let footer: DataFileFooter = from_bincode(&footer_bytes)?;
        let by_id = footer
            .rows
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id, i))
            .collect();
        Ok(Self {
            store,
            path: path.to_string(),
            footer,
            by_id,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn footer(&self) -> &DataFileFooter {
        &self.footer
    }

    pub fn len(&self) -> usize {
        self.footer.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.footer.rows.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.footer.rows.iter().map(|r| r.id)
    }

    /// Fetch the rows for `ids` that live in this file, in file order.
    /// Nearby rows are fetched with one range request.
    pub fn read_rows(&self, ids: &[u64]) -> Result<Vec<VectorRecord>> {
        let mut wanted: Vec<&RowLocation> = ids
            .iter()
            .filter_map(|id| self.by_id.get(id).map(|&i| &self.footer.rows[i]))
            .collect();
        wanted.sort_by_key(|r| r.offset);
        wanted.dedup_by_key(|r| r.offset);

        let dimension = self.footer.dimension as usize;
        let mut out = Vec::with_capacity(wanted.len());
        let mut i = 0;
        let mut requests = 0;
        while i < wanted.len() {
            let start = wanted[i].offset;
            let mut end = start + wanted[i].len as u64;
            let mut j = i + 1;
            while j < wanted.len() && wanted[j].offset <= end + COALESCE_GAP {
                end = end.max(wanted[j].offset + wanted[j].len as u64);
                j += 1;
            }
            let chunk = self.store.get_range(&self.path, start..end)?;
            requests += 1;
            for loc in &wanted[i..j] {
                let from = (loc.offset - start) as usize;
                out.push(decode_row(&chunk[from..from + loc.len as usize], loc, dimension)?);
            }
            i = j;
        }
        debug!(path = %self.path, rows = out.len(), requests, "row fetch");
        Ok(out)
    }

    /// Fetch every row with a single range request over the row region.
    pub fn read_all(&self) -> Result<Vec<VectorRecord>> {
        let (first, last) = match (self.footer.rows.first(), self.footer.rows.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => return Ok(Vec::new()),
        };
        let start = first.offset;
        let end = last.offset + last.len as u64;
        let chunk = self.store.get_range(&self.path, start..end)?;
        let dimension = self.footer.dimension as usize;
        self.footer
            .rows
            .iter()
            .map(|loc| {
                let from = (loc.offset - start) as usize;
                let to = from + loc.len as usize;
                let bytes = chunk
                    .get(from..to)
                    .ok_or_else(|| VexError::Storage(format!("row {} out of bounds", loc.id)))?;
                decode_row(bytes, loc, dimension)
            })
            .collect()
    }
}
