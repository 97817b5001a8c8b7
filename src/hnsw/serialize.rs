//! Binary snapshot format for [`HnswGraph`].
//!
//! Layout: `VXHN` magic, `u32` format version, `u32` crc32 of the body,
//! `u64` body length, then the bincode body. Every field is little endian.
//! Loading re-checks the graph invariants, and any failure is reported as
//! [`VexError::IndexCorruption`].

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::graph::{HnswGraph, HnswParams, Node};
use crate::distance::DistanceMetric;
use crate::error::{Result, VexError};
use crate::storage::serialization::{checksum, from_bincode, to_bincode};

const MAGIC: &[u8; 4] = b"VXHN";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 20;

#[derive(Serialize)]
struct BodyRef<'a> {
    params: &'a HnswParams,
    metric: DistanceMetric,
    dimension: u64,
    nodes: &'a [Node],
    vectors: &'a [f32],
    entry_point: Option<u32>,
    max_level: u64,
    deleted: Vec<u64>,
}

#[derive(Deserialize)]
struct Body {
    params: HnswParams,
    metric: DistanceMetric,
    dimension: u64,
    nodes: Vec<Node>,
    vectors: Vec<f32>,
    entry_point: Option<u32>,
    max_level: u64,
    deleted: Vec<u64>,
}

impl HnswGraph {
    /// Encode the graph as a self-contained blob.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut deleted: Vec<u64> = self.deleted.iter().copied().collect();
        deleted.sort_unstable();
        let body = to_bincode(&BodyRef {
            params: &self.params,
            metric: self.metric,
            dimension: self.dimension as u64,
            nodes: &self.nodes,
            vectors: &self.vectors,
            entry_point: self.entry_point,
            max_level: self.max_level as u64,
            deleted,
        })?;

        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&checksum(&body).to_le_bytes());
        out.extend_from_slice(&(body.len() as u64).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a blob produced by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let corrupt = |msg: &str| VexError::IndexCorruption(msg.to_string());
        if bytes.len() < HEADER_LEN || &bytes[0..4] != MAGIC {
            return Err(corrupt("bad index header"));
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != FORMAT_VERSION {
            return Err(VexError::IndexCorruption(format!(
                "unsupported index format version {}",
                version
            )));
        }
        let crc = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&bytes[12..20]);
        let len = u64::from_le_bytes(len_bytes) as usize;
        let body = bytes
            .get(HEADER_LEN..)
            .filter(|b| b.len() == len)
            .ok_or_else(|| corrupt("index body length mismatch"))?;
        if checksum(body) != crc {
            return Err(corrupt("index checksum mismatch"));
        }

        let body: Body = from_bincode(body)
            .map_err(|e| VexError::IndexCorruption(format!("undecodable index body: {}", e)))?;
        body.params.validate().map_err(|e| VexError::IndexCorruption(e.to_string()))?;

        let mut id_to_slot = HashMap::with_capacity(body.nodes.len());
        for (slot, node) in body.nodes.iter().enumerate() {
            id_to_slot.insert(node.id, slot as u32);
        }
        let seed = body.params.seed ^ body.nodes.len() as u64;
        let graph = HnswGraph {
            rng: StdRng::seed_from_u64(seed),
            params: body.params,
            metric: body.metric,
            dimension: body.dimension as usize,
            nodes: body.nodes,
            vectors: body.vectors,
            id_to_slot,
            deleted: body.deleted.into_iter().collect::<HashSet<u64>>(),
            entry_point: body.entry_point,
            max_level: body.max_level as usize,
        };
        graph.validate()?;
        Ok(graph)
    }
}
