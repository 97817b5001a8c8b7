//! HNSW (Hierarchical Navigable Small World) index module.
//!
//! [`HnswGraph`] is the arena-backed graph; [`serialize`] holds its binary
//! snapshot format. [`build_index`] bulk-loads prepared rows.

pub mod graph;
pub mod serialize;

pub use graph::{HnswGraph, HnswParams};

use crate::distance::DistanceMetric;
use crate::error::Result;

/// Build an index from a batch of `(id, vector)` rows.
/// Vectors must already be prepared for `metric`.
pub fn build_index<'a, I>(
    metric: DistanceMetric,
    dimension: usize,
    params: HnswParams,
    rows: I,
) -> Result<HnswGraph>
where
    I: IntoIterator<Item = (u64, &'a [f32])>,
{
    let mut graph = HnswGraph::new(metric, dimension, params);
    for (id, vector) in rows {
        graph.insert(id, vector)?;
    }
    Ok(graph)
}
