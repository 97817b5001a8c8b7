//! A loaded data file together with its search structure.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::brute_force::{Candidate, FlatIndex, Partition};
use crate::cancel::CancellationToken;
use crate::distance::DistanceMetric;
use crate::error::{Result, VexError};
use crate::hnsw::HnswGraph;
use crate::neighbor_queue::Neighbor;
use crate::storage::{DataFileReader, ObjectStore};
use crate::version::FileRef;

#[derive(Debug)]
pub enum SegmentIndex {
    Graph(HnswGraph),
    /// The index file was missing or unreadable; searches scan every row.
    Flat(FlatIndex),
}

#[derive(Debug)]
pub struct Segment {
    file: FileRef,
    reader: DataFileReader,
    index: SegmentIndex,
}

impl Segment {
    pub fn from_parts(file: FileRef, reader: DataFileReader, graph: HnswGraph) -> Self {
        Self {
            file,
            reader,
            index: SegmentIndex::Graph(graph),
        }
    }

    /// Open a data file and its index. A corrupt, missing or mismatched
    /// index degrades the segment to brute force instead of failing.
    pub fn load(
        store: &Arc<dyn ObjectStore>,
        file: &FileRef,
        index: Option<&FileRef>,
        metric: DistanceMetric,
        dimension: usize,
    ) -> Result<Self> {
        let reader = DataFileReader::open(Arc::clone(store), &file.path, file.size_bytes)?;
        if reader.footer().dimension as usize != dimension || reader.footer().metric != metric {
            return Err(VexError::Config(format!(
                "{} was written for dimension {} / {}",
                file.path,
                reader.footer().dimension,
                reader.footer().metric
            )));
        }

        let graph = match index {
            Some(index_ref) => match load_graph(store, index_ref, &reader, metric, dimension) {
                Ok(graph) => Some(graph),
                Err(VexError::IndexCorruption(reason)) => {
                    warn!(path = %index_ref.path, %reason, "index unusable, falling back to brute force");
                    None
                }
                Err(VexError::ObjectNotFound { path }) => {
                    warn!(%path, "index file missing, falling back to brute force");
                    None
                }
                Err(e) => return Err(e),
            },
            None => {
                warn!(path = %file.path, "no index recorded, falling back to brute force");
                None
            }
        };

        let index = match graph {
            Some(graph) => SegmentIndex::Graph(graph),
            None => {
                let mut flat = FlatIndex::new(metric, dimension);
                for record in reader.read_all()? {
                    flat.add(record.id, &record.vector);
                }
                SegmentIndex::Flat(flat)
            }
        };
        debug!(path = %file.path, rows = reader.len(), "loaded segment");
        Ok(Self {
            file: file.clone(),
            reader,
            index,
        })
    }

    pub fn file(&self) -> &FileRef {
        &self.file
    }

    pub fn seq(&self) -> u64 {
        self.file.seq
    }

    pub fn reader(&self) -> &DataFileReader {
        &self.reader
    }

    pub fn index(&self) -> &SegmentIndex {
        &self.index
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.index, SegmentIndex::Flat(_))
    }

    pub fn contains(&self, id: u64) -> bool {
        self.reader.contains(id)
    }

    pub fn len(&self) -> usize {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reader.is_empty()
    }

    /// Approximate search through the graph. `None` for fallback segments,
    /// which are scanned together through [`Segment::partition`].
    pub fn search_graph(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
        filter: &dyn Fn(u64) -> bool,
        cancel: &CancellationToken,
    ) -> Option<Result<Vec<Neighbor>>> {
        match &self.index {
            SegmentIndex::Graph(graph) => Some(graph.search(query, k, ef, filter, cancel)),
            SegmentIndex::Flat(_) => None,
        }
    }

    /// The rows accepted by `filter` as a bounded scan partition. `None`
    /// for graph segments.
    pub fn partition(&self, filter: &dyn Fn(u64) -> bool) -> Option<Partition<'_>> {
        match &self.index {
            SegmentIndex::Flat(flat) => Some(Partition {
                bound: self.reader.footer().bound.as_ref(),
                candidates: flat
                    .candidates()
                    .filter(|c: &Candidate<'_>| filter(c.id))
                    .collect(),
            }),
            SegmentIndex::Graph(_) => None,
        }
    }
}

fn load_graph(
    store: &Arc<dyn ObjectStore>,
    index_ref: &FileRef,
    reader: &DataFileReader,
    metric: DistanceMetric,
    dimension: usize,
) -> Result<HnswGraph> {
    let bytes = store.get(&index_ref.path)?;
    let graph = HnswGraph::from_bytes(&bytes)?;
    if graph.metric() != metric || graph.dimension() != dimension {
        return Err(VexError::IndexCorruption(format!(
            "{} was built for dimension {} / {}",
            index_ref.path,
            graph.dimension(),
            graph.metric()
        )));
    }
    if graph.node_count() != reader.len() || reader.ids().any(|id| !graph.contains(id)) {
        return Err(VexError::IndexCorruption(format!(
            "{} does not cover the rows of {}",
            index_ref.path,
            reader.path()
        )));
    }
    Ok(graph)
}
