//! HNSW graph: core data structures and algorithms.
//!
//! Implements the Hierarchical Navigable Small World graph from:
//! "Efficient and robust approximate nearest neighbor search using
//!  Hierarchical Navigable Small World graphs" (Malkov & Yashunin, 2016/2018).
//!
//! Nodes live in a dense arena addressed by `u32` slot. Vectors are stored
//! contiguously (`slot * dimension`). Edges are slot lists per layer, so the
//! whole structure is plain data and serializes without pointer fix-ups.

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::distance::DistanceMetric;
use crate::error::{Result, VexError};
use crate::neighbor_queue::{MaxHeap, MinHeap, Neighbor};

/// Configuration parameters for the HNSW index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswParams {
    /// Max number of connections per node (layers > 0).
    pub m: usize,
    /// Max connections at layer 0 (typically 2 * m).
    pub m_max0: usize,
    /// Number of candidates during construction.
    pub ef_construction: usize,
    /// Number of candidates during search when the caller gives none.
    pub ef_search: usize,
    /// Level generation factor: 1 / ln(m).
    pub ml: f64,
    /// Maximum number of layers.
    pub max_layers: usize,
    /// Seed for level assignment. Builds are reproducible for a given insert order.
    pub seed: u64,
    /// Capacity limit. `None` means unbounded.
    pub max_elements: Option<usize>,
}

impl Default for HnswParams {
    fn default() -> Self {
        let m = 16;
        Self {
            m,
            m_max0: 2 * m,
            ef_construction: 200,
            ef_search: 200,
            ml: 1.0 / (m as f64).ln(),
            max_layers: 16,
            seed: 42,
            max_elements: None,
        }
    }
}

impl HnswParams {
    pub fn new(m: usize, ef_construction: usize, ef_search: usize) -> Self {
        Self {
            m,
            m_max0: 2 * m,
            ef_construction,
            ef_search,
            ml: 1.0 / (m as f64).ln(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.m < 2 {
            return Err(VexError::Config("hnsw.m must be at least 2".into()));
        }
        if self.m_max0 < self.m {
            return Err(VexError::Config("hnsw.m_max0 must be >= hnsw.m".into()));
        }
        if self.ef_construction == 0 || self.ef_search == 0 {
            return Err(VexError::Config("hnsw ef values must be positive".into()));
        }
        if !(self.ml.is_finite() && self.ml > 0.0) {
            return Err(VexError::Config("hnsw.ml must be a positive number".into()));
        }
        if self.max_layers == 0 {
            return Err(VexError::Config("hnsw.max_layers must be positive".into()));
        }
        Ok(())
    }

    fn max_connections(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m_max0
        } else {
            self.m
        }
    }
}

/// A node in the HNSW graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(super) struct Node {
    pub(super) id: u64,
    /// The maximum layer this node was inserted into.
    pub(super) level: usize,
    /// Neighbors per layer. neighbors[l] is the list of neighbor slots at layer l.
    pub(super) neighbors: Vec<Vec<u32>>,
}

/// The HNSW graph structure.
#[derive(Debug, Clone)]
pub struct HnswGraph {
    pub(super) params: HnswParams,
    pub(super) metric: DistanceMetric,
    pub(super) dimension: usize,
    pub(super) nodes: Vec<Node>,
    pub(super) vectors: Vec<f32>,
    pub(super) id_to_slot: HashMap<u64, u32>,
    /// Tombstoned external ids. Still traversed, never returned.
    pub(super) deleted: HashSet<u64>,
    /// Entry point slot (highest-level node).
    pub(super) entry_point: Option<u32>,
    pub(super) max_level: usize,
    pub(super) rng: StdRng,
}

impl HnswGraph {
    pub fn new(metric: DistanceMetric, dimension: usize, params: HnswParams) -> Self {
        let rng = StdRng::seed_from_u64(params.seed);
        Self {
            params,
            metric,
            dimension,
            nodes: Vec::new(),
            vectors: Vec::new(),
            id_to_slot: HashMap::new(),
            deleted: HashSet::new(),
            entry_point: None,
            max_level: 0,
            rng,
        }
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    /// Number of live (non-tombstoned) nodes.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of nodes in the arena, tombstoned ones included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn max_level(&self) -> usize {
        self.max_level
    }

    pub fn contains(&self, id: u64) -> bool {
        self.id_to_slot.contains_key(&id) && !self.deleted.contains(&id)
    }

    pub fn get_vector(&self, id: u64) -> Option<&[f32]> {
        self.id_to_slot.get(&id).map(|&slot| self.vector(slot))
    }

    /// Live `(id, vector)` pairs in slot order.
    pub fn iter_live(&self) -> impl Iterator<Item = (u64, &[f32])> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !self.deleted.contains(&n.id))
            .map(|(slot, n)| (n.id, self.vector(slot as u32)))
    }

    #[inline]
    fn vector(&self, slot: u32) -> &[f32] {
        let start = slot as usize * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    #[inline]
    fn neighbors_at(&self, slot: u32, layer: usize) -> &[u32] {
        self.nodes[slot as usize]
            .neighbors
            .get(layer)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Draw a layer from the geometric distribution `floor(-ln(U) * ml)`.
    fn random_level(&mut self) -> usize {
        let r: f64 = self.rng.gen();
        let level = (-(1.0 - r).ln() * self.params.ml).floor() as usize;
        level.min(self.params.max_layers - 1)
    }

    /// Tombstone `id`. Returns false if the id is unknown or already deleted.
    pub fn mark_deleted(&mut self, id: u64) -> bool {
        self.id_to_slot.contains_key(&id) && self.deleted.insert(id)
    }

    /// SEARCH-LAYER: Algorithm 2 from the HNSW paper, with result filtering.
    ///
    /// Nodes rejected by `accept` are still expanded so the walk stays
    /// connected, they just never enter the result set. The walk stops once
    /// the closest open candidate is worse than a full result set.
    /// Returns slots (as `Neighbor::id`) best first.
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[u32],
        ef: usize,
        layer: usize,
        accept: &dyn Fn(u32) -> bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Neighbor>> {
        let reserve = ef.min(self.nodes.len());
        let mut visited: HashSet<u32> = HashSet::with_capacity(reserve.saturating_mul(4).min(self.nodes.len()));
        let mut candidates = MinHeap::new(); // closest candidate on top
        let mut results = MaxHeap::with_capacity(reserve + 1); // furthest result on top

        for &ep in entry_points {
            if !visited.insert(ep) {
                continue;
            }
            let n = Neighbor::new(ep as u64, self.metric.rank(query, self.vector(ep)));
            candidates.push(n);
            if accept(ep) {
                results.push_bounded(n, ef);
            }
        }

        let mut iteration = 0usize;
        while let Some(current) = candidates.pop() {
            cancel.poll(iteration)?;
            iteration += 1;

            let furthest = results.peek().map_or(f32::INFINITY, |n| n.distance);
            if results.len() >= ef && current.distance > furthest {
                break;
            }

            for &nb in self.neighbors_at(current.id as u32, layer) {
                if !visited.insert(nb) {
                    continue;
                }
                let dist = self.metric.rank(query, self.vector(nb));
                let furthest = results.peek().map_or(f32::INFINITY, |n| n.distance);
                if results.len() < ef || dist < furthest {
                    let n = Neighbor::new(nb as u64, dist);
                    candidates.push(n);
                    if accept(nb) {
                        results.push_bounded(n, ef);
                    }
                }
            }
        }

        Ok(results.into_sorted_vec())
    }

    /// SELECT-NEIGHBORS-HEURISTIC: Algorithm 4 with keepPrunedConnections.
    ///
    /// `candidates` must be sorted best first by distance to the base
    /// element. A candidate is taken when it is closer to the base than to
    /// every neighbor already taken; discarded ones fill any remaining room.
    fn select_neighbors(&self, candidates: &[Neighbor], m: usize) -> Vec<u32> {
        if candidates.len() <= m {
            return candidates.iter().map(|n| n.id as u32).collect();
        }
        let mut selected: Vec<u32> = Vec::with_capacity(m);
        let mut discarded: Vec<u32> = Vec::new();
        for c in candidates {
            if selected.len() >= m {
                break;
            }
            let cv = self.vector(c.id as u32);
            let diverse = selected
                .iter()
                .all(|&s| self.metric.rank(cv, self.vector(s)) >= c.distance);
            if diverse {
                selected.push(c.id as u32);
            } else {
                discarded.push(c.id as u32);
            }
        }
        for d in discarded {
            if selected.len() >= m {
                break;
            }
            selected.push(d);
        }
        selected
    }

    /// Re-run neighbor selection for `slot` after its list at `layer` overflowed.
    fn shrink_connections(&self, slot: u32, layer: usize, max: usize) -> Vec<u32> {
        let base = self.vector(slot);
        let mut scored: Vec<Neighbor> = self
            .neighbors_at(slot, layer)
            .iter()
            .map(|&n| Neighbor::new(n as u64, self.metric.rank(base, self.vector(n))))
            .collect();
        scored.sort_unstable();
        self.select_neighbors(&scored, max)
    }

    /// INSERT: Algorithm 1 from the HNSW paper.
    ///
    /// `vector` must already be prepared for the metric (unit length for cosine).
    pub fn insert(&mut self, id: u64, vector: &[f32]) -> Result<()> {
        if self.vectors.len() != self.nodes.len() * self.dimension {
            return Err(VexError::IndexCorruption(
                "vector storage does not match node table".into(),
            ));
        }
        let capacity = self.params.max_elements.unwrap_or(u32::MAX as usize);
        if self.nodes.len() >= capacity.min(u32::MAX as usize) {
            return Err(VexError::IndexCorruption(format!(
                "index is full ({} elements)",
                self.nodes.len()
            )));
        }
        if vector.len() != self.dimension {
            return Err(VexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        if self.id_to_slot.contains_key(&id) {
            return Err(VexError::InvalidArgument(format!(
                "id {} is already indexed",
                id
            )));
        }

        let level = self.random_level();
        let slot = self.nodes.len() as u32;
        self.nodes.push(Node {
            id,
            level,
            neighbors: vec![Vec::new(); level + 1],
        });
        self.vectors.extend_from_slice(vector);
        self.id_to_slot.insert(id, slot);

        // If this is the first node, set it as entry point
        let entry_point = match self.entry_point {
            None => {
                self.entry_point = Some(slot);
                self.max_level = level;
                return Ok(());
            }
            Some(ep) => ep,
        };

        let never = CancellationToken::new();
        let accept_all = |_: u32| true;
        let top = self.max_level;
        let mut eps = vec![entry_point];

        // Phase 1: Greedy descent from top layer down to level+1 (ef=1)
        for layer in (level + 1..=top).rev() {
            let nearest = self.search_layer(vector, &eps, 1, layer, &accept_all, &never)?;
            if let Some(n) = nearest.first() {
                eps = vec![n.id as u32];
            }
        }

        // Phase 2: connect at layers min(level, top) down to 0
        for layer in (0..=level.min(top)).rev() {
            let found = self.search_layer(
                vector,
                &eps,
                self.params.ef_construction,
                layer,
                &accept_all,
                &never,
            )?;
            let selected = self.select_neighbors(&found, self.params.m);
            let max_conn = self.params.max_connections(layer);

            for &nb in &selected {
                let overflow = {
                    let list = &mut self.nodes[nb as usize].neighbors[layer];
                    list.push(slot);
                    list.len() > max_conn
                };
                if overflow {
                    let pruned = self.shrink_connections(nb, layer, max_conn);
                    self.nodes[nb as usize].neighbors[layer] = pruned;
                }
            }
            self.nodes[slot as usize].neighbors[layer] = selected;

            if !found.is_empty() {
                eps = found.iter().map(|n| n.id as u32).collect();
            }
        }

        // Update entry point if new node has a higher level
        if level > top {
            self.entry_point = Some(slot);
            self.max_level = level;
        }
        Ok(())
    }

    /// SEARCH: Algorithm 5 from the HNSW paper.
    ///
    /// Returns up to `k` live nodes accepted by `filter`, best first, with
    /// external ids. `ef` below `k` is raised to `k`.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
        filter: &dyn Fn(u64) -> bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Neighbor>> {
        let entry_point = match self.entry_point {
            Some(ep) if k > 0 => ep,
            _ => return Ok(Vec::new()),
        };
        if query.len() != self.dimension {
            return Err(VexError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let accept_all = |_: u32| true;
        let mut ep = entry_point;
        // Phase 1: Greedy descent from top layer to layer 1 (ef=1)
        for layer in (1..=self.max_level).rev() {
            let nearest = self.search_layer(query, &[ep], 1, layer, &accept_all, cancel)?;
            if let Some(n) = nearest.first() {
                ep = n.id as u32;
            }
        }

        // Phase 2: bottom layer with max(ef, k) candidates
        let accept = |slot: u32| {
            let id = self.nodes[slot as usize].id;
            !self.deleted.contains(&id) && filter(id)
        };
        let found = self.search_layer(query, &[ep], ef.max(k), 0, &accept, cancel)?;

        let mut results: Vec<Neighbor> = found
            .into_iter()
            .map(|n| Neighbor::new(self.nodes[n.id as usize].id, n.distance))
            .collect();
        results.sort_unstable();
        results.truncate(k);
        Ok(results)
    }

    /// Check the structural invariants a loaded graph must satisfy.
    pub(super) fn validate(&self) -> Result<()> {
        let corrupt = |msg: String| Err(VexError::IndexCorruption(msg));
        let n = self.nodes.len();
        if self.dimension == 0 {
            return corrupt("dimension is zero".into());
        }
        if self.vectors.len() != n * self.dimension {
            return corrupt(format!(
                "expected {} vector components, found {}",
                n * self.dimension,
                self.vectors.len()
            ));
        }
        if self.id_to_slot.len() != n {
            return corrupt("duplicate node ids".into());
        }
        match self.entry_point {
            None if n > 0 => return corrupt("missing entry point".into()),
            Some(ep) if ep as usize >= n => return corrupt("entry point out of range".into()),
            Some(ep) if self.nodes[ep as usize].level != self.max_level => {
                return corrupt("entry point is not on the top layer".into())
            }
            _ => {}
        }
        for (slot, node) in self.nodes.iter().enumerate() {
            if node.neighbors.len() != node.level + 1 || node.level > self.max_level {
                return corrupt(format!("node {} has inconsistent layers", node.id));
            }
            for (layer, list) in node.neighbors.iter().enumerate() {
                for &nb in list {
                    let ok = (nb as usize) < n
                        && nb as usize != slot
                        && self.nodes[nb as usize].level >= layer;
                    if !ok {
                        return corrupt(format!("node {} has a dangling edge", node.id));
                    }
                }
            }
        }
        if let Some(missing) = self.deleted.iter().find(|id| !self.id_to_slot.contains_key(id)) {
            return corrupt(format!("tombstone for unknown id {}", missing));
        }
        Ok(())
    }
}
