//! Brute-force top-K: exact scans used for the write buffer, for segments
//! whose index failed to load, and as the correctness oracle for HNSW.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::config::DEFAULT_PARALLEL_SCAN_THRESHOLD;
use crate::distance::{simd, DistanceMetric};
use crate::error::Result;
use crate::neighbor_queue::{merge_top_k, MaxHeap, Neighbor};

/// A borrowed (id, vector) pair to be scored.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub id: u64,
    pub vector: &'a [f32],
}

impl<'a> Candidate<'a> {
    pub fn new(id: u64, vector: &'a [f32]) -> Self {
        Self { id, vector }
    }
}

/// Sequential scan keeping the best `k` by `(distance, id)`.
pub fn top_k<'a, I>(
    query: &[f32],
    candidates: I,
    k: usize,
    metric: DistanceMetric,
    cancel: &CancellationToken,
) -> Result<Vec<Neighbor>>
where
    I: IntoIterator<Item = Candidate<'a>>,
{
    let candidates = candidates.into_iter();
    // `k` comes from callers unchecked; never reserve more than can be kept.
    let mut best = MaxHeap::with_capacity(k.min(candidates.size_hint().0) + 1);
    for (i, c) in candidates.enumerate() {
        cancel.poll(i)?;
        best.push_bounded(Neighbor::new(c.id, metric.rank(query, c.vector)), k);
    }
    Ok(best.into_sorted_vec())
}

/// Split `candidates` into `partitions` chunks scanned on the rayon pool and
/// merge the partial results. Because the ranking order is total, the output
/// is identical to [`top_k`] over the same candidates.
pub fn top_k_parallel(
    query: &[f32],
    candidates: &[Candidate<'_>],
    k: usize,
    metric: DistanceMetric,
    partitions: usize,
    cancel: &CancellationToken,
) -> Result<Vec<Neighbor>> {
    if candidates.is_empty() || k == 0 {
        return Ok(Vec::new());
    }
    let chunk = candidates.len().div_ceil(partitions.max(1)).max(1);
    let partials = candidates
        .par_chunks(chunk)
        .map(|part| top_k(query, part.iter().copied(), k, metric, cancel))
        .collect::<Result<Vec<_>>>()?;
    Ok(merge_top_k(partials, k))
}

/// Centroid/radius summary of a set of vectors. Gives a cheap lower bound on
/// the rank distance from a query to anything inside the set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionBound {
    pub centroid: Vec<f32>,
    pub radius: f32,
}

impl PartitionBound {
    pub fn from_vectors<'a, I>(vectors: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a [f32]> + Clone,
    {
        let mut centroid: Vec<f32> = Vec::new();
        let mut count = 0usize;
        for v in vectors.clone() {
            if centroid.is_empty() {
                centroid = vec![0.0; v.len()];
            }
            for (c, x) in centroid.iter_mut().zip(v) {
                *c += x;
            }
            count += 1;
        }
        if count == 0 {
            return None;
        }
        for c in centroid.iter_mut() {
            *c /= count as f32;
        }
        let radius = vectors
            .into_iter()
            .map(|v| simd::l2_distance(&centroid, v))
            .fold(0.0f32, f32::max);
        Some(Self { centroid, radius })
    }

    /// A value no larger than the rank distance from `query` to any member.
    /// Slightly loosened so rounding can never make it exceed a true distance.
    pub fn lower_bound(&self, query: &[f32], metric: DistanceMetric) -> f32 {
        let bound = match metric {
            DistanceMetric::L2 => (simd::l2_distance(query, &self.centroid) - self.radius).max(0.0),
            DistanceMetric::DotProduct | DistanceMetric::Cosine => {
                let q_norm = simd::norm(query);
                -(simd::dot_product(query, &self.centroid) + q_norm * self.radius)
            }
        };
        bound - 1e-4 * (1.0 + bound.abs())
    }
}

/// A candidate group with an optional bound used for early termination.
#[derive(Debug, Clone)]
pub struct Partition<'a> {
    pub bound: Option<&'a PartitionBound>,
    pub candidates: Vec<Candidate<'a>>,
}

/// Result of [`scan_partitions`].
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub neighbors: Vec<Neighbor>,
    pub skipped_partitions: usize,
}

/// Scan partitions in order of their lower bound, skipping any whose bound is
/// already worse than the current k-th best. Skipping never changes the
/// result: a skipped partition cannot contain anything that beats or ties
/// the k-th entry.
pub fn scan_partitions(
    query: &[f32],
    partitions: &[Partition<'_>],
    k: usize,
    metric: DistanceMetric,
    cancel: &CancellationToken,
) -> Result<ScanOutcome> {
    let mut order: Vec<(f32, usize)> = partitions
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let lb = p
                .bound
                .map_or(f32::NEG_INFINITY, |b| b.lower_bound(query, metric));
            (lb, i)
        })
        .collect();
    order.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

    let total: usize = partitions.iter().map(|p| p.candidates.len()).sum();
    let mut best = MaxHeap::with_capacity(k.min(total) + 1);
    let mut skipped = 0;
    let mut iteration = 0usize;
    for (lb, idx) in order {
        if best.len() >= k {
            if let Some(worst) = best.peek() {
                if lb > worst.distance {
                    skipped += 1;
                    continue;
                }
            }
        }
        for c in &partitions[idx].candidates {
            cancel.poll(iteration)?;
            iteration += 1;
            best.push_bounded(Neighbor::new(c.id, metric.rank(query, c.vector)), k);
        }
    }
    Ok(ScanOutcome {
        neighbors: best.into_sorted_vec(),
        skipped_partitions: skipped,
    })
}

/// An owned flat (brute-force) index over prepared vectors.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    metric: DistanceMetric,
    dimension: usize,
    ids: Vec<u64>,
    vectors: Vec<f32>,
    parallel_threshold: usize,
}

impl FlatIndex {
    pub fn new(metric: DistanceMetric, dimension: usize) -> Self {
        Self {
            metric,
            dimension,
            ids: Vec::new(),
            vectors: Vec::new(),
            parallel_threshold: DEFAULT_PARALLEL_SCAN_THRESHOLD,
        }
    }

    /// Scan on the rayon pool once at least `threshold` vectors pass the
    /// filter. Mirrors [`EngineConfig::parallel_scan_threshold`](crate::EngineConfig).
    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold.max(1);
        self
    }

    /// Add an already-prepared vector (normalized for cosine).
    pub fn add(&mut self, id: u64, vector: &[f32]) {
        debug_assert_eq!(vector.len(), self.dimension);
        self.ids.push(id);
        self.vectors.extend_from_slice(vector);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn get_vector(&self, id: u64) -> Option<&[f32]> {
        self.ids
            .iter()
            .position(|&x| x == id)
            .map(|i| &self.vectors[i * self.dimension..(i + 1) * self.dimension])
    }

    pub fn candidates(&self) -> impl Iterator<Item = Candidate<'_>> {
        self.ids
            .iter()
            .zip(self.vectors.chunks_exact(self.dimension.max(1)))
            .map(|(&id, v)| Candidate::new(id, v))
    }

    pub fn bound(&self) -> Option<PartitionBound> {
        PartitionBound::from_vectors(self.vectors.chunks_exact(self.dimension.max(1)))
    }

    /// Exact top-k over the vectors accepted by `filter`.
    pub fn search_filtered(
        &self,
        query: &[f32],
        k: usize,
        filter: &(dyn Fn(u64) -> bool + Sync),
        cancel: &CancellationToken,
    ) -> Result<Vec<Neighbor>> {
        let live: Vec<Candidate<'_>> = self.candidates().filter(|c| filter(c.id)).collect();
        if live.len() >= self.parallel_threshold {
            let partitions = rayon::current_num_threads();
            top_k_parallel(query, &live, k, self.metric, partitions, cancel)
        } else {
            top_k(query, live, k, self.metric, cancel)
        }
    }

    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.search_filtered(query, k, &|_| true, &CancellationToken::new())
    }
}
