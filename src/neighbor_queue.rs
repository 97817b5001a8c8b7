//! Priority queue utilities shared by brute-force scans and the HNSW graph.
//!
//! `Neighbor` is totally ordered by `(distance, id)`, which is what makes
//! results deterministic: equal distances are broken by ascending id.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A scored entry. `distance` is a lower-is-better rank distance; `id` is
/// whatever key the caller ranks by (an external record id, or an arena
/// slot inside the graph).
#[derive(Debug, Clone, Copy)]
pub struct Neighbor {
    pub distance: f32,
    pub id: u64,
}

impl Neighbor {
    pub fn new(id: u64, distance: f32) -> Self {
        Self { distance, id }
    }
}

impl PartialEq for Neighbor {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Neighbor {}

// Default ordering: max-heap (largest distance on top).
impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// A wrapper that reverses Neighbor ordering to create a min-heap.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Reversed(pub Neighbor);

impl PartialOrd for Reversed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Reversed {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.cmp(&self.0)
    }
}

/// Max-heap of neighbors (worst on top). Used as the bounded best-K set.
#[derive(Debug, Default)]
pub struct MaxHeap {
    heap: BinaryHeap<Neighbor>,
}

impl MaxHeap {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, n: Neighbor) {
        self.heap.push(n);
    }

    /// Keep only the best `limit` neighbors. Returns whether `n` was kept.
    pub fn push_bounded(&mut self, n: Neighbor, limit: usize) -> bool {
        if limit == 0 {
            return false;
        }
        if self.heap.len() < limit {
            self.heap.push(n);
            return true;
        }
        match self.heap.peek() {
            Some(worst) if n < *worst => {
                self.heap.pop();
                self.heap.push(n);
                true
            }
            _ => false,
        }
    }

    pub fn peek(&self) -> Option<&Neighbor> {
        self.heap.peek()
    }

    pub fn pop(&mut self) -> Option<Neighbor> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drain into a sorted Vec (best first).
    pub fn into_sorted_vec(self) -> Vec<Neighbor> {
        self.heap.into_sorted_vec()
    }
}

/// Min-heap of neighbors (best on top). Used as the candidate frontier.
#[derive(Debug, Default)]
pub struct MinHeap {
    heap: BinaryHeap<Reversed>,
}

impl MinHeap {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, n: Neighbor) {
        self.heap.push(Reversed(n));
    }

    pub fn peek(&self) -> Option<&Neighbor> {
        self.heap.peek().map(|r| &r.0)
    }

    pub fn pop(&mut self) -> Option<Neighbor> {
        self.heap.pop().map(|r| r.0)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Merge already-ranked lists into one best-`k` list, dropping repeated ids
/// (the first, i.e. best, occurrence wins).
pub fn merge_top_k<I>(lists: I, k: usize) -> Vec<Neighbor>
where
    I: IntoIterator<Item = Vec<Neighbor>>,
{
    let mut all: Vec<Neighbor> = lists.into_iter().flatten().collect();
    all.sort_unstable();
    let mut seen = std::collections::HashSet::with_capacity(all.len());
    all.retain(|n| seen.insert(n.id));
    all.truncate(k);
    all
}
