//! Recall tests: verify HNSW finds a high percentage of true nearest neighbors.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vectorlake::brute_force::FlatIndex;
use vectorlake::cancel::CancellationToken;
use vectorlake::hnsw::build_index;
use vectorlake::neighbor_queue::Neighbor;
use vectorlake::{DistanceMetric, HnswGraph, HnswParams};

fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dim).map(|_| rng.gen::<f32>()).collect())
        .collect()
}

fn recall_at_k(exact: &[Neighbor], approx: &[Neighbor]) -> f64 {
    let ground_truth: HashSet<u64> = exact.iter().map(|n| n.id).collect();
    let found = approx.iter().filter(|n| ground_truth.contains(&n.id)).count();
    found as f64 / exact.len() as f64
}

fn build(vectors: &[Vec<f32>], metric: DistanceMetric, params: HnswParams) -> (HnswGraph, FlatIndex) {
    let dim = vectors[0].len();
    let graph = build_index(
        metric,
        dim,
        params,
        vectors.iter().enumerate().map(|(i, v)| (i as u64, v.as_slice())),
    )
    .unwrap();
    let mut flat = FlatIndex::new(metric, dim);
    for (i, v) in vectors.iter().enumerate() {
        flat.add(i as u64, v);
    }
    (graph, flat)
}

fn test_recall(n: usize, dim: usize, k: usize, num_queries: usize, ef: usize, min_recall: f64) {
    let vectors = random_vectors(n, dim, 7);
    let (graph, flat) = build(&vectors, DistanceMetric::L2, HnswParams::default());

    let queries = random_vectors(num_queries, dim, 8);
    let cancel = CancellationToken::new();
    let mut total_recall = 0.0;
    for query in &queries {
        let exact = flat.search(query, k).unwrap();
        let approx = graph.search(query, k, ef, &|_| true, &cancel).unwrap();
        total_recall += recall_at_k(&exact, &approx);
    }

    let avg_recall = total_recall / num_queries as f64;
    assert!(
        avg_recall >= min_recall,
        "Recall {:.3} is below threshold {:.3} for n={}, dim={}, k={}",
        avg_recall,
        min_recall,
        n,
        dim,
        k
    );
}

#[test]
fn test_recall_1000_vectors() {
    test_recall(1000, 64, 10, 50, 200, 0.95);
}

#[test]
fn test_recall_10000_vectors_default_ef() {
    test_recall(10_000, 128, 10, 50, HnswParams::default().ef_search, 0.95);
}

#[test]
fn test_recall_cosine() {
    let mut vectors = random_vectors(2000, 32, 11);
    for v in vectors.iter_mut() {
        DistanceMetric::Cosine.prepare(v);
    }
    let (graph, flat) = build(&vectors, DistanceMetric::Cosine, HnswParams::default());

    let mut queries = random_vectors(30, 32, 12);
    let cancel = CancellationToken::new();
    let mut total = 0.0;
    for query in queries.iter_mut() {
        DistanceMetric::Cosine.prepare(query);
        let exact = flat.search(query, 10).unwrap();
        let approx = graph.search(query, 10, 200, &|_| true, &cancel).unwrap();
        total += recall_at_k(&exact, &approx);
    }
    assert!(total / 30.0 >= 0.95);
}

#[test]
fn test_recall_with_filter_excludes_half() {
    let vectors = random_vectors(2000, 32, 21);
    let (graph, flat) = build(&vectors, DistanceMetric::L2, HnswParams::default());
    let even = |id: u64| id % 2 == 0;

    let cancel = CancellationToken::new();
    let mut total = 0.0;
    for query in &random_vectors(30, 32, 22) {
        let exact = flat.search_filtered(query, 10, &even, &cancel).unwrap();
        let approx = graph.search(query, 10, 200, &even, &cancel).unwrap();
        assert!(approx.iter().all(|n| n.id % 2 == 0));
        total += recall_at_k(&exact, &approx);
    }
    assert!(total / 30.0 >= 0.90);
}
