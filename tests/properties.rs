//! Property tests for the distance kernel, brute-force scans and the
//! index snapshot format.

use approx::assert_relative_eq;
use proptest::prelude::*;
use vectorlake::brute_force::{top_k, top_k_parallel, Candidate};
use vectorlake::cancel::CancellationToken;
use vectorlake::distance::{distance, distance_scalar};
use vectorlake::hnsw::build_index;
use vectorlake::{DistanceMetric, HnswGraph, HnswParams};

fn metric() -> impl Strategy<Value = DistanceMetric> {
    prop_oneof![
        Just(DistanceMetric::L2),
        Just(DistanceMetric::DotProduct),
        Just(DistanceMetric::Cosine),
    ]
}

fn pair(max_dim: usize) -> impl Strategy<Value = (Vec<f32>, Vec<f32>)> {
    (1..max_dim).prop_flat_map(|dim| {
        (
            prop::collection::vec(-1.0f32..1.0, dim),
            prop::collection::vec(-1.0f32..1.0, dim),
        )
    })
}

fn rows(dim: usize, max_rows: usize) -> impl Strategy<Value = Vec<Vec<f32>>> {
    prop::collection::vec(prop::collection::vec(-10.0f32..10.0, dim), 1..max_rows)
}

proptest! {
    #[test]
    fn simd_matches_scalar((a, b) in pair(70), metric in metric()) {
        let fast = distance(&a, &b, metric).unwrap();
        let reference = distance_scalar(&a, &b, metric).unwrap();
        assert_relative_eq!(fast, reference, epsilon = 1e-4);
    }

    #[test]
    fn parallel_scan_matches_sequential(
        data in rows(5, 300),
        query in prop::collection::vec(-10.0f32..10.0, 5),
        k in 1usize..20,
        partitions in 1usize..9,
        metric in metric(),
    ) {
        let candidates: Vec<Candidate<'_>> = data
            .iter()
            .enumerate()
            .map(|(i, v)| Candidate::new(i as u64, v))
            .collect();
        let cancel = CancellationToken::new();
        let sequential = top_k(&query, candidates.iter().copied(), k, metric, &cancel).unwrap();
        let parallel = top_k_parallel(&query, &candidates, k, metric, partitions, &cancel).unwrap();
        prop_assert_eq!(sequential, parallel);
    }

    #[test]
    fn snapshot_round_trip_searches_identically(
        data in rows(4, 120),
        query in prop::collection::vec(-10.0f32..10.0, 4),
        k in 1usize..10,
    ) {
        let params = HnswParams::new(4, 32, 16);
        let graph = build_index(
            DistanceMetric::L2,
            4,
            params,
            data.iter().enumerate().map(|(i, v)| (i as u64, v.as_slice())),
        )
        .unwrap();
        let restored = HnswGraph::from_bytes(&graph.to_bytes().unwrap()).unwrap();

        let cancel = CancellationToken::new();
        let before = graph.search(&query, k, 32, &|_| true, &cancel).unwrap();
        let after = restored.search(&query, k, 32, &|_| true, &cancel).unwrap();
        prop_assert_eq!(before, after);
        prop_assert_eq!(restored.node_count(), data.len());
    }

    #[test]
    fn results_are_sorted_and_unique(
        data in rows(3, 200),
        query in prop::collection::vec(-10.0f32..10.0, 3),
        k in 1usize..30,
    ) {
        let graph = build_index(
            DistanceMetric::L2,
            3,
            HnswParams::new(6, 40, 40),
            data.iter().enumerate().map(|(i, v)| (i as u64, v.as_slice())),
        )
        .unwrap();
        let hits = graph.search(&query, k, 40, &|_| true, &CancellationToken::new()).unwrap();
        prop_assert!(hits.len() <= k.min(data.len()));
        for pair in hits.windows(2) {
            prop_assert!(pair[0] < pair[1]);
        }
    }
}
