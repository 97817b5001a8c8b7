//! HNSW vs brute-force benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use vectorlake::brute_force::FlatIndex;
use vectorlake::cancel::CancellationToken;
use vectorlake::distance::{distance, distance_scalar};
use vectorlake::hnsw::build_index;
use vectorlake::{DistanceMetric, HnswParams};

fn create_random_vectors(n: usize, dim: usize) -> Vec<Vec<f32>> {
    (0..n)
        .map(|_| (0..dim).map(|_| rand::random::<f32>()).collect())
        .collect()
}

fn benchmark_hnsw_vs_flat(c: &mut Criterion) {
    let mut group = c.benchmark_group("hnsw_vs_flat");
    group.sample_size(20);

    for &size in &[1_000, 10_000] {
        let dim = 128;
        let vectors = create_random_vectors(size, dim);
        let query = vec![0.5; dim];

        let mut flat = FlatIndex::new(DistanceMetric::L2, dim);
        for (i, v) in vectors.iter().enumerate() {
            flat.add(i as u64, v);
        }

        let graph = build_index(
            DistanceMetric::L2,
            dim,
            HnswParams::new(16, 200, 50),
            vectors.iter().enumerate().map(|(i, v)| (i as u64, v.as_slice())),
        )
        .unwrap();
        let cancel = CancellationToken::new();

        group.bench_with_input(BenchmarkId::new("flat", size), &size, |b, _| {
            b.iter(|| flat.search(black_box(&query), black_box(10)).unwrap());
        });

        group.bench_with_input(BenchmarkId::new("hnsw", size), &size, |b, _| {
            b.iter(|| {
                graph
                    .search(black_box(&query), black_box(10), 50, &|_| true, &cancel)
                    .unwrap()
            });
        });
    }

    group.finish();
}

fn benchmark_hnsw_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("hnsw_build");
    group.sample_size(10);

    let dim = 128;
    let vectors = create_random_vectors(1_000, dim);

    group.bench_function("build_1000_128d", |b| {
        b.iter(|| {
            build_index(
                DistanceMetric::L2,
                dim,
                HnswParams::new(16, 200, 50),
                vectors.iter().enumerate().map(|(i, v)| (i as u64, v.as_slice())),
            )
            .unwrap()
        });
    });

    group.finish();
}

fn benchmark_distance_kernels(c: &mut Criterion) {
    let mut group = c.benchmark_group("distance_768d");
    let a = create_random_vectors(1, 768).remove(0);
    let b = create_random_vectors(1, 768).remove(0);

    group.bench_function("simd", |bench| {
        bench.iter(|| distance(black_box(&a), black_box(&b), DistanceMetric::L2).unwrap());
    });
    group.bench_function("scalar", |bench| {
        bench.iter(|| distance_scalar(black_box(&a), black_box(&b), DistanceMetric::L2).unwrap());
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_hnsw_vs_flat,
    benchmark_hnsw_build,
    benchmark_distance_kernels
);
criterion_main!(benches);
