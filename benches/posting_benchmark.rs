//! Benchmark for posting-set operations at different cardinalities and
//! representations.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rwdx::posting::PostingFactory;

fn sorted_ids(count: usize, stride: u32) -> Vec<u32> {
    (0..count as u32).map(|i| i * stride).collect()
}

fn bench_intersect(c: &mut Criterion) {
    let mut group = c.benchmark_group("posting_intersect");

    for size in [1_000usize, 10_000, 100_000] {
        let factory = PostingFactory::default();
        let dense = factory.from_sorted_ids(&sorted_ids(size, 1), 10 * size as u64);
        let sparse = factory.from_sorted_ids(&sorted_ids(size / 100, 137), 10 * size as u64);

        group.bench_with_input(BenchmarkId::new("dense_vs_sparse", size), &size, |b, _| {
            b.iter(|| black_box(dense.intersect(black_box(&sparse))));
        });
    }
    group.finish();
}

fn bench_union(c: &mut Criterion) {
    let mut group = c.benchmark_group("posting_union");

    for size in [1_000usize, 10_000, 100_000] {
        let factory = PostingFactory::default();
        let a = factory.from_sorted_ids(&sorted_ids(size, 3), 10 * size as u64);
        let b_posting = factory.from_sorted_ids(&sorted_ids(size, 5), 10 * size as u64);

        group.bench_with_input(BenchmarkId::new("array_or_bitmap", size), &size, |b, _| {
            b.iter(|| black_box(a.union(black_box(&b_posting))));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_intersect, bench_union);
criterion_main!(benches);
