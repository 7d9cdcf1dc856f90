//! Region churn with and without the lazy release cache.
//!
//! The pattern that motivates the cache: allocations that repeatedly
//! create and destroy whole regions. With deferred release the region is
//! reinstated instead of round-tripping through the OS.

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use stratheap_bench::bench_heap;

fn region_churn_deferred(c: &mut Criterion) {
    c.bench_function("region_churn_lazy", |b| {
        let heap = bench_heap();
        let size = heap.config().coalesce_mid.max_size;
        b.iter(|| {
            // Fills a fresh region, then empties it; the release parks
            // in the lazy cache and the next iteration reinstates it.
            let ptr = heap.alloc(black_box(size)).expect("alloc");
            heap.free(ptr);
        });
    });
}

fn region_churn_flushed(c: &mut Criterion) {
    c.bench_function("region_churn_flushed", |b| {
        let heap = bench_heap();
        let size = heap.config().coalesce_mid.max_size;
        b.iter(|| {
            let ptr = heap.alloc(black_box(size)).expect("alloc");
            heap.free(ptr);
            // Force the release through to the OS every iteration.
            heap.force_flush();
        });
    });
}

fn mixed_tier_burst(c: &mut Criterion) {
    c.bench_function("mixed_tier_burst", |b| {
        let heap = bench_heap();
        let sizes = [32usize, 200, 1000, 6000, 40_000, 500_000];
        b.iter(|| {
            let ptrs: Vec<usize> = sizes
                .iter()
                .map(|&s| heap.alloc(black_box(s)).expect("alloc"))
                .collect();
            for ptr in ptrs {
                heap.free(ptr);
            }
        });
    });
}

criterion_group!(
    benches,
    region_churn_deferred,
    region_churn_flushed,
    mixed_tier_burst
);
criterion_main!(benches);
