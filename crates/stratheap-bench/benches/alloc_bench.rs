//! Alloc/free hot-path benchmarks, one pair per tier.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use stratheap_bench::{bench_heap, TIER_SIZES};

fn alloc_free_pairs(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free");
    for (tier, size) in TIER_SIZES {
        group.bench_with_input(BenchmarkId::from_parameter(tier), &size, |b, &size| {
            let heap = bench_heap();
            b.iter(|| {
                let ptr = heap.alloc(black_box(size)).expect("alloc");
                heap.free(black_box(ptr));
            });
        });
    }
    group.finish();
}

fn get_size_probe(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_size");
    for (tier, size) in TIER_SIZES {
        group.bench_with_input(BenchmarkId::from_parameter(tier), &size, |b, &size| {
            let heap = bench_heap();
            let ptr = heap.alloc(size).expect("alloc");
            b.iter(|| black_box(heap.get_size(black_box(ptr))));
            heap.free(ptr);
        });
    }
    group.finish();
}

fn slot_refill(c: &mut Criterion) {
    // Free-then-alloc of the same slot: the FSA fast path.
    c.bench_function("fsa_slot_refill", |b| {
        let heap = bench_heap();
        let ptr = heap.alloc(64).expect("alloc");
        heap.free(ptr);
        b.iter(|| {
            let ptr = heap.alloc(black_box(64)).expect("alloc");
            heap.free(ptr);
        });
    });
}

criterion_group!(benches, alloc_free_pairs, get_size_probe, slot_refill);
criterion_main!(benches);
