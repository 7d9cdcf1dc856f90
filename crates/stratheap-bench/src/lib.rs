//! Shared fixtures for the stratheap benchmarks.

use stratheap_core::{HeapConfig, TieredHeap};

/// A heap with background flushing disabled, so benchmark timings
/// measure the allocation paths and not timer jitter.
#[must_use]
pub fn bench_heap() -> TieredHeap {
    TieredHeap::new(HeapConfig {
        start_flush_thread: false,
        ..HeapConfig::default()
    })
}

/// Representative request sizes, one per tier.
pub const TIER_SIZES: [(&str, usize); 5] = [
    ("fsa_small", 48),
    ("fsa_mid", 768),
    ("coalesce_mid", 8 * 1024),
    ("coalesce_large", 256 * 1024),
    ("large", 2 * 1024 * 1024),
];
