//! Concurrent canary stress.
//!
//! N threads hammer one shared heap with randomized alloc/free/realloc
//! sequences. Every allocation is filled with a per-allocation canary at
//! birth and verified byte-for-byte before its free; any allocator bug
//! that hands two live allocations overlapping memory, or lets metadata
//! writes stray into user bytes, fails the verify.

use std::sync::Arc;
use stratheap_core::{HeapConfig, TieredHeap};
use stratheap_harness::{check_canary, write_canary, XorShift64};

const THREADS: usize = 4;
const OPS_PER_THREAD: usize = 3_000;
const MAX_LIVE_PER_THREAD: usize = 48;

struct Live {
    ptr: usize,
    len: usize,
    canary: u8,
}

fn stress_size(rng: &mut XorShift64) -> usize {
    match rng.gen_range(0, 9) {
        0..=4 => rng.gen_range(1, 256),
        5..=6 => rng.gen_range(257, 8 * 1024),
        7..=8 => rng.gen_range(8 * 1024 + 1, 256 * 1024),
        _ => rng.gen_range(256 * 1024 + 1, 2 * 1024 * 1024),
    }
}

#[test]
fn concurrent_canaries_survive_randomized_churn() {
    let heap = Arc::new(TieredHeap::new(HeapConfig {
        start_flush_thread: false,
        ..HeapConfig::default()
    }));

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let heap = Arc::clone(&heap);
            std::thread::spawn(move || {
                let mut rng = XorShift64::new(0xCAFE + t as u64);
                let mut live: Vec<Live> = Vec::new();
                for _ in 0..OPS_PER_THREAD {
                    let roll = rng.gen_range(0, 99);
                    if (roll < 50 && live.len() < MAX_LIVE_PER_THREAD) || live.is_empty() {
                        let size = stress_size(&mut rng);
                        if let Some(ptr) = heap.alloc(size) {
                            let len = heap.get_size(ptr).expect("owned");
                            let canary = (rng.next_u64() & 0xFF) as u8;
                            write_canary(ptr, len, canary);
                            live.push(Live { ptr, len, canary });
                        }
                    } else if roll < 85 {
                        let idx = rng.gen_range(0, live.len() - 1);
                        let entry = live.swap_remove(idx);
                        check_canary(entry.ptr, entry.len, entry.canary);
                        heap.free(entry.ptr);
                    } else {
                        let idx = rng.gen_range(0, live.len() - 1);
                        let entry = live.swap_remove(idx);
                        let new_size = stress_size(&mut rng);
                        let keep = entry.len.min(new_size);
                        check_canary(entry.ptr, keep, entry.canary);
                        if let Some(ptr) = heap.realloc(entry.ptr, new_size) {
                            check_canary(ptr, keep, entry.canary);
                            let len = heap.get_size(ptr).expect("owned");
                            write_canary(ptr, len, entry.canary);
                            live.push(Live {
                                ptr,
                                len,
                                canary: entry.canary,
                            });
                        }
                    }
                }
                // Final verify and drain.
                for entry in live {
                    check_canary(entry.ptr, entry.len, entry.canary);
                    heap.free(entry.ptr);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("stress worker");
    }

    heap.check_integrity().expect("integrity after stress");
    let stats = heap.stats();
    assert_eq!(stats.total.used, 0);
    heap.force_flush();
    assert_eq!(heap.mapping().vm().reserved_bytes(), 0);
}

#[test]
fn interleaved_writes_do_not_cross_allocations() {
    // Two alternating allocation streams in one thread, verifying that
    // freeing and re-filling one stream never disturbs the other.
    let heap = TieredHeap::new(HeapConfig {
        start_flush_thread: false,
        ..HeapConfig::default()
    });
    let mut rng = XorShift64::new(99);
    let mut stable: Vec<Live> = Vec::new();

    for round in 0..200 {
        // Stream A: long-lived, verified every round.
        if stable.len() < 32 {
            let size = rng.gen_range(64, 2048);
            let ptr = heap.alloc(size).expect("alloc");
            let len = heap.get_size(ptr).expect("owned");
            let canary = (round % 251) as u8;
            write_canary(ptr, len, canary);
            stable.push(Live { ptr, len, canary });
        }
        // Stream B: short-lived churn between the long-lived blocks.
        let churn: Vec<usize> = (0..16)
            .filter_map(|_| heap.alloc(rng.gen_range(1, 4096)))
            .collect();
        for &ptr in &churn {
            let len = heap.get_size(ptr).expect("owned");
            write_canary(ptr, len, 0xEE);
        }
        for ptr in churn {
            heap.free(ptr);
        }
        for entry in &stable {
            check_canary(entry.ptr, entry.len, entry.canary);
        }
    }

    for entry in stable {
        heap.free(entry.ptr);
    }
    heap.check_integrity().expect("integrity");
}
