//! Concurrent alloc/free/realloc against shared tiers.
//!
//! Metadata-level stress: threads hammer the dispatcher with randomized
//! sequences while the test checks the invariants that do not require
//! dereferencing user pointers — disjoint live ranges, exact accounting
//! after drain, and a clean integrity walk. Content corruption (canary
//! patterns) is covered by the harness crate, which is allowed to write
//! through raw pointers.

use std::collections::BTreeMap;
use std::sync::Arc;
use stratheap_core::{HeapConfig, TieredHeap};

#[derive(Clone, Copy)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        low + (self.next_u64() as usize) % (high_inclusive - low + 1)
    }
}

fn test_heap() -> TieredHeap {
    TieredHeap::new(HeapConfig {
        start_flush_thread: false,
        ..HeapConfig::default()
    })
}

/// Sizes spanning every tier, biased toward the small end the way real
/// workloads are.
fn pick_size(rng: &mut XorShift64) -> usize {
    match rng.gen_range(0, 9) {
        0..=3 => rng.gen_range(1, 128),
        4..=5 => rng.gen_range(129, 1024),
        6..=7 => rng.gen_range(1025, 32 * 1024),
        8 => rng.gen_range(32 * 1024 + 1, 1024 * 1024),
        _ => rng.gen_range(1024 * 1024 + 1, 2 * 1024 * 1024),
    }
}

#[test]
fn randomized_single_thread_churn_stays_consistent() {
    let heap = test_heap();
    let mut rng = XorShift64::new(0xDEC0_DE00);
    let mut live: BTreeMap<usize, usize> = BTreeMap::new();

    fn pick_live(rng: &mut XorShift64, live: &BTreeMap<usize, usize>) -> Option<usize> {
        if live.is_empty() {
            return None;
        }
        let nth = rng.gen_range(0, live.len() - 1);
        live.keys().nth(nth).copied()
    }

    for round in 0..3000 {
        match rng.gen_range(0, 99) {
            0..=54 if live.len() < 250 => {
                let size = pick_size(&mut rng);
                if let Some(ptr) = heap.alloc(size) {
                    let usable = heap.get_size(ptr).expect("fresh pointer is owned");
                    assert!(usable >= size);
                    // Disjointness against neighbors in address order.
                    if let Some((&prev, &prev_len)) = live.range(..=ptr).next_back() {
                        assert!(prev + prev_len <= ptr, "round {round}: overlap below");
                    }
                    if let Some((&next, _)) = live.range(ptr + 1..).next() {
                        assert!(ptr + usable <= next, "round {round}: overlap above");
                    }
                    live.insert(ptr, usable);
                }
            }
            55..=84 => {
                if let Some(ptr) = pick_live(&mut rng, &live) {
                    live.remove(&ptr);
                    heap.free(ptr);
                }
            }
            _ => {
                if let Some(ptr) = pick_live(&mut rng, &live) {
                    let new_size = pick_size(&mut rng);
                    live.remove(&ptr);
                    if let Some(moved) = heap.realloc(ptr, new_size) {
                        let usable = heap.get_size(moved).expect("owned");
                        assert!(usable >= new_size);
                        live.insert(moved, usable);
                    }
                }
            }
        }
        if round % 1000 == 999 {
            heap.check_integrity().expect("mid-run integrity");
        }
    }

    for (&ptr, _) in &live {
        assert!(heap.get_size(ptr).is_some());
    }
    for (ptr, _) in std::mem::take(&mut live) {
        heap.free(ptr);
    }
    heap.check_integrity().expect("final integrity");
    let stats = heap.stats();
    assert_eq!(stats.total.used, 0, "all bytes returned");
    assert_eq!(stats.total.reserved, 0, "all regions returned");
    heap.force_flush();
    assert_eq!(heap.mapping().vm().reserved_bytes(), 0);
}

#[test]
fn concurrent_churn_does_not_corrupt_metadata() {
    let heap = Arc::new(test_heap());
    let threads = 4;
    let rounds = 1500;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let heap = Arc::clone(&heap);
            std::thread::spawn(move || {
                let mut rng = XorShift64::new(0xBEEF + t as u64);
                let mut live: Vec<(usize, usize)> = Vec::new();
                for _ in 0..rounds {
                    if live.len() < 64 && rng.gen_range(0, 1) == 0 {
                        let size = pick_size(&mut rng);
                        if let Some(ptr) = heap.alloc(size) {
                            let usable = heap.get_size(ptr).expect("owned");
                            assert!(usable >= size);
                            live.push((ptr, usable));
                        }
                    } else if !live.is_empty() {
                        let idx = rng.gen_range(0, live.len() - 1);
                        let (ptr, _) = live.swap_remove(idx);
                        heap.free(ptr);
                    }
                }
                // Each thread's survivors are still valid and disjoint
                // from one another.
                live.sort_unstable();
                for pair in live.windows(2) {
                    assert!(pair[0].0 + pair[0].1 <= pair[1].0);
                }
                for (ptr, _) in live {
                    heap.free(ptr);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("worker thread");
    }

    heap.check_integrity().expect("integrity after stress");
    let stats = heap.stats();
    assert_eq!(stats.total.used, 0);
    heap.force_flush();
    assert_eq!(heap.mapping().vm().reserved_bytes(), 0);
}

#[test]
fn whole_heap_lock_excludes_mutation() {
    let heap = Arc::new(test_heap());
    let seeded: Vec<usize> = (0..16)
        .map(|i| heap.alloc(64 + i * 8).expect("seed alloc"))
        .collect();

    {
        let guard = heap.lock_all();
        let used_before = guard.fsa_small.stats().used + guard.fsa_mid.stats().used;

        let contender = {
            let heap = Arc::clone(&heap);
            std::thread::spawn(move || {
                let ptr = heap.alloc(64).expect("alloc after guard drops");
                heap.free(ptr);
            })
        };
        // Give the contender a moment to block on the tier lock, then
        // confirm the view did not move underneath the guard.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let used_after = guard.fsa_small.stats().used + guard.fsa_mid.stats().used;
        assert_eq!(used_before, used_after);
        drop(guard);
        contender.join().expect("contender");
    }

    for ptr in seeded {
        heap.free(ptr);
    }
}
