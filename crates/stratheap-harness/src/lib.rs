//! Allocation-storm harness.
//!
//! Drives a [`TieredHeap`] through hostile allocation patterns and
//! reports fragmentation and accounting metrics. Unlike the core
//! crates, this one dereferences the pointers it is given: every
//! allocation is filled with a canary pattern at birth and verified at
//! death, so cross-allocation corruption shows up as a hard failure.

use serde::Serialize;
use stratheap_core::{HeapConfig, TieredHeap};

/// Deterministic PRNG so storm runs are reproducible from a seed.
#[derive(Debug, Clone, Copy)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        low + (self.next_u64() as usize) % (high_inclusive - low + 1)
    }
}

/// Hostile allocation patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StormKind {
    /// Fill to a high-water mark, drain completely, repeat.
    Sawtooth,
    /// Fill, then drain in reverse allocation order.
    InverseSawtooth,
    /// Random alloc/free/realloc mix.
    RandomChurn,
    /// Alternate sizes straddling tier boundaries.
    TierThrash,
    /// Repeatedly fill and empty whole regions.
    RegionExhaustion,
}

impl StormKind {
    #[must_use]
    pub fn all() -> [StormKind; 5] {
        [
            StormKind::Sawtooth,
            StormKind::InverseSawtooth,
            StormKind::RandomChurn,
            StormKind::TierThrash,
            StormKind::RegionExhaustion,
        ]
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StormKind::Sawtooth => "sawtooth",
            StormKind::InverseSawtooth => "inverse_sawtooth",
            StormKind::RandomChurn => "random_churn",
            StormKind::TierThrash => "tier_thrash",
            StormKind::RegionExhaustion => "region_exhaustion",
        }
    }
}

/// Result of one storm run.
#[derive(Debug, Clone, Serialize)]
pub struct StormMetrics {
    pub storm: &'static str,
    pub ops: usize,
    pub peak_live_bytes: usize,
    pub peak_os_committed: usize,
    /// Peak committed over peak live; 1.0 is perfect, growth is
    /// fragmentation plus metadata.
    pub commit_overhead_ratio: f64,
    pub alloc_failures: usize,
    pub integrity_ok: bool,
    /// OS reservations left after drain and flush (should be zero).
    pub leaked_reserved: usize,
}

struct LiveAlloc {
    ptr: usize,
    len: usize,
    canary: u8,
}

/// One storm against one heap instance.
pub struct StormRunner {
    heap: TieredHeap,
    rng: XorShift64,
    live: Vec<LiveAlloc>,
    ops: usize,
    live_bytes: usize,
    peak_live_bytes: usize,
    peak_os_committed: usize,
    alloc_failures: usize,
}

impl StormRunner {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, HeapConfig {
            start_flush_thread: false,
            ..HeapConfig::default()
        })
    }

    #[must_use]
    pub fn with_config(seed: u64, config: HeapConfig) -> Self {
        Self {
            heap: TieredHeap::new(config),
            rng: XorShift64::new(seed),
            live: Vec::new(),
            ops: 0,
            live_bytes: 0,
            peak_live_bytes: 0,
            peak_os_committed: 0,
            alloc_failures: 0,
        }
    }

    #[must_use]
    pub fn heap(&self) -> &TieredHeap {
        &self.heap
    }

    pub fn run(mut self, storm: StormKind, target_ops: usize) -> StormMetrics {
        match storm {
            StormKind::Sawtooth => self.sawtooth(target_ops, false),
            StormKind::InverseSawtooth => self.sawtooth(target_ops, true),
            StormKind::RandomChurn => self.random_churn(target_ops),
            StormKind::TierThrash => self.tier_thrash(target_ops),
            StormKind::RegionExhaustion => self.region_exhaustion(target_ops),
        }
        self.drain_all();
        let integrity_ok = self.heap.check_integrity().is_ok();
        self.heap.force_flush();
        let leaked_reserved = self.heap.mapping().vm().reserved_bytes();
        StormMetrics {
            storm: storm.as_str(),
            ops: self.ops,
            peak_live_bytes: self.peak_live_bytes,
            peak_os_committed: self.peak_os_committed,
            commit_overhead_ratio: if self.peak_live_bytes == 0 {
                0.0
            } else {
                self.peak_os_committed as f64 / self.peak_live_bytes as f64
            },
            alloc_failures: self.alloc_failures,
            integrity_ok,
            leaked_reserved,
        }
    }

    fn sawtooth(&mut self, target_ops: usize, reverse: bool) {
        let high_water = 512;
        while self.ops < target_ops {
            while self.live.len() < high_water && self.ops < target_ops {
                let size = self.storm_size();
                self.alloc_one(size);
            }
            if reverse {
                while let Some(entry) = self.live.pop() {
                    self.free_entry(entry);
                }
            } else {
                for entry in std::mem::take(&mut self.live) {
                    self.free_entry(entry);
                }
            }
        }
    }

    fn random_churn(&mut self, target_ops: usize) {
        while self.ops < target_ops {
            let roll = self.rng.gen_range(0, 99);
            if roll < 50 || self.live.is_empty() {
                let size = self.storm_size();
                self.alloc_one(size);
            } else if roll < 85 {
                let idx = self.rng.gen_range(0, self.live.len() - 1);
                let entry = self.live.swap_remove(idx);
                self.free_entry(entry);
            } else {
                let idx = self.rng.gen_range(0, self.live.len() - 1);
                let new_size = self.storm_size();
                self.realloc_entry(idx, new_size);
            }
        }
    }

    fn tier_thrash(&mut self, target_ops: usize) {
        // Sizes chosen to sit one step either side of each tier boundary.
        let config = self.heap.config().clone();
        let sizes = [
            config.fsa_small.max_size - 1,
            config.fsa_small.max_size + 1,
            config.fsa_mid.max_size - 1,
            config.fsa_mid.max_size + 1,
            config.coalesce_mid.max_size - 1,
            config.coalesce_mid.max_size + 1,
            config.coalesce_large.max_size - 1,
            config.coalesce_large.max_size + 1,
        ];
        while self.ops < target_ops {
            let size = sizes[self.ops % sizes.len()];
            self.alloc_one(size);
            if self.live.len() >= 128 {
                let entry = self.live.remove(0);
                self.free_entry(entry);
            }
        }
    }

    fn region_exhaustion(&mut self, target_ops: usize) {
        // Blocks sized so a handful exhausts a coalesce region, forcing
        // steady region create/destroy traffic through the lazy cache.
        let block = self.heap.config().coalesce_large.max_size;
        while self.ops < target_ops {
            for _ in 0..40 {
                self.alloc_one(block);
            }
            for entry in std::mem::take(&mut self.live) {
                self.free_entry(entry);
            }
        }
    }

    fn storm_size(&mut self) -> usize {
        match self.rng.gen_range(0, 9) {
            0..=4 => self.rng.gen_range(1, 256),
            5..=6 => self.rng.gen_range(257, 4096),
            7..=8 => self.rng.gen_range(4097, 128 * 1024),
            _ => self.rng.gen_range(128 * 1024 + 1, 2 * 1024 * 1024),
        }
    }

    fn alloc_one(&mut self, size: usize) {
        self.ops += 1;
        let Some(ptr) = self.heap.alloc(size) else {
            self.alloc_failures += 1;
            return;
        };
        let len = self.heap.get_size(ptr).expect("fresh pointer is owned");
        assert!(len >= size);
        let canary = (self.rng.next_u64() & 0xFF) as u8;
        write_canary(ptr, len, canary);
        self.live.push(LiveAlloc { ptr, len, canary });
        self.live_bytes += len;
        self.note_watermarks();
    }

    fn free_entry(&mut self, entry: LiveAlloc) {
        self.ops += 1;
        check_canary(entry.ptr, entry.len, entry.canary);
        self.live_bytes -= entry.len;
        self.heap.free(entry.ptr);
    }

    fn realloc_entry(&mut self, idx: usize, new_size: usize) {
        self.ops += 1;
        let entry = self.live.swap_remove(idx);
        let verify = entry.len.min(new_size);
        check_canary(entry.ptr, verify, entry.canary);
        self.live_bytes -= entry.len;
        let Some(ptr) = self.heap.realloc(entry.ptr, new_size) else {
            self.alloc_failures += 1;
            return;
        };
        // The surviving prefix kept its bytes across the move.
        check_canary(ptr, verify, entry.canary);
        let len = self.heap.get_size(ptr).expect("owned");
        write_canary(ptr, len, entry.canary);
        self.live.push(LiveAlloc {
            ptr,
            len,
            canary: entry.canary,
        });
        self.live_bytes += len;
        self.note_watermarks();
    }

    fn drain_all(&mut self) {
        for entry in std::mem::take(&mut self.live) {
            self.free_entry(entry);
        }
    }

    fn note_watermarks(&mut self) {
        self.peak_live_bytes = self.peak_live_bytes.max(self.live_bytes);
        self.peak_os_committed = self
            .peak_os_committed
            .max(self.heap.mapping().vm().committed_bytes());
    }
}

/// Fills an allocation with its canary byte.
pub fn write_canary(ptr: usize, len: usize, canary: u8) {
    // SAFETY: ptr/len is a live allocation owned by this harness.
    unsafe { std::ptr::write_bytes(ptr as *mut u8, canary, len) };
}

/// Verifies an allocation still holds its canary byte everywhere.
pub fn check_canary(ptr: usize, len: usize, canary: u8) {
    // SAFETY: ptr/len is a live allocation owned by this harness.
    let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, len) };
    if let Some(pos) = bytes.iter().position(|&b| b != canary) {
        panic!(
            "canary mismatch at {:#x}+{pos}: expected {canary:#04x}, found {:#04x}",
            ptr, bytes[pos]
        );
    }
}
