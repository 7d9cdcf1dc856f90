//! Top-level tiered heap.
//!
//! [`TieredHeap`] owns one instance of every tier and routes by size:
//! two FSA heaps for small requests, two coalescing heaps for mid-size
//! requests, and the large heap above them. Frees and size queries probe
//! ownership in the same fixed order, fast small-object tiers first.
//!
//! ## Lock ordering
//!
//! Each tier serializes behind its own lock; most operations touch
//! exactly one. Whole-heap operations (snapshot, integrity walk,
//! external iteration) acquire every tier lock through [`TieredHeap::lock_all`],
//! always in this order:
//!
//! 1. fsa_small
//! 2. fsa_mid
//! 3. coalesce_mid
//! 4. coalesce_large
//! 5. large
//!
//! Never take an earlier lock while holding a later one.

use crate::coalesce::CoalesceHeap;
use crate::config::HeapConfig;
use crate::error::IntegrityError;
use crate::events::{AllocEvent, CallstackProvider, EventKind, EventSequence, EventSink};
use crate::fsa_heap::FsaHeap;
use crate::large::LargeHeap;
use crate::lock::{LockPolicy, MutexPolicy};
use crate::stats::{HeapStats, TierKind, TierStats};
use parking_lot::{MutexGuard, RwLock};
use stratheap_vm::{LazyConfig, MappingLayer, SpanOracle};
use std::sync::Arc;

/// The dispatcher: one instance of each tier plus the shared mapping
/// layer. All public entry points are callable concurrently.
pub struct TieredHeap {
    config: HeapConfig,
    layer: Arc<MappingLayer>,
    fsa_small_oracle: Arc<SpanOracle>,
    fsa_mid_oracle: Arc<SpanOracle>,
    coalesce_mid_oracle: Arc<SpanOracle>,
    coalesce_large_oracle: Arc<SpanOracle>,
    fsa_small: MutexPolicy<FsaHeap>,
    fsa_mid: MutexPolicy<FsaHeap>,
    coalesce_mid: MutexPolicy<CoalesceHeap>,
    coalesce_large: MutexPolicy<CoalesceHeap>,
    large: MutexPolicy<LargeHeap>,
    sink: RwLock<Option<Arc<dyn EventSink>>>,
    callstacks: RwLock<Option<Arc<dyn CallstackProvider>>>,
    sequence: EventSequence,
}

/// Every tier lock, held together for a consistent cross-tier view.
pub struct HeapGuard<'a> {
    pub fsa_small: MutexGuard<'a, FsaHeap>,
    pub fsa_mid: MutexGuard<'a, FsaHeap>,
    pub coalesce_mid: MutexGuard<'a, CoalesceHeap>,
    pub coalesce_large: MutexGuard<'a, CoalesceHeap>,
    pub large: MutexGuard<'a, LargeHeap>,
}

impl TieredHeap {
    /// Builds a heap from `config`.
    ///
    /// # Panics
    /// On an invalid configuration; see [`HeapConfig::validate`]. A heap
    /// that would run with overlapping tiers or undersized regions is a
    /// programmer error, not a recoverable condition.
    #[must_use]
    pub fn new(config: HeapConfig) -> Self {
        if let Err(err) = config.validate() {
            panic!("stratheap: invalid configuration: {err}");
        }
        let layer = Arc::new(MappingLayer::new(LazyConfig {
            flush_interval_ms: config.flush_interval_ms,
            start_thread: config.start_flush_thread,
        }));
        let fsa_small_oracle = Arc::new(SpanOracle::new());
        let fsa_mid_oracle = Arc::new(SpanOracle::new());
        let coalesce_mid_oracle = Arc::new(SpanOracle::new());
        let coalesce_large_oracle = Arc::new(SpanOracle::new());
        let large_oracle = Arc::new(SpanOracle::new());

        let fsa_small = FsaHeap::new(
            Arc::clone(&layer),
            Arc::clone(&fsa_small_oracle),
            &config.fsa_small,
        );
        let fsa_mid = FsaHeap::new(
            Arc::clone(&layer),
            Arc::clone(&fsa_mid_oracle),
            &config.fsa_mid,
        );
        let coalesce_mid = CoalesceHeap::new(
            Arc::clone(&layer),
            Arc::clone(&coalesce_mid_oracle),
            &config.coalesce_mid,
        );
        let coalesce_large = CoalesceHeap::new(
            Arc::clone(&layer),
            Arc::clone(&coalesce_large_oracle),
            &config.coalesce_large,
        );
        let large = LargeHeap::new(Arc::clone(&layer), large_oracle);

        log::info!(
            "stratheap: initialised (fsa <= {}/{}, coalesce <= {}/{}, large above)",
            config.fsa_small.max_size,
            config.fsa_mid.max_size,
            config.coalesce_mid.max_size,
            config.coalesce_large.max_size
        );

        Self {
            config,
            layer,
            fsa_small_oracle,
            fsa_mid_oracle,
            coalesce_mid_oracle,
            coalesce_large_oracle,
            fsa_small: MutexPolicy::new(fsa_small),
            fsa_mid: MutexPolicy::new(fsa_mid),
            coalesce_mid: MutexPolicy::new(coalesce_mid),
            coalesce_large: MutexPolicy::new(coalesce_large),
            large: MutexPolicy::new(large),
            sink: RwLock::new(None),
            callstacks: RwLock::new(None),
            sequence: EventSequence::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// The shared mapping layer (counters, flush control).
    #[must_use]
    pub fn mapping(&self) -> &MappingLayer {
        &self.layer
    }

    /// Allocates `size` bytes, returning the address or `None` when even
    /// the flush-and-retry recovery path could not find memory.
    pub fn alloc(&self, size: usize) -> Option<usize> {
        let mem = self.layer.vm();
        let (addr, tier) = if size <= self.config.fsa_small.max_size {
            (self.fsa_small.lock().alloc(mem, size), TierKind::FsaSmall)
        } else if size <= self.config.fsa_mid.max_size {
            (self.fsa_mid.lock().alloc(mem, size), TierKind::FsaMid)
        } else if size <= self.config.coalesce_mid.max_size {
            (self.coalesce_mid.lock().alloc(mem, size), TierKind::CoalesceMid)
        } else if size <= self.config.coalesce_large.max_size {
            (
                self.coalesce_large.lock().alloc(mem, size),
                TierKind::CoalesceLarge,
            )
        } else {
            (self.large.lock().alloc(size), TierKind::Large)
        };

        match addr {
            Some(addr) => {
                self.emit(EventKind::Alloc, addr, size, tier);
                Some(addr)
            }
            None => {
                self.out_of_memory_dump(size, tier);
                None
            }
        }
    }

    /// Frees an allocation, probing each tier's ownership predicate in
    /// dispatch order.
    ///
    /// # Panics
    /// On a pointer no tier owns: freeing memory that does not belong to
    /// this heap is a usage error, and continuing would risk silent
    /// corruption.
    pub fn free(&self, ptr: usize) {
        let mem = self.layer.vm();
        if self.fsa_small_oracle.owns(ptr) {
            let size = {
                let mut tier = self.fsa_small.lock();
                let size = tier.usable_size(mem, ptr);
                tier.free(mem, ptr);
                size
            };
            self.emit(EventKind::Free, ptr, size, TierKind::FsaSmall);
            return;
        }
        if self.fsa_mid_oracle.owns(ptr) {
            let size = {
                let mut tier = self.fsa_mid.lock();
                let size = tier.usable_size(mem, ptr);
                tier.free(mem, ptr);
                size
            };
            self.emit(EventKind::Free, ptr, size, TierKind::FsaMid);
            return;
        }
        if self.coalesce_mid_oracle.owns(ptr) {
            let size = {
                let mut tier = self.coalesce_mid.lock();
                let size = tier.usable_size(mem, ptr);
                tier.free(mem, ptr);
                size
            };
            self.emit(EventKind::Free, ptr, size, TierKind::CoalesceMid);
            return;
        }
        if self.coalesce_large_oracle.owns(ptr) {
            let size = {
                let mut tier = self.coalesce_large.lock();
                let size = tier.usable_size(mem, ptr);
                tier.free(mem, ptr);
                size
            };
            self.emit(EventKind::Free, ptr, size, TierKind::CoalesceLarge);
            return;
        }
        {
            let mut tier = self.large.lock();
            let size = tier.usable_size(ptr);
            if tier.free(ptr) {
                drop(tier);
                self.emit(EventKind::Free, ptr, size.unwrap_or(0), TierKind::Large);
                return;
            }
        }
        panic!("stratheap: free of pointer {ptr:#x} not owned by this heap");
    }

    /// Usable size of an allocation, or `None` for a pointer this heap
    /// does not own (the invalid sentinel).
    #[must_use]
    pub fn get_size(&self, ptr: usize) -> Option<usize> {
        let mem = self.layer.vm();
        if self.fsa_small_oracle.owns(ptr) {
            return Some(self.fsa_small.lock().usable_size(mem, ptr));
        }
        if self.fsa_mid_oracle.owns(ptr) {
            return Some(self.fsa_mid.lock().usable_size(mem, ptr));
        }
        if self.coalesce_mid_oracle.owns(ptr) {
            return Some(self.coalesce_mid.lock().usable_size(mem, ptr));
        }
        if self.coalesce_large_oracle.owns(ptr) {
            return Some(self.coalesce_large.lock().usable_size(mem, ptr));
        }
        self.large.lock().usable_size(ptr)
    }

    /// Grows or shrinks an allocation. Never grows in place: when the
    /// new size does not fit the current block, this is alloc + copy +
    /// free. Shrinks and growth within the block's rounded size return
    /// the same pointer.
    pub fn realloc(&self, ptr: usize, new_size: usize) -> Option<usize> {
        if ptr == 0 {
            return self.alloc(new_size);
        }
        if new_size == 0 {
            self.free(ptr);
            return None;
        }
        let current = self
            .get_size(ptr)
            .unwrap_or_else(|| panic!("stratheap: realloc of pointer {ptr:#x} not owned by this heap"));
        if new_size <= current {
            return Some(ptr);
        }
        let fresh = self.alloc(new_size)?;
        self.layer.vm().copy(fresh, ptr, current.min(new_size));
        self.free(ptr);
        Some(fresh)
    }

    /// Acquires every tier lock in the documented order. While the guard
    /// lives, no other thread can mutate any tier.
    #[must_use]
    pub fn lock_all(&self) -> HeapGuard<'_> {
        HeapGuard {
            fsa_small: self.fsa_small.lock(),
            fsa_mid: self.fsa_mid.lock(),
            coalesce_mid: self.coalesce_mid.lock(),
            coalesce_large: self.coalesce_large.lock(),
            large: self.large.lock(),
        }
    }

    /// Full-heap consistency walk under the whole-heap lock.
    pub fn check_integrity(&self) -> Result<(), IntegrityError> {
        let guard = self.lock_all();
        let mem = self.layer.vm();
        guard.fsa_small.check_integrity(mem)?;
        guard.fsa_mid.check_integrity(mem)?;
        guard.coalesce_mid.check_integrity(mem)?;
        guard.coalesce_large.check_integrity(mem)?;
        guard.large.check_integrity()?;
        mem.check_counters()
            .map_err(|err| IntegrityError::VmCounters(err.to_string()))
    }

    /// Consistent cross-tier stats snapshot.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let guard = self.lock_all();
        let fsa_small = guard.fsa_small.stats();
        let fsa_mid = guard.fsa_mid.stats();
        let coalesce_mid = guard.coalesce_mid.stats();
        let coalesce_large = guard.coalesce_large.stats();
        let large = guard.large.stats();
        let mut total = TierStats::default();
        for tier in [fsa_small, fsa_mid, coalesce_mid, coalesce_large, large] {
            total.absorb(tier);
        }
        HeapStats {
            fsa_small,
            fsa_mid,
            coalesce_mid,
            coalesce_large,
            large,
            total,
            os_reserved: self.layer.vm().reserved_bytes(),
            os_committed: self.layer.vm().committed_bytes(),
        }
    }

    /// Serializes a stats snapshot and hands the tagged bytes to `sink`.
    pub fn send_stats(&self, mut sink: impl FnMut(&[u8])) {
        let bytes = self.stats().tagged_bytes();
        sink(&bytes);
    }

    /// Installs the allocation event consumer.
    pub fn set_event_sink(&self, sink: Arc<dyn EventSink>) {
        *self.sink.write() = Some(sink);
    }

    /// Installs the callstack id provider used to tag events.
    pub fn set_callstack_provider(&self, provider: Arc<dyn CallstackProvider>) {
        *self.callstacks.write() = Some(provider);
    }

    /// Executes all deferred releases immediately (test observability).
    pub fn force_flush(&self) {
        self.layer.force_flush();
    }

    /// Stops background work. `clean` drains the lazy cache, joins the
    /// flush thread and returns every reservation to the OS; the abort
    /// path just signals the thread and walks away.
    pub fn destroy(&self, clean: bool) {
        self.layer.shutdown(clean);
        if clean {
            self.layer.vm().release_all();
        }
    }

    fn emit(&self, kind: EventKind, addr: usize, size: usize, tier: TierKind) {
        let sink = self.sink.read();
        let Some(sink) = sink.as_ref() else {
            return;
        };
        let callstack = self
            .callstacks
            .read()
            .as_ref()
            .map_or(0, |provider| provider.current());
        sink.record(&AllocEvent {
            sequence: self.sequence.next(),
            kind,
            addr,
            size,
            tier,
            callstack,
        });
    }

    fn out_of_memory_dump(&self, size: usize, tier: TierKind) {
        let stats = self.stats();
        log::error!(
            "stratheap: out of memory allocating {size} bytes in {}; reserved {} committed {} used {}",
            tier.as_str(),
            stats.os_reserved,
            stats.os_committed,
            stats.total.used,
        );
    }
}

impl Drop for TieredHeap {
    fn drop(&mut self) {
        self.layer.shutdown(true);
    }
}
