//! Large-object heap.
//!
//! Requests above every bounded tier map straight to a dedicated
//! reservation, tracked host-side in a hash map from base address to
//! record. There is nothing to coalesce and nothing to split: one
//! allocation, one mapping, released in full on free.

use crate::stats::TierStats;
use stratheap_vm::{align_up, page_size, MappingLayer, SpanOracle};
use std::collections::HashMap;
use std::sync::Arc;

/// Record of one oversized allocation.
#[derive(Debug, Clone, Copy)]
pub struct LargeAllocation {
    /// Size the caller asked for.
    pub requested: usize,
    /// Page-rounded size actually mapped.
    pub mapped: usize,
}

pub struct LargeHeap {
    layer: Arc<MappingLayer>,
    oracle: Arc<SpanOracle>,
    allocations: HashMap<usize, LargeAllocation>,
    used_bytes: usize,
    mapped_bytes: usize,
}

impl LargeHeap {
    pub fn new(layer: Arc<MappingLayer>, oracle: Arc<SpanOracle>) -> Self {
        Self {
            layer,
            oracle,
            allocations: HashMap::new(),
            used_bytes: 0,
            mapped_bytes: 0,
        }
    }

    pub fn alloc(&mut self, size: usize) -> Option<usize> {
        let mapped = align_up(size.max(1), page_size());
        let base = self.layer.reserve(mapped, page_size())?;
        if !self.layer.commit(base, mapped) {
            self.layer.release(base);
            return None;
        }
        self.oracle.insert_span(base, mapped);
        self.allocations.insert(
            base,
            LargeAllocation {
                requested: size,
                mapped,
            },
        );
        self.used_bytes += size;
        self.mapped_bytes += mapped;
        log::trace!("large: mapped {mapped:#x} bytes at {base:#x} for request {size}");
        Some(base)
    }

    /// Releases a mapping. Returns false when `ptr` is not a base this
    /// heap handed out — "not mine", so the dispatcher can keep probing.
    pub fn free(&mut self, ptr: usize) -> bool {
        let Some(record) = self.allocations.remove(&ptr) else {
            return false;
        };
        self.oracle.remove_span(ptr, record.mapped);
        self.layer.decommit(ptr, record.mapped);
        self.layer.release(ptr);
        self.used_bytes -= record.requested;
        self.mapped_bytes -= record.mapped;
        true
    }

    /// Requested size of an owned mapping; `None` is the invalid
    /// sentinel for pointers this heap does not know.
    #[must_use]
    pub fn usable_size(&self, ptr: usize) -> Option<usize> {
        self.allocations.get(&ptr).map(|r| r.requested)
    }

    #[must_use]
    pub fn owns(&self, ptr: usize) -> bool {
        self.allocations.contains_key(&ptr)
    }

    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    #[must_use]
    pub fn stats(&self) -> TierStats {
        TierStats {
            used: self.used_bytes,
            unused: self.mapped_bytes - self.used_bytes,
            overhead: 0,
            reserved: self.mapped_bytes,
        }
    }

    /// Every record must still correspond to a live reservation.
    pub fn check_integrity(&self) -> Result<(), crate::error::IntegrityError> {
        for &addr in self.allocations.keys() {
            if self.layer.vm().reservation_info(addr).is_none() {
                return Err(crate::error::IntegrityError::LargeMappingMissing { addr });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratheap_vm::LazyConfig;

    fn fixture() -> (Arc<MappingLayer>, LargeHeap) {
        let layer = Arc::new(MappingLayer::new(LazyConfig {
            flush_interval_ms: 1000,
            start_thread: false,
        }));
        let oracle = Arc::new(SpanOracle::new());
        let heap = LargeHeap::new(Arc::clone(&layer), oracle);
        (layer, heap)
    }

    #[test]
    fn alloc_maps_page_rounded() {
        let (layer, mut heap) = fixture();
        let a = heap.alloc(2_000_000).expect("alloc");
        assert_eq!(a % page_size(), 0);
        assert_eq!(heap.usable_size(a), Some(2_000_000));
        let stats = heap.stats();
        assert_eq!(stats.used, 2_000_000);
        assert_eq!(stats.reserved, align_up(2_000_000, page_size()));
        heap.check_integrity().expect("integrity");
        assert!(heap.free(a));
        // The lazy cache still holds the mapping; flush to observe the
        // OS-level reservation drop to zero.
        layer.force_flush();
        assert_eq!(layer.vm().reserved_bytes(), 0);
    }

    #[test]
    fn free_of_unknown_pointer_reports_not_mine() {
        let (_layer, mut heap) = fixture();
        assert!(!heap.free(0xDEAD_0000));
        assert_eq!(heap.usable_size(0xDEAD_0000), None);
    }

    #[test]
    fn distinct_mappings_do_not_interfere() {
        let (layer, mut heap) = fixture();
        let a = heap.alloc(1_500_000).expect("alloc");
        let b = heap.alloc(3_000_000).expect("alloc");
        assert_ne!(a, b);
        assert!(heap.owns(a));
        assert!(heap.owns(b));
        assert!(heap.free(a));
        assert!(heap.owns(b));
        assert_eq!(heap.usable_size(b), Some(3_000_000));
        assert!(heap.free(b));
        assert_eq!(heap.allocation_count(), 0);
        layer.force_flush();
        assert_eq!(layer.vm().reserved_bytes(), 0);
    }
}
