//! Page-granularity heap backing the fixed-size allocators.
//!
//! Hands out fixed-size pages carved from reserved regions. Each region
//! tracks occupancy with one bit per page; allocation scans the region
//! list oldest-first and within a region uses a monotonically advanced
//! hint, falling back to a true first-clear-bit scan only when the
//! hinted page is occupied. Backing memory is committed per OS-page
//! group: the first page of a group to be used commits it, the last one
//! freed decommits it, and a region whose occupancy reaches zero is
//! returned to the lazy release cache.

use stratheap_vm::{MappingLayer, SpanOracle, page_size};
use std::sync::Arc;

const BITS_PER_WORD: usize = usize::BITS as usize;

/// Configuration for one page heap instance.
#[derive(Debug, Clone, Copy)]
pub struct PageHeapConfig {
    /// Size of one page handed out by this heap. Power of two.
    pub page_bytes: usize,
    /// Pages per reserved region.
    pub pages_per_region: usize,
}

struct PageRegion {
    base: usize,
    bits: Vec<usize>,
    used: usize,
    hint: usize,
}

impl PageRegion {
    fn bit(&self, idx: usize) -> bool {
        self.bits[idx / BITS_PER_WORD] & (1 << (idx % BITS_PER_WORD)) != 0
    }

    fn set(&mut self, idx: usize) {
        self.bits[idx / BITS_PER_WORD] |= 1 << (idx % BITS_PER_WORD);
    }

    fn clear(&mut self, idx: usize) {
        self.bits[idx / BITS_PER_WORD] &= !(1 << (idx % BITS_PER_WORD));
    }

    /// First clear bit below `limit`, if any.
    fn first_clear(&self, limit: usize) -> Option<usize> {
        for (word_idx, &word) in self.bits.iter().enumerate() {
            if word == usize::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let idx = word_idx * BITS_PER_WORD + bit;
            if idx < limit {
                return Some(idx);
            }
            return None;
        }
        None
    }

    fn popcount(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Fixed-size page allocator over reserved regions.
pub struct PageHeap {
    layer: Arc<MappingLayer>,
    oracle: Arc<SpanOracle>,
    page_bytes: usize,
    pages_per_region: usize,
    region_bytes: usize,
    /// Heap pages per commit group (one OS page's worth, minimum one).
    pages_per_group: usize,
    regions: Vec<PageRegion>,
    committed_bytes: usize,
}

impl PageHeap {
    pub fn new(layer: Arc<MappingLayer>, oracle: Arc<SpanOracle>, config: PageHeapConfig) -> Self {
        assert!(config.page_bytes.is_power_of_two(), "page size must be a power of two");
        assert!(config.pages_per_region > 0, "region must hold at least one page");
        let pages_per_group = (page_size() / config.page_bytes).max(1);
        Self {
            layer,
            oracle,
            page_bytes: config.page_bytes,
            pages_per_region: config.pages_per_region,
            region_bytes: config.page_bytes * config.pages_per_region,
            pages_per_group,
            regions: Vec::new(),
            committed_bytes: 0,
        }
    }

    /// Allocates one page, committed and ready to write.
    pub fn alloc(&mut self) -> Option<usize> {
        let region_idx = match self
            .regions
            .iter()
            .position(|r| r.used < self.pages_per_region)
        {
            Some(idx) => idx,
            None => self.create_region()?,
        };

        let region = &mut self.regions[region_idx];
        let idx = if region.hint < self.pages_per_region && !region.bit(region.hint) {
            region.hint
        } else {
            region
                .first_clear(self.pages_per_region)
                .expect("region reported free capacity")
        };

        let group_first = idx - idx % self.pages_per_group;
        let group_len = self.pages_per_group.min(self.pages_per_region - group_first);
        let group_was_empty = (group_first..group_first + group_len).all(|i| !region.bit(i));

        region.set(idx);
        region.used += 1;
        region.hint = idx + 1;

        let page = region.base + idx * self.page_bytes;
        if group_was_empty {
            let group_addr = region.base + group_first * self.page_bytes;
            let group_bytes = group_len * self.page_bytes;
            if !self.layer.commit(group_addr, group_bytes) {
                let region = &mut self.regions[region_idx];
                region.clear(idx);
                region.used -= 1;
                log::warn!("page heap: commit of {group_bytes:#x} at {group_addr:#x} failed");
                return None;
            }
            self.committed_bytes += group_bytes;
        }
        Some(page)
    }

    /// Returns a page. Decommits its group when the group empties and
    /// destroys the region when the region empties.
    pub fn free(&mut self, page: usize) {
        let region_idx = self
            .regions
            .iter()
            .position(|r| page >= r.base && page < r.base + self.region_bytes)
            .unwrap_or_else(|| panic!("page heap: free of foreign page {page:#x}"));
        let region = &mut self.regions[region_idx];
        let offset = page - region.base;
        assert!(
            offset % self.page_bytes == 0,
            "page heap: free of unaligned address {page:#x}"
        );
        let idx = offset / self.page_bytes;
        assert!(region.bit(idx), "page heap: double free of page {page:#x}");

        region.clear(idx);
        region.used -= 1;
        region.hint = region.hint.min(idx);

        let group_first = idx - idx % self.pages_per_group;
        let group_len = self.pages_per_group.min(self.pages_per_region - group_first);
        let group_now_empty = (group_first..group_first + group_len).all(|i| !region.bit(i));
        if group_now_empty {
            let group_addr = region.base + group_first * self.page_bytes;
            let group_bytes = group_len * self.page_bytes;
            self.layer.decommit(group_addr, group_bytes);
            self.committed_bytes -= group_bytes;
        }

        if region.used == 0 {
            let base = region.base;
            self.oracle.remove_span(base, self.region_bytes);
            self.regions.remove(region_idx);
            self.layer.release(base);
            log::debug!("page heap: region {base:#x} emptied and released");
        }
    }

    /// O(region count) ownership check, valid under the tier lock. The
    /// lock-free equivalent is the shared [`SpanOracle`] this heap
    /// publishes regions to.
    #[must_use]
    pub fn owns(&self, addr: usize) -> bool {
        self.regions
            .iter()
            .any(|r| addr >= r.base && addr < r.base + self.region_bytes)
    }

    fn create_region(&mut self) -> Option<usize> {
        let align = self.page_bytes.max(page_size());
        let base = self.layer.reserve(self.region_bytes, align)?;
        let words = self.pages_per_region.div_ceil(BITS_PER_WORD);
        // Publish to the oracle before the region becomes reachable.
        self.oracle.insert_span(base, self.region_bytes);
        self.regions.push(PageRegion {
            base,
            bits: vec![0; words],
            used: 0,
            hint: 0,
        });
        log::debug!(
            "page heap: new region {base:#x} ({} pages of {:#x})",
            self.pages_per_region,
            self.page_bytes
        );
        Some(self.regions.len() - 1)
    }

    /// Every currently allocated page, for integrity walks.
    #[must_use]
    pub fn allocated_pages(&self) -> Vec<usize> {
        let mut pages = Vec::new();
        for region in &self.regions {
            for idx in 0..self.pages_per_region {
                if region.bit(idx) {
                    pages.push(region.base + idx * self.page_bytes);
                }
            }
        }
        pages
    }

    /// Verifies bitfield populations against recorded occupancy.
    pub fn check_integrity(&self) -> Result<(), crate::error::IntegrityError> {
        for region in &self.regions {
            let popcount = region.popcount();
            if popcount != region.used {
                return Err(crate::error::IntegrityError::BitfieldMismatch {
                    base: region.base,
                    popcount,
                    recorded: region.used,
                });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn page_bytes(&self) -> usize {
        self.page_bytes
    }

    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        self.regions.len() * self.region_bytes
    }

    #[must_use]
    pub fn committed_bytes(&self) -> usize {
        self.committed_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratheap_vm::LazyConfig;

    fn heap(page_bytes: usize, pages_per_region: usize) -> PageHeap {
        let layer = Arc::new(MappingLayer::new(LazyConfig {
            flush_interval_ms: 1000,
            start_thread: false,
        }));
        let oracle = Arc::new(SpanOracle::new());
        PageHeap::new(
            layer,
            oracle,
            PageHeapConfig {
                page_bytes,
                pages_per_region,
            },
        )
    }

    #[test]
    fn alloc_returns_distinct_aligned_pages() {
        let mut heap = heap(64 * 1024, 8);
        let a = heap.alloc().expect("page");
        let b = heap.alloc().expect("page");
        assert_ne!(a, b);
        assert_eq!(a % (64 * 1024), 0);
        assert_eq!(b % (64 * 1024), 0);
        assert_eq!(heap.region_count(), 1);
        heap.check_integrity().expect("integrity");
    }

    #[test]
    fn freed_page_is_reused_first() {
        let mut heap = heap(64 * 1024, 8);
        let a = heap.alloc().expect("page");
        let _b = heap.alloc().expect("page");
        heap.free(a);
        // The hint retreats to the freed slot, so it is handed out again.
        let c = heap.alloc().expect("page");
        assert_eq!(c, a);
    }

    #[test]
    fn region_grows_and_oldest_is_preferred() {
        let mut heap = heap(64 * 1024, 2);
        let pages: Vec<usize> = (0..4).map(|_| heap.alloc().expect("page")).collect();
        assert_eq!(heap.region_count(), 2);
        // Free one page in the older region; next alloc lands there, not
        // in the newer region.
        heap.free(pages[0]);
        let again = heap.alloc().expect("page");
        assert_eq!(again, pages[0]);
    }

    #[test]
    fn empty_region_is_released() {
        let mut heap = heap(64 * 1024, 2);
        let a = heap.alloc().expect("page");
        let b = heap.alloc().expect("page");
        assert_eq!(heap.reserved_bytes(), 2 * 64 * 1024);
        heap.free(a);
        assert_eq!(heap.region_count(), 1);
        heap.free(b);
        assert_eq!(heap.region_count(), 0);
        assert_eq!(heap.reserved_bytes(), 0);
        assert_eq!(heap.committed_bytes(), 0);
    }

    #[test]
    fn owns_tracks_regions() {
        let mut heap = heap(64 * 1024, 2);
        let a = heap.alloc().expect("page");
        assert!(heap.owns(a));
        assert!(heap.owns(a + 100));
        assert!(!heap.owns(0x10));
        let b = heap.alloc().expect("page");
        heap.free(a);
        heap.free(b);
        assert!(!heap.owns(a));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut heap = heap(64 * 1024, 4);
        let a = heap.alloc().expect("page");
        let _b = heap.alloc().expect("page");
        heap.free(a);
        heap.free(a);
    }

    #[test]
    fn allocated_pages_enumerates_live_pages() {
        let mut heap = heap(64 * 1024, 4);
        let a = heap.alloc().expect("page");
        let b = heap.alloc().expect("page");
        heap.free(a);
        assert_eq!(heap.allocated_pages(), vec![b]);
    }
}
