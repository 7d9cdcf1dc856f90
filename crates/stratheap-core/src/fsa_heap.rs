//! Size-indexed table of fixed-size allocators.
//!
//! One [`FsaHeap`] owns a [`PageHeap`] and a set of [`Fsa`] instances at
//! every granularity step up to the tier's maximum. Dispatch rounds the
//! request up to the next step and indexes a table built once at
//! startup: FSAs initialize in increasing size order and every unfilled
//! lower index back-fills to the most recently initialized FSA, so any
//! size in `(prev_max, this_max]` lands on the right instance.

use crate::config::FsaTierConfig;
use crate::error::IntegrityError;
use crate::fsa::Fsa;
use crate::page_heap::{PageHeap, PageHeapConfig};
use crate::stats::TierStats;
use stratheap_vm::{MappingLayer, SpanOracle, VirtualMemory};
use std::sync::Arc;

pub struct FsaHeap {
    granularity: usize,
    max_size: usize,
    page_bytes: usize,
    page_heap: PageHeap,
    /// FSAs in increasing slot-size order.
    fsas: Vec<Fsa>,
    /// `ceil(size / granularity)` -> index into `fsas`.
    table: Vec<u32>,
}

impl FsaHeap {
    pub fn new(layer: Arc<MappingLayer>, oracle: Arc<SpanOracle>, config: &FsaTierConfig) -> Self {
        let page_heap = PageHeap::new(
            layer,
            oracle,
            PageHeapConfig {
                page_bytes: config.page_size,
                pages_per_region: config.pages_per_region,
            },
        );

        let slots = config.max_size / config.granularity;
        let mut fsas = Vec::with_capacity(slots);
        let mut table = vec![0u32; slots + 1];
        let mut filled = 0usize;
        for step in 1..=slots {
            let size = step * config.granularity;
            fsas.push(Fsa::new(size, config.page_size));
            let fsa_index = (fsas.len() - 1) as u32;
            for entry in table.iter_mut().take(step + 1).skip(filled + 1) {
                *entry = fsa_index;
            }
            filled = step;
        }

        Self {
            granularity: config.granularity,
            max_size: config.max_size,
            page_bytes: config.page_size,
            page_heap,
            fsas,
            table,
        }
    }

    /// Largest request this tier serves.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn alloc(&mut self, mem: &VirtualMemory, size: usize) -> Option<usize> {
        debug_assert!(size <= self.max_size);
        let size = size.max(1);
        let index = self.table[size.div_ceil(self.granularity)] as usize;
        let fsa = &mut self.fsas[index];
        fsa.alloc(&mut self.page_heap, mem)
    }

    /// Frees a pointer owned by this tier. The owning FSA is recovered
    /// from the slot size embedded in the page header.
    pub fn free(&mut self, mem: &VirtualMemory, ptr: usize) {
        let index = self.fsa_for_ptr(mem, ptr);
        let fsa = &mut self.fsas[index];
        fsa.free(&mut self.page_heap, mem, ptr);
    }

    /// Rounded slot size for an owned pointer.
    #[must_use]
    pub fn usable_size(&self, mem: &VirtualMemory, ptr: usize) -> usize {
        let index = self.fsa_for_ptr(mem, ptr);
        self.fsas[index].usable_size(mem, ptr)
    }

    /// Ownership check against the backing page heap's region list.
    #[must_use]
    pub fn owns(&self, ptr: usize) -> bool {
        self.page_heap.owns(ptr)
    }

    fn fsa_for_ptr(&self, mem: &VirtualMemory, ptr: usize) -> usize {
        let page = stratheap_vm::align_down(ptr, self.page_bytes);
        let slot_size = Fsa::page_slot_size(mem, page);
        assert!(
            slot_size >= self.granularity
                && slot_size <= self.max_size
                && slot_size % self.granularity == 0,
            "fsa heap: page {page:#x} carries foreign slot size {slot_size}"
        );
        self.table[slot_size / self.granularity] as usize
    }

    /// Byte counters for this tier, derived from the live allocator
    /// counts so they are exact at any point under the tier lock.
    #[must_use]
    pub fn stats(&self) -> TierStats {
        let mut used = 0;
        let mut unused = 0;
        let mut overhead = 0;
        for fsa in &self.fsas {
            used += fsa.used_slots * fsa.slot_size();
            let total_slots = fsa.page_count * fsa.slots_per_page();
            unused += (total_slots - fsa.used_slots) * fsa.slot_size();
            overhead += fsa.page_count * fsa.page_overhead();
        }
        TierStats {
            used,
            unused,
            overhead,
            reserved: self.page_heap.reserved_bytes(),
        }
    }

    /// Full consistency walk: page bitfields, page headers, free lists,
    /// and the cross-check between page ownership and FSA accounting.
    pub fn check_integrity(&self, mem: &VirtualMemory) -> Result<(), IntegrityError> {
        self.page_heap.check_integrity()?;
        for fsa in &self.fsas {
            fsa.check_integrity(mem)?;
        }
        // Every live page must carry a slot size one of our FSAs serves,
        // and per-FSA page counts must agree with the page heap.
        let mut counts = vec![0usize; self.fsas.len()];
        for page in self.page_heap.allocated_pages() {
            let slot_size = Fsa::page_slot_size(mem, page);
            if slot_size % self.granularity != 0 || slot_size > self.max_size {
                return Err(IntegrityError::MarkerMismatch {
                    page,
                    found: slot_size,
                });
            }
            counts[self.table[slot_size / self.granularity] as usize] += 1;
        }
        for (fsa, &pages) in self.fsas.iter().zip(&counts) {
            if fsa.page_count != pages {
                return Err(IntegrityError::FreeListMismatch {
                    page: 0,
                    listed: pages,
                    expected: fsa.page_count,
                });
            }
        }
        Ok(())
    }
}
