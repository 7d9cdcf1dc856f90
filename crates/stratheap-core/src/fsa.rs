//! Fixed-size slot allocator.
//!
//! One [`Fsa`] serves exactly one slot size out of pages taken from a
//! [`PageHeap`](crate::page_heap::PageHeap). Each page starts with a
//! small header (marker word for validation, slot size, used count, free
//! list head, next-page link) and the rest is carved into equal slots. A
//! free slot's first word is its link in the page's free list; the byte
//! range is either a live value owned by the caller or that link, never
//! both, and only `alloc`/`free` switch the interpretation.
//!
//! Pages with at least one free slot sit on an address-sorted free-page
//! list threaded through the header's next-page word; full pages are
//! unlinked. A page whose last slot frees is returned to the page heap.

use crate::page_heap::PageHeap;
use stratheap_vm::VirtualMemory;

const WORD: usize = std::mem::size_of::<usize>();

/// Byte offsets of the page header words.
const OFF_MARKER: usize = 0;
const OFF_SLOT_SIZE: usize = WORD;
const OFF_USED: usize = 2 * WORD;
const OFF_FREE_HEAD: usize = 3 * WORD;
const OFF_NEXT_PAGE: usize = 4 * WORD;
const HEADER_BYTES: usize = 5 * WORD;

/// Upper bound on the first slot offset across all alignments this
/// allocator produces; the config validator uses it to guarantee a page
/// always holds at least one slot.
pub(crate) const FIRST_SLOT_MAX_OFFSET: usize = 64;

/// XORed with the slot size to form the page marker word, so a marker
/// both identifies the page as ours and binds it to one slot size.
const PAGE_MARKER: usize = 0x5354_5241_5041_4745; // "STRAPAGE"

/// Sentinel meaning "no page" / "no slot".
const NIL: usize = 0;

/// Fixed-size slot allocator for a single slot size.
pub struct Fsa {
    slot_size: usize,
    align: usize,
    page_bytes: usize,
    first_slot: usize,
    slots_per_page: usize,
    /// Address of the first page with free slots; pages link through
    /// their `OFF_NEXT_PAGE` word in ascending address order.
    free_pages: usize,
    /// Pages currently owned (free-listed and full).
    pub(crate) page_count: usize,
    /// Slots currently allocated out.
    pub(crate) used_slots: usize,
}

impl Fsa {
    pub fn new(slot_size: usize, page_bytes: usize) -> Self {
        assert!(slot_size >= WORD, "slot must hold a free-list link");
        assert!(slot_size % WORD == 0, "slot size must be word-aligned");
        let align = if slot_size % 16 == 0 { 16 } else { WORD };
        let first_slot = stratheap_vm::align_up(HEADER_BYTES, align);
        debug_assert!(first_slot <= FIRST_SLOT_MAX_OFFSET);
        let slots_per_page = (page_bytes - first_slot) / slot_size;
        assert!(slots_per_page > 0, "page too small for slot size");
        Self {
            slot_size,
            align,
            page_bytes,
            first_slot,
            slots_per_page,
            free_pages: NIL,
            page_count: 0,
            used_slots: 0,
        }
    }

    #[must_use]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    #[must_use]
    pub fn alignment(&self) -> usize {
        self.align
    }

    #[must_use]
    pub fn slots_per_page(&self) -> usize {
        self.slots_per_page
    }

    /// Committed metadata plus end-of-page slack, per page.
    #[must_use]
    pub fn page_overhead(&self) -> usize {
        self.page_bytes - self.slots_per_page * self.slot_size
    }

    /// Pops a slot from the head free page, taking a fresh page from the
    /// page heap when every owned page is full.
    pub fn alloc(&mut self, pages: &mut PageHeap, mem: &VirtualMemory) -> Option<usize> {
        let page = if self.free_pages != NIL {
            self.free_pages
        } else {
            let page = pages.alloc()?;
            self.init_page(mem, page);
            self.free_pages = page;
            self.page_count += 1;
            page
        };

        let slot_offset = mem.read_usize(page + OFF_FREE_HEAD);
        debug_assert_ne!(slot_offset, NIL, "free-listed page must have a free slot");
        let next_slot = mem.read_usize(page + slot_offset);
        mem.write_usize(page + OFF_FREE_HEAD, next_slot);

        let used = mem.read_usize(page + OFF_USED) + 1;
        mem.write_usize(page + OFF_USED, used);
        if used == self.slots_per_page {
            // Page is full: unlink from the free-page list head.
            self.free_pages = mem.read_usize(page + OFF_NEXT_PAGE);
            mem.write_usize(page + OFF_NEXT_PAGE, NIL);
        }

        self.used_slots += 1;
        Some(page + slot_offset)
    }

    /// Pushes a slot back. The pointer must be one this FSA handed out;
    /// the page marker and slot arithmetic are validated before any
    /// state changes.
    pub fn free(&mut self, pages: &mut PageHeap, mem: &VirtualMemory, ptr: usize) {
        let page = stratheap_vm::align_down(ptr, self.page_bytes);
        self.validate_page(mem, page);
        let offset = ptr - page;
        assert!(
            offset >= self.first_slot && (offset - self.first_slot) % self.slot_size == 0,
            "fsa: {ptr:#x} is not a slot boundary"
        );

        #[cfg(debug_assertions)]
        self.debug_check_not_free(mem, page, offset);

        let used_before = mem.read_usize(page + OFF_USED);
        assert!(used_before > 0, "fsa: free on an empty page {page:#x}");

        mem.write_usize(ptr, mem.read_usize(page + OFF_FREE_HEAD));
        mem.write_usize(page + OFF_FREE_HEAD, offset);
        let used = used_before - 1;
        mem.write_usize(page + OFF_USED, used);
        self.used_slots -= 1;

        if used_before == self.slots_per_page {
            // 0 free -> 1 free: rejoin the free-page list, address
            // sorted, so low pages refill first and high pages drain.
            self.insert_page_sorted(mem, page);
        }
        if used == 0 {
            self.unlink_page(mem, page);
            self.page_count -= 1;
            pages.free(page);
        }
    }

    /// Slot size for a pointer known to belong to this FSA.
    pub fn usable_size(&self, mem: &VirtualMemory, ptr: usize) -> usize {
        let page = stratheap_vm::align_down(ptr, self.page_bytes);
        self.validate_page(mem, page);
        self.slot_size
    }

    fn init_page(&self, mem: &VirtualMemory, page: usize) {
        mem.write_usize(page + OFF_MARKER, PAGE_MARKER ^ self.slot_size);
        mem.write_usize(page + OFF_SLOT_SIZE, self.slot_size);
        mem.write_usize(page + OFF_USED, 0);
        mem.write_usize(page + OFF_FREE_HEAD, self.first_slot);
        mem.write_usize(page + OFF_NEXT_PAGE, NIL);
        // Thread every slot onto the free list in address order.
        for i in 0..self.slots_per_page {
            let slot = page + self.first_slot + i * self.slot_size;
            let next = if i + 1 < self.slots_per_page {
                self.first_slot + (i + 1) * self.slot_size
            } else {
                NIL
            };
            mem.write_usize(slot, next);
        }
    }

    fn validate_page(&self, mem: &VirtualMemory, page: usize) {
        let marker = mem.read_usize(page + OFF_MARKER);
        if marker != PAGE_MARKER ^ self.slot_size {
            panic!(
                "fsa: page {page:#x} marker mismatch (read {marker:#x}); heap corruption"
            );
        }
    }

    fn insert_page_sorted(&mut self, mem: &VirtualMemory, page: usize) {
        if self.free_pages == NIL || page < self.free_pages {
            mem.write_usize(page + OFF_NEXT_PAGE, self.free_pages);
            self.free_pages = page;
            return;
        }
        let mut cursor = self.free_pages;
        loop {
            let next = mem.read_usize(cursor + OFF_NEXT_PAGE);
            if next == NIL || page < next {
                mem.write_usize(page + OFF_NEXT_PAGE, next);
                mem.write_usize(cursor + OFF_NEXT_PAGE, page);
                return;
            }
            cursor = next;
        }
    }

    fn unlink_page(&mut self, mem: &VirtualMemory, page: usize) {
        if self.free_pages == page {
            self.free_pages = mem.read_usize(page + OFF_NEXT_PAGE);
            return;
        }
        let mut cursor = self.free_pages;
        while cursor != NIL {
            let next = mem.read_usize(cursor + OFF_NEXT_PAGE);
            if next == page {
                mem.write_usize(
                    cursor + OFF_NEXT_PAGE,
                    mem.read_usize(page + OFF_NEXT_PAGE),
                );
                return;
            }
            cursor = next;
        }
        panic!("fsa: page {page:#x} missing from free-page list");
    }

    #[cfg(debug_assertions)]
    fn debug_check_not_free(&self, mem: &VirtualMemory, page: usize, offset: usize) {
        let mut cursor = mem.read_usize(page + OFF_FREE_HEAD);
        let mut steps = 0;
        while cursor != NIL {
            assert!(
                cursor != offset,
                "fsa: double free of slot {:#x}",
                page + offset
            );
            cursor = mem.read_usize(page + cursor);
            steps += 1;
            assert!(steps <= self.slots_per_page, "fsa: free list cycle on page {page:#x}");
        }
    }

    /// Walks the free-page list validating order, markers and counts.
    pub fn check_integrity(&self, mem: &VirtualMemory) -> Result<(), crate::error::IntegrityError> {
        use crate::error::IntegrityError;
        let mut cursor = self.free_pages;
        let mut prev = 0usize;
        while cursor != NIL {
            if cursor <= prev {
                return Err(IntegrityError::FreePageOrder { page: cursor });
            }
            let marker = mem.read_usize(cursor + OFF_MARKER);
            if marker != PAGE_MARKER ^ self.slot_size {
                return Err(IntegrityError::MarkerMismatch {
                    page: cursor,
                    found: marker,
                });
            }
            let used = mem.read_usize(cursor + OFF_USED);
            let expected_free = self.slots_per_page - used;
            let mut listed = 0;
            let mut slot = mem.read_usize(cursor + OFF_FREE_HEAD);
            while slot != NIL {
                if slot < self.first_slot
                    || slot >= self.page_bytes
                    || (slot - self.first_slot) % self.slot_size != 0
                {
                    return Err(IntegrityError::FreeLinkOutOfRange {
                        page: cursor,
                        offset: slot,
                    });
                }
                listed += 1;
                if listed > self.slots_per_page {
                    break;
                }
                slot = mem.read_usize(cursor + slot);
            }
            if listed != expected_free {
                return Err(IntegrityError::FreeListMismatch {
                    page: cursor,
                    listed,
                    expected: expected_free,
                });
            }
            prev = cursor;
            cursor = mem.read_usize(cursor + OFF_NEXT_PAGE);
        }
        Ok(())
    }

    /// Reads the slot size recorded in a page header, validating the
    /// marker. Used by the FSA heap to route frees to the right FSA.
    pub(crate) fn page_slot_size(mem: &VirtualMemory, page: usize) -> usize {
        let slot_size = mem.read_usize(page + OFF_SLOT_SIZE);
        let marker = mem.read_usize(page + OFF_MARKER);
        if marker != PAGE_MARKER ^ slot_size {
            panic!("fsa: page {page:#x} marker mismatch (read {marker:#x}); heap corruption");
        }
        slot_size
    }
}
