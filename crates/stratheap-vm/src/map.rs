//! Reservation registry and checked metadata accessors.
//!
//! [`VirtualMemory`] owns every address range the allocator has reserved
//! from the OS. Each reservation tracks its committed sub-ranges as an
//! [`IntervalSet`], which keeps the global reserved/committed byte counters
//! exact and makes `commit` idempotent: only the uncommitted gaps of a
//! requested range reach the OS.
//!
//! The word accessors are how the safe core crate reads and writes
//! header-embedded metadata. A byte range is either a live value owned by
//! the caller or allocator metadata (free-list links, block headers) —
//! never both — and only the alloc/free paths change which interpretation
//! applies. Debug builds verify every access against the committed map;
//! release builds do not pay for the check.

use crate::interval::IntervalSet;
use crate::os;
use crate::{align_down, align_up};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

const WORD: usize = std::mem::size_of::<usize>();

/// Errors surfaced by the virtual-memory layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("range {base:#x}+{size:#x} is not a known reservation")]
    UnknownRange { base: usize, size: usize },

    #[error("address {addr:#x} not word-aligned")]
    Misaligned { addr: usize },

    #[error("access at {addr:#x}+{len} outside committed memory")]
    Uncommitted { addr: usize, len: usize },

    #[error("byte counters disagree with reservation records: reserved {reserved} vs {tracked_reserved}, committed {committed} vs {tracked_committed}")]
    CounterMismatch {
        reserved: usize,
        tracked_reserved: usize,
        committed: usize,
        tracked_committed: usize,
    },
}

struct Reservation {
    size: usize,
    align: usize,
    /// Base/size actually handed back to the OS on release. Differs from
    /// the aligned base only on targets without partial unmapping.
    raw_base: usize,
    raw_size: usize,
    committed: IntervalSet,
}

/// Registry of OS reservations with committed-range tracking.
pub struct VirtualMemory {
    reservations: RwLock<BTreeMap<usize, Reservation>>,
    reserved_bytes: AtomicUsize,
    committed_bytes: AtomicUsize,
}

impl VirtualMemory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            reservations: RwLock::new(BTreeMap::new()),
            reserved_bytes: AtomicUsize::new(0),
            committed_bytes: AtomicUsize::new(0),
        }
    }

    /// Reserves `size` bytes of address space aligned to `align`, without
    /// committing physical backing. Returns `None` when the OS is out of
    /// address space or backing store; callers treat that as recoverable.
    pub fn reserve(&self, size: usize, align: usize) -> Option<usize> {
        let ps = os::page_size();
        assert!(size > 0 && size % ps == 0, "reserve size must be a page multiple");
        assert!(
            align.is_power_of_two() && align >= ps,
            "reserve alignment must be a power of two >= page size"
        );

        let (base, raw_base, raw_size) = reserve_aligned(size, align)?;
        let mut map = self.reservations.write();
        map.insert(
            base,
            Reservation {
                size,
                align,
                raw_base,
                raw_size,
                committed: IntervalSet::new(),
            },
        );
        self.reserved_bytes.fetch_add(size, Ordering::Relaxed);
        log::trace!("vm: reserved {size:#x} bytes at {base:#x} (align {align:#x})");
        Some(base)
    }

    /// Releases a reservation in full, decommitting anything still
    /// committed. Panics on an address this layer never handed out —
    /// that is heap corruption, not a recoverable condition.
    pub fn release(&self, base: usize) {
        let reservation = {
            let mut map = self.reservations.write();
            map.remove(&base)
                .unwrap_or_else(|| panic!("vm: release of unknown reservation {base:#x}"))
        };
        let still_committed = reservation.committed.total();
        os::raw_release(reservation.raw_base, reservation.raw_size);
        self.reserved_bytes
            .fetch_sub(reservation.size, Ordering::Relaxed);
        self.committed_bytes
            .fetch_sub(still_committed, Ordering::Relaxed);
        log::trace!(
            "vm: released {:#x} bytes at {base:#x} ({still_committed:#x} still committed)",
            reservation.size
        );
    }

    /// Size and alignment of the reservation at `base`, if any.
    #[must_use]
    pub fn reservation_info(&self, base: usize) -> Option<(usize, usize)> {
        let map = self.reservations.read();
        map.get(&base).map(|r| (r.size, r.align))
    }

    /// Committed bytes inside the reservation at `base`, if any.
    #[must_use]
    pub fn committed_in(&self, base: usize) -> Option<usize> {
        let map = self.reservations.read();
        map.get(&base).map(|r| r.committed.total())
    }

    /// Releases every reservation at once: the clean-teardown path. Any
    /// pointer into the heap is invalid afterwards.
    pub fn release_all(&self) {
        let mut map = self.reservations.write();
        for (_, reservation) in std::mem::take(&mut *map) {
            os::raw_release(reservation.raw_base, reservation.raw_size);
        }
        self.reserved_bytes.store(0, Ordering::Relaxed);
        self.committed_bytes.store(0, Ordering::Relaxed);
    }

    /// Commits the page range `[addr, addr+size)` inside one reservation.
    /// Both bounds must be page-aligned. Already-committed portions are
    /// skipped. Returns false if the OS refuses backing for any gap.
    pub fn commit(&self, addr: usize, size: usize) -> bool {
        let ps = os::page_size();
        assert!(addr % ps == 0 && size % ps == 0, "commit range must be page-aligned");
        if size == 0 {
            return true;
        }
        let mut map = self.reservations.write();
        let Some((_, reservation)) = containing_mut(&mut map, addr, size) else {
            panic!("vm: commit outside any reservation: {addr:#x}+{size:#x}");
        };
        let mut newly = 0;
        for (gap_start, gap_end) in reservation.committed.gaps(addr, addr + size) {
            if !os::raw_commit(gap_start, gap_end - gap_start) {
                self.committed_bytes.fetch_add(newly, Ordering::Relaxed);
                log::warn!("vm: commit failed at {gap_start:#x}+{:#x}", gap_end - gap_start);
                return false;
            }
            newly += reservation.committed.add(gap_start, gap_end);
        }
        self.committed_bytes.fetch_add(newly, Ordering::Relaxed);
        true
    }

    /// Decommits the page range `[addr, addr+size)`, discarding contents.
    /// Portions that were never committed are ignored.
    pub fn decommit(&self, addr: usize, size: usize) {
        let ps = os::page_size();
        assert!(addr % ps == 0 && size % ps == 0, "decommit range must be page-aligned");
        if size == 0 {
            return;
        }
        let mut map = self.reservations.write();
        let Some((_, reservation)) = containing_mut(&mut map, addr, size) else {
            panic!("vm: decommit outside any reservation: {addr:#x}+{size:#x}");
        };
        let mut dropped = 0;
        for (s, e) in reservation.committed.intersection(addr, addr + size) {
            os::raw_decommit(s, e - s);
            dropped += e - s;
        }
        reservation.committed.remove(addr, addr + size);
        self.committed_bytes.fetch_sub(dropped, Ordering::Relaxed);
    }

    /// True when `[addr, addr+len)` lies fully inside committed memory.
    #[must_use]
    pub fn is_committed(&self, addr: usize, len: usize) -> bool {
        let map = self.reservations.read();
        match containing(&map, addr, len) {
            Some(r) => r.committed.covers(addr, addr + len),
            None => false,
        }
    }

    /// Global reserved byte count across all reservations.
    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes.load(Ordering::Relaxed)
    }

    /// Global committed byte count across all reservations.
    #[must_use]
    pub fn committed_bytes(&self) -> usize {
        self.committed_bytes.load(Ordering::Relaxed)
    }

    /// Number of live reservations.
    #[must_use]
    pub fn reservation_count(&self) -> usize {
        self.reservations.read().len()
    }

    /// Cross-checks the counters against the per-reservation records.
    pub fn check_counters(&self) -> Result<(), VmError> {
        let map = self.reservations.read();
        let tracked_reserved: usize = map.values().map(|r| r.size).sum();
        let tracked_committed: usize = map.values().map(|r| r.committed.total()).sum();
        if tracked_reserved != self.reserved_bytes() || tracked_committed != self.committed_bytes() {
            return Err(VmError::CounterMismatch {
                reserved: self.reserved_bytes(),
                tracked_reserved,
                committed: self.committed_bytes(),
                tracked_committed,
            });
        }
        Ok(())
    }

    /// Reads one metadata word.
    #[must_use]
    pub fn read_usize(&self, addr: usize) -> usize {
        self.check_access(addr, WORD);
        os::raw_read_usize(addr)
    }

    /// Writes one metadata word.
    pub fn write_usize(&self, addr: usize, value: usize) {
        self.check_access(addr, WORD);
        os::raw_write_usize(addr, value);
    }

    /// Copies `len` bytes between two committed, non-overlapping ranges.
    pub fn copy(&self, dst: usize, src: usize, len: usize) {
        if len == 0 {
            return;
        }
        self.check_range(dst, len);
        self.check_range(src, len);
        os::raw_copy(dst, src, len);
    }

    /// Fills `len` bytes at `addr` with `byte`.
    pub fn fill(&self, addr: usize, len: usize, byte: u8) {
        if len == 0 {
            return;
        }
        self.check_range(addr, len);
        os::raw_fill(addr, len, byte);
    }

    #[inline]
    fn check_access(&self, addr: usize, len: usize) {
        if addr % WORD != 0 {
            panic!("vm: misaligned metadata access at {addr:#x}");
        }
        self.check_range(addr, len);
    }

    #[inline]
    fn check_range(&self, addr: usize, len: usize) {
        #[cfg(debug_assertions)]
        {
            if !self.is_committed(addr, len) {
                panic!("vm: access at {addr:#x}+{len} outside committed memory");
            }
        }
        #[cfg(not(debug_assertions))]
        {
            let _ = (addr, len);
        }
    }

    /// Page-aligned bounds covering an arbitrary byte range.
    #[must_use]
    pub fn page_span(addr: usize, len: usize) -> (usize, usize) {
        let ps = os::page_size();
        let start = align_down(addr, ps);
        let end = align_up(addr + len, ps);
        (start, end - start)
    }
}

impl Default for VirtualMemory {
    fn default() -> Self {
        Self::new()
    }
}

fn containing<'a>(
    map: &'a BTreeMap<usize, Reservation>,
    addr: usize,
    len: usize,
) -> Option<&'a Reservation> {
    let (&base, r) = map.range(..=addr).next_back()?;
    (addr + len <= base + r.size).then_some(r)
}

fn containing_mut<'a>(
    map: &'a mut BTreeMap<usize, Reservation>,
    addr: usize,
    len: usize,
) -> Option<(usize, &'a mut Reservation)> {
    let base = *map.range(..=addr).next_back().map(|(b, _)| b)?;
    let r = map.get_mut(&base)?;
    (addr + len <= base + r.size).then_some((base, r))
}

#[cfg(unix)]
fn reserve_aligned(size: usize, align: usize) -> Option<(usize, usize, usize)> {
    if align <= os::page_size() {
        let base = os::raw_reserve(size)?;
        return Some((base, base, size));
    }
    // Over-reserve, then trim the misaligned head and tail back to the OS.
    let raw_size = size + align;
    let raw = os::raw_reserve(raw_size)?;
    let base = align_up(raw, align);
    let head = base - raw;
    if head > 0 {
        os::raw_release(raw, head);
    }
    let tail = (raw + raw_size) - (base + size);
    if tail > 0 {
        os::raw_release(base + size, tail);
    }
    Some((base, base, size))
}

#[cfg(not(unix))]
fn reserve_aligned(size: usize, align: usize) -> Option<(usize, usize, usize)> {
    // No partial unmapping here: keep the whole raw block and hand out an
    // aligned interior base.
    let raw_size = if align <= os::page_size() { size } else { size + align };
    let raw = os::raw_reserve(raw_size)?;
    Some((align_up(raw, align), raw, raw_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ps() -> usize {
        os::page_size()
    }

    #[test]
    fn reserve_tracks_counters() {
        let vm = VirtualMemory::new();
        let base = vm.reserve(4 * ps(), ps()).expect("reserve");
        assert_eq!(vm.reserved_bytes(), 4 * ps());
        assert_eq!(vm.committed_bytes(), 0);
        assert_eq!(vm.reservation_info(base), Some((4 * ps(), ps())));
        vm.release(base);
        assert_eq!(vm.reserved_bytes(), 0);
        assert_eq!(vm.reservation_count(), 0);
    }

    #[test]
    fn reserve_honors_large_alignment() {
        let vm = VirtualMemory::new();
        let align = 64 * 1024;
        let base = vm.reserve(align, align).expect("reserve");
        assert_eq!(base % align, 0);
        vm.release(base);
    }

    #[test]
    fn commit_is_idempotent_for_counters() {
        let vm = VirtualMemory::new();
        let base = vm.reserve(4 * ps(), ps()).expect("reserve");
        assert!(vm.commit(base, 2 * ps()));
        assert_eq!(vm.committed_bytes(), 2 * ps());
        // Overlapping commit only counts the new page.
        assert!(vm.commit(base + ps(), 2 * ps()));
        assert_eq!(vm.committed_bytes(), 3 * ps());
        vm.release(base);
        assert_eq!(vm.committed_bytes(), 0);
    }

    #[test]
    fn decommit_subranges() {
        let vm = VirtualMemory::new();
        let base = vm.reserve(4 * ps(), ps()).expect("reserve");
        assert!(vm.commit(base, 4 * ps()));
        vm.decommit(base + ps(), ps());
        assert_eq!(vm.committed_bytes(), 3 * ps());
        assert!(vm.is_committed(base, ps()));
        assert!(!vm.is_committed(base + ps(), 1));
        assert!(vm.is_committed(base + 2 * ps(), 2 * ps()));
        vm.release(base);
    }

    #[test]
    fn word_accessors_roundtrip() {
        let vm = VirtualMemory::new();
        let base = vm.reserve(ps(), ps()).expect("reserve");
        assert!(vm.commit(base, ps()));
        vm.write_usize(base + 64, 0xFEED);
        assert_eq!(vm.read_usize(base + 64), 0xFEED);
        vm.fill(base, 32, 0xAB);
        vm.copy(base + 128, base, 32);
        assert_eq!(vm.read_usize(base + 128), usize::from_ne_bytes([0xAB; WORD]));
        vm.release(base);
    }

    #[test]
    fn counters_stay_consistent() {
        let vm = VirtualMemory::new();
        let a = vm.reserve(2 * ps(), ps()).expect("reserve");
        let b = vm.reserve(2 * ps(), ps()).expect("reserve");
        vm.commit(a, ps());
        vm.commit(b, 2 * ps());
        assert!(vm.check_counters().is_ok());
        vm.release(a);
        vm.release(b);
        assert!(vm.check_counters().is_ok());
    }

    #[test]
    #[should_panic(expected = "unknown reservation")]
    fn release_unknown_panics() {
        let vm = VirtualMemory::new();
        vm.release(0x1000);
    }
}
