//! Raw OS virtual-memory primitives.
//!
//! On unix this maps onto `mmap`/`mprotect`/`madvise`/`munmap`: a
//! reservation is a `PROT_NONE` anonymous mapping, commit flips page
//! protection to read/write, and decommit drops the backing pages with
//! `MADV_DONTNEED` before flipping back to `PROT_NONE`.
//!
//! On platforms without a reserve-without-commit primitive the fallback
//! commits at reservation time via the global allocator; commit and
//! decommit become bookkeeping no-ops at this layer.

use std::sync::OnceLock;

/// Returns the OS page size in bytes.
#[must_use]
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(query_page_size)
}

#[cfg(unix)]
fn query_page_size() -> usize {
    // SAFETY: sysconf is async-signal-safe and has no memory preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if raw > 0 { raw as usize } else { 4096 }
}

#[cfg(not(unix))]
fn query_page_size() -> usize {
    4096
}

/// Reserves `size` bytes of address space without physical backing.
///
/// `size` must be a page multiple. Returns the base address, or `None`
/// if the OS refused the mapping.
#[cfg(unix)]
pub(crate) fn raw_reserve(size: usize) -> Option<usize> {
    // SAFETY: anonymous PROT_NONE mapping with a null hint touches no
    // existing memory; the result is checked against MAP_FAILED.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        None
    } else {
        Some(addr as usize)
    }
}

/// Releases an address range previously obtained from [`raw_reserve`].
#[cfg(unix)]
pub(crate) fn raw_release(addr: usize, size: usize) {
    // SAFETY: the caller guarantees [addr, addr+size) is a mapping (or a
    // page-aligned sub-range of one) that this layer handed out.
    let rc = unsafe { libc::munmap(addr as *mut libc::c_void, size) };
    if rc != 0 {
        log::error!("munmap({addr:#x}, {size}) failed: {}", std::io::Error::last_os_error());
    }
}

/// Commits pages inside a reservation, making them readable and writable.
#[cfg(unix)]
pub(crate) fn raw_commit(addr: usize, size: usize) -> bool {
    // SAFETY: the caller guarantees the range lies inside a live
    // reservation; mprotect on such a range has no other side effects.
    let rc = unsafe {
        libc::mprotect(
            addr as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    rc == 0
}

/// Decommits pages, discarding their contents and physical backing.
#[cfg(unix)]
pub(crate) fn raw_decommit(addr: usize, size: usize) {
    // SAFETY: as for raw_commit; MADV_DONTNEED on an anonymous private
    // mapping discards page contents, which is exactly the contract.
    unsafe {
        libc::madvise(addr as *mut libc::c_void, size, libc::MADV_DONTNEED);
        libc::mprotect(addr as *mut libc::c_void, size, libc::PROT_NONE);
    }
}

#[cfg(not(unix))]
pub(crate) fn raw_reserve(size: usize) -> Option<usize> {
    let layout = std::alloc::Layout::from_size_align(size, page_size()).ok()?;
    // SAFETY: layout has non-zero size (callers reject zero) and valid align.
    let ptr = unsafe { std::alloc::alloc(layout) };
    if ptr.is_null() { None } else { Some(ptr as usize) }
}

#[cfg(not(unix))]
pub(crate) fn raw_release(addr: usize, size: usize) {
    let layout = std::alloc::Layout::from_size_align(size, page_size())
        .expect("release layout mirrors reserve layout");
    // SAFETY: addr came from raw_reserve with the same layout.
    unsafe { std::alloc::dealloc(addr as *mut u8, layout) };
}

#[cfg(not(unix))]
pub(crate) fn raw_commit(_addr: usize, _size: usize) -> bool {
    true
}

#[cfg(not(unix))]
pub(crate) fn raw_decommit(_addr: usize, _size: usize) {}

/// Reads one machine word from `addr`.
///
/// The address must be word-aligned and inside committed memory; the
/// [`VirtualMemory`](crate::VirtualMemory) accessors enforce this before
/// delegating here.
pub(crate) fn raw_read_usize(addr: usize) -> usize {
    debug_assert_eq!(addr % std::mem::size_of::<usize>(), 0);
    // SAFETY: caller-validated committed, word-aligned address.
    unsafe { (addr as *const usize).read() }
}

/// Writes one machine word to `addr`. Same preconditions as [`raw_read_usize`].
pub(crate) fn raw_write_usize(addr: usize, value: usize) {
    debug_assert_eq!(addr % std::mem::size_of::<usize>(), 0);
    // SAFETY: caller-validated committed, word-aligned address.
    unsafe { (addr as *mut usize).write(value) };
}

/// Copies `len` bytes between two non-overlapping committed ranges.
pub(crate) fn raw_copy(dst: usize, src: usize, len: usize) {
    // SAFETY: caller-validated committed ranges; allocator blocks never
    // overlap, which is itself an invariant the integrity walk checks.
    unsafe {
        std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len);
    }
}

/// Fills `len` bytes at `addr` with `byte`.
pub(crate) fn raw_fill(addr: usize, len: usize, byte: u8) {
    // SAFETY: caller-validated committed range.
    unsafe { std::ptr::write_bytes(addr as *mut u8, byte, len) };
}
