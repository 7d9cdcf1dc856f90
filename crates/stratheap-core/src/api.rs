//! Process-wide boundary API.
//!
//! The heap itself is an explicit value ([`TieredHeap`]) owned by the
//! embedding application. This module is the thin global layer for
//! callers that need malloc-style semantics: one process-wide instance
//! with explicit [`initialise`]/[`destroy`], a lazily-initialized
//! [`global`] handle, and raw-pointer wrappers over the address-based
//! core API.

use crate::config::HeapConfig;
use crate::heap::TieredHeap;
use parking_lot::Mutex;
use std::sync::Arc;

static GLOBAL: Mutex<Option<Arc<TieredHeap>>> = Mutex::new(None);

/// Creates the process-wide heap with the default configuration.
///
/// # Panics
/// If the heap is already initialised.
pub fn initialise() {
    initialise_with(HeapConfig::default());
}

/// Creates the process-wide heap with an explicit configuration.
///
/// # Panics
/// If the heap is already initialised, or the configuration is invalid.
pub fn initialise_with(config: HeapConfig) {
    let mut slot = GLOBAL.lock();
    assert!(slot.is_none(), "stratheap: already initialised");
    *slot = Some(Arc::new(TieredHeap::new(config)));
}

/// Tears the process-wide heap down. `clean` drains the lazy release
/// cache and returns every reservation; the abort path (`clean =
/// false`) skips the graceful drain and is meant for termination after
/// a fault. A no-op when the heap was never initialised.
pub fn destroy(clean: bool) {
    let heap = GLOBAL.lock().take();
    if let Some(heap) = heap {
        heap.destroy(clean);
    }
}

/// The process-wide heap, created with defaults on first use.
#[must_use]
pub fn global() -> Arc<TieredHeap> {
    let mut slot = GLOBAL.lock();
    slot.get_or_insert_with(|| Arc::new(TieredHeap::new(HeapConfig::default())))
        .clone()
}

/// Allocates from the global heap. Null on allocation failure.
#[must_use]
pub fn heap_alloc(size: usize) -> *mut u8 {
    match global().alloc(size) {
        Some(addr) => addr as *mut u8,
        None => std::ptr::null_mut(),
    }
}

/// Frees a pointer from the global heap. Null is a no-op; a pointer the
/// heap does not own is fatal.
pub fn heap_free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    global().free(ptr as usize);
}

/// Usable size of a global-heap pointer; `None` for foreign pointers.
#[must_use]
pub fn heap_get_size(ptr: *mut u8) -> Option<usize> {
    if ptr.is_null() {
        return None;
    }
    global().get_size(ptr as usize)
}

/// Reallocates a global-heap pointer. Null `ptr` allocates, zero
/// `new_size` frees and returns null.
#[must_use]
pub fn heap_realloc(ptr: *mut u8, new_size: usize) -> *mut u8 {
    match global().realloc(ptr as usize, new_size) {
        Some(addr) => addr as *mut u8,
        None => std::ptr::null_mut(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The global slot is process state; keep every assertion in one test
    // so ordering is deterministic under the parallel test runner.
    #[test]
    fn global_lifecycle_and_pointer_wrappers() {
        initialise_with(HeapConfig {
            start_flush_thread: false,
            ..HeapConfig::default()
        });

        let ptr = heap_alloc(100);
        assert!(!ptr.is_null());
        assert_eq!(heap_get_size(ptr), Some(104));

        let grown = heap_realloc(ptr, 5000);
        assert!(!grown.is_null());
        assert_ne!(grown, ptr);
        assert!(heap_get_size(grown).expect("owned") >= 5000);

        heap_free(grown);
        heap_free(std::ptr::null_mut());
        assert_eq!(heap_get_size(std::ptr::null_mut()), None);

        destroy(true);
        // Destroy is idempotent and global() re-creates on demand.
        destroy(true);
        let heap = global();
        let again = heap.alloc(32).expect("alloc after re-init");
        heap.free(again);
        destroy(true);
    }
}
