//! Lazy release cache over [`VirtualMemory`].
//!
//! Tiers create and destroy whole regions under churn, and the
//! reserve/release and commit/decommit pairs are the most expensive thing
//! the allocator does. This layer absorbs that churn:
//!
//! - `release` parks the reservation on a pending list keyed by
//!   {size, align} and tagged with a not-before flush generation instead
//!   of unmapping it. A later `reserve` with the same shape reinstates
//!   the parked range and returns the same base address.
//! - `decommit` parks page spans the same way; a later `commit`
//!   overlapping a parked span cancels the overlap so the pages never
//!   round-trip through the OS at all.
//! - A background flush thread advances the generation on a timer and
//!   executes whatever has aged past one full generation. The thread
//!   waits with a bounded timeout and re-checks a running flag, so
//!   shutdown never blocks indefinitely.
//! - When the OS refuses a reservation or commit, the cache is flushed
//!   synchronously and the operation retried exactly once. That is the
//!   system's only recovery strategy for reservation failure.

use crate::map::VirtualMemory;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Tuning for the lazy release cache.
#[derive(Debug, Clone)]
pub struct LazyConfig {
    /// Flush timer period; one generation elapses per tick.
    pub flush_interval_ms: u64,
    /// Spawn the background flush thread. Tests disable this and drive
    /// [`MappingLayer::advance_generation`] by hand for determinism.
    pub start_thread: bool,
}

impl Default for LazyConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 250,
            start_thread: true,
        }
    }
}

struct PendingRelease {
    base: usize,
    not_before: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingSpan {
    start: usize,
    end: usize,
    not_before: u64,
}

#[derive(Default)]
struct LazyState {
    running: bool,
    generation: u64,
    /// Parked reservations bucketed by {size, align}.
    pending_release: HashMap<(usize, usize), Vec<PendingRelease>>,
    /// Parked decommit spans, disjoint from one another.
    pending_decommit: Vec<PendingSpan>,
}

struct FlushShared {
    state: Mutex<LazyState>,
    wake: Condvar,
    interval: Duration,
}

/// The virtual-memory interface the tiers allocate through.
pub struct MappingLayer {
    vm: Arc<VirtualMemory>,
    shared: Arc<FlushShared>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl MappingLayer {
    #[must_use]
    pub fn new(config: LazyConfig) -> Self {
        let vm = Arc::new(VirtualMemory::new());
        let shared = Arc::new(FlushShared {
            state: Mutex::new(LazyState {
                running: true,
                ..LazyState::default()
            }),
            wake: Condvar::new(),
            interval: Duration::from_millis(config.flush_interval_ms.max(1)),
        });

        let flusher = if config.start_thread {
            let vm = Arc::clone(&vm);
            let shared = Arc::clone(&shared);
            Some(
                std::thread::Builder::new()
                    .name("stratheap-flush".into())
                    .spawn(move || flusher_loop(&vm, &shared))
                    .expect("spawn flush thread"),
            )
        } else {
            None
        };

        Self {
            vm,
            shared,
            flusher: Mutex::new(flusher),
        }
    }

    /// Direct access to the underlying registry (accessors, counters).
    #[must_use]
    pub fn vm(&self) -> &VirtualMemory {
        &self.vm
    }

    /// Reserves address space, preferring a parked reservation of exactly
    /// the same shape over asking the OS. On OS failure the cache is
    /// force-flushed and the reservation retried once.
    pub fn reserve(&self, size: usize, align: usize) -> Option<usize> {
        {
            let mut state = self.shared.state.lock();
            if let Some(bucket) = state.pending_release.get_mut(&(size, align))
                && let Some(entry) = bucket.pop()
            {
                log::trace!("lazy: reinstated reservation {:#x} ({size:#x} bytes)", entry.base);
                return Some(entry.base);
            }
        }
        match self.vm.reserve(size, align) {
            Some(base) => Some(base),
            None => {
                log::warn!("lazy: reserve({size:#x}) failed, force-flushing and retrying");
                self.force_flush();
                self.vm.reserve(size, align)
            }
        }
    }

    /// Parks a reservation for deferred release.
    pub fn release(&self, base: usize) {
        let (size, align) = self
            .vm
            .reservation_info(base)
            .unwrap_or_else(|| panic!("lazy: release of unknown reservation {base:#x}"));
        let mut state = self.shared.state.lock();
        let not_before = state.generation + 1;
        state
            .pending_release
            .entry((size, align))
            .or_default()
            .push(PendingRelease { base, not_before });
    }

    /// Commits the pages covering `[addr, addr+len)`. Overlapping parked
    /// decommit spans are cancelled first, so their pages never leave
    /// physical memory. Retries once after a force flush on OS failure.
    pub fn commit(&self, addr: usize, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        let (start, size) = VirtualMemory::page_span(addr, len);
        {
            let mut state = self.shared.state.lock();
            cancel_spans(&mut state.pending_decommit, start, start + size);
        }
        if self.vm.commit(start, size) {
            return true;
        }
        log::warn!("lazy: commit({start:#x}+{size:#x}) failed, force-flushing and retrying");
        self.force_flush();
        self.vm.commit(start, size)
    }

    /// Parks the pages wholly inside `[addr, addr+len)` for deferred
    /// decommit. Partial pages at either end are kept committed; they
    /// still hold neighboring metadata.
    pub fn decommit(&self, addr: usize, len: usize) {
        let ps = crate::os::page_size();
        let start = crate::align_up(addr, ps);
        let end = crate::align_down(addr + len, ps);
        if start >= end {
            return;
        }
        let mut state = self.shared.state.lock();
        let not_before = state.generation + 1;
        add_span(
            &mut state.pending_decommit,
            PendingSpan {
                start,
                end,
                not_before,
            },
        );
    }

    /// Executes every pending release and decommit immediately.
    ///
    /// Runs with the cache lock held, like the background flush: a span
    /// must never be decommitted after a racing `commit` believes it
    /// cancelled everything overlapping.
    pub fn force_flush(&self) {
        let mut state = self.shared.state.lock();
        let (spans, releases) = drain_due(&mut state, true);
        apply(&self.vm, spans, releases);
    }

    /// Advances one flush generation and executes whatever became due.
    /// This is the manual equivalent of one background timer tick.
    pub fn advance_generation(&self) {
        let mut state = self.shared.state.lock();
        state.generation += 1;
        let (spans, releases) = drain_due(&mut state, false);
        apply(&self.vm, spans, releases);
    }

    /// Wakes the background thread for an early flush pass.
    pub fn request_flush(&self) {
        self.shared.wake.notify_all();
    }

    /// Stops the background thread. `clean` joins it and drains all
    /// pending work; the abort path abandons both.
    pub fn shutdown(&self, clean: bool) {
        {
            let mut state = self.shared.state.lock();
            state.running = false;
        }
        self.shared.wake.notify_all();
        let handle = self.flusher.lock().take();
        if clean {
            if let Some(handle) = handle {
                let _ = handle.join();
            }
            self.force_flush();
        }
    }

    /// Number of parked reservations (test observability).
    #[must_use]
    pub fn pending_release_count(&self) -> usize {
        let state = self.shared.state.lock();
        state.pending_release.values().map(Vec::len).sum()
    }

    /// Bytes parked for decommit (test observability).
    #[must_use]
    pub fn pending_decommit_bytes(&self) -> usize {
        let state = self.shared.state.lock();
        state
            .pending_decommit
            .iter()
            .map(|s| s.end - s.start)
            .sum()
    }
}

impl Drop for MappingLayer {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}

fn flusher_loop(vm: &VirtualMemory, shared: &FlushShared) {
    let mut guard = shared.state.lock();
    while guard.running {
        let _ = shared.wake.wait_for(&mut guard, shared.interval);
        if !guard.running {
            break;
        }
        guard.generation += 1;
        let (spans, releases) = drain_due(&mut guard, false);
        // Applied under the cache lock: once a span leaves the pending
        // list it is invisible to `commit`'s cancellation, so the
        // decommit must complete before any foreground call proceeds.
        apply(vm, spans, releases);
    }
}

/// Removes due work from the state. A release drags every parked span
/// inside its range with it regardless of age; those pages die with the
/// reservation and must never be decommitted after it is gone.
fn drain_due(state: &mut LazyState, force: bool) -> (Vec<PendingSpan>, Vec<(usize, usize)>) {
    let generation = state.generation;
    let due = |not_before: u64| force || generation > not_before;

    let mut releases = Vec::new();
    for (&(size, _align), bucket) in state.pending_release.iter_mut() {
        let mut keep = Vec::with_capacity(bucket.len());
        for entry in bucket.drain(..) {
            if due(entry.not_before) {
                releases.push((entry.base, size));
            } else {
                keep.push(entry);
            }
        }
        *bucket = keep;
    }
    state.pending_release.retain(|_, bucket| !bucket.is_empty());

    for &(base, size) in &releases {
        cancel_spans(&mut state.pending_decommit, base, base + size);
    }

    let mut spans = Vec::new();
    state.pending_decommit.retain(|span| {
        if due(span.not_before) {
            spans.push(*span);
            false
        } else {
            true
        }
    });

    (spans, releases)
}

fn apply(vm: &VirtualMemory, spans: Vec<PendingSpan>, releases: Vec<(usize, usize)>) {
    for span in spans {
        vm.decommit(span.start, span.end - span.start);
    }
    for (base, _size) in releases {
        vm.release(base);
    }
}

/// Inserts a span, merging any overlap so the pending list stays disjoint.
fn add_span(spans: &mut Vec<PendingSpan>, new: PendingSpan) {
    let mut merged = new;
    spans.retain(|span| {
        if span.end < merged.start || span.start > merged.end {
            true
        } else {
            merged.start = merged.start.min(span.start);
            merged.end = merged.end.max(span.end);
            merged.not_before = merged.not_before.max(span.not_before);
            false
        }
    });
    spans.push(merged);
}

/// Removes `[start, end)` from the pending spans, splitting as needed.
fn cancel_spans(spans: &mut Vec<PendingSpan>, start: usize, end: usize) {
    let mut pieces = Vec::new();
    spans.retain(|span| {
        if span.end <= start || span.start >= end {
            true
        } else {
            if span.start < start {
                pieces.push(PendingSpan {
                    start: span.start,
                    end: start,
                    not_before: span.not_before,
                });
            }
            if span.end > end {
                pieces.push(PendingSpan {
                    start: end,
                    end: span.end,
                    not_before: span.not_before,
                });
            }
            false
        }
    });
    spans.append(&mut pieces);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::page_size;

    fn layer() -> MappingLayer {
        MappingLayer::new(LazyConfig {
            flush_interval_ms: 10,
            start_thread: false,
        })
    }

    #[test]
    fn release_is_deferred_then_flushed() {
        let layer = layer();
        let ps = page_size();
        let base = layer.reserve(2 * ps, ps).expect("reserve");
        layer.release(base);
        assert_eq!(layer.pending_release_count(), 1);
        assert_eq!(layer.vm().reserved_bytes(), 2 * ps);

        // One tick is not enough: the entry is tagged generation+1.
        layer.advance_generation();
        assert_eq!(layer.pending_release_count(), 1);
        layer.advance_generation();
        assert_eq!(layer.pending_release_count(), 0);
        assert_eq!(layer.vm().reserved_bytes(), 0);
    }

    #[test]
    fn reserve_reinstates_exact_match() {
        let layer = layer();
        let ps = page_size();
        let base = layer.reserve(4 * ps, ps).expect("reserve");
        layer.release(base);

        // Different shape does not match the parked entry.
        let other = layer.reserve(2 * ps, ps).expect("reserve");
        assert_ne!(other, base);
        assert_eq!(layer.pending_release_count(), 1);

        // Exact shape reinstates the same address.
        let again = layer.reserve(4 * ps, ps).expect("reserve");
        assert_eq!(again, base);
        assert_eq!(layer.pending_release_count(), 0);

        layer.release(other);
        layer.release(again);
        layer.force_flush();
        assert_eq!(layer.vm().reserved_bytes(), 0);
    }

    #[test]
    fn commit_cancels_pending_decommit() {
        let layer = layer();
        let ps = page_size();
        let base = layer.reserve(4 * ps, ps).expect("reserve");
        assert!(layer.commit(base, 4 * ps));
        assert_eq!(layer.vm().committed_bytes(), 4 * ps);

        layer.decommit(base, 4 * ps);
        assert_eq!(layer.pending_decommit_bytes(), 4 * ps);
        // Still physically committed: the decommit is parked.
        assert_eq!(layer.vm().committed_bytes(), 4 * ps);

        // Re-committing the middle cancels that part of the parked span.
        assert!(layer.commit(base + ps, ps));
        assert_eq!(layer.pending_decommit_bytes(), 3 * ps);

        layer.force_flush();
        assert_eq!(layer.vm().committed_bytes(), ps);
        layer.release(base);
        layer.force_flush();
    }

    #[test]
    fn decommit_keeps_partial_pages() {
        let layer = layer();
        let ps = page_size();
        let base = layer.reserve(4 * ps, ps).expect("reserve");
        assert!(layer.commit(base, 4 * ps));
        // Interior range covering no whole page parks nothing.
        layer.decommit(base + 8, ps / 2);
        assert_eq!(layer.pending_decommit_bytes(), 0);
        // Range covering one whole page plus slack parks exactly one page.
        layer.decommit(base + 8, 2 * ps);
        assert_eq!(layer.pending_decommit_bytes(), ps);
        layer.release(base);
        layer.force_flush();
    }

    #[test]
    fn release_drags_contained_spans() {
        let layer = layer();
        let ps = page_size();
        let base = layer.reserve(2 * ps, ps).expect("reserve");
        assert!(layer.commit(base, 2 * ps));
        layer.decommit(base, 2 * ps);
        layer.release(base);
        layer.force_flush();
        // The release purged the parked span; nothing dangles.
        assert_eq!(layer.pending_decommit_bytes(), 0);
        assert_eq!(layer.vm().reserved_bytes(), 0);
        assert_eq!(layer.vm().committed_bytes(), 0);
    }

    #[test]
    fn background_thread_flushes() {
        let layer = MappingLayer::new(LazyConfig {
            flush_interval_ms: 5,
            start_thread: true,
        });
        let ps = page_size();
        let base = layer.reserve(2 * ps, ps).expect("reserve");
        layer.release(base);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while layer.pending_release_count() > 0 {
            assert!(std::time::Instant::now() < deadline, "flush thread never ran");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(layer.vm().reserved_bytes(), 0);
        layer.shutdown(true);
    }
}
