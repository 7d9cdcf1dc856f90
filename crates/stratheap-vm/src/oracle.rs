//! Page-granular ownership oracle.
//!
//! Every tier needs to answer "does this pointer belong to me" on the hot
//! free path without taking its allocation lock. Each tier keeps one
//! [`SpanOracle`] and registers region spans as they are created and
//! destroyed. Queries read a two-level structure: an address-chunk map to
//! a fixed-size array of per-page counters, updated atomically. Counters
//! rather than bits because region spans can share an OS page with a
//! neighboring span's tail when tiers sub-divide pages.
//!
//! The chunk map itself is behind an `RwLock`, but chunks are only
//! inserted when a region first maps into a new chunk of address space;
//! the query path is a read lock plus one relaxed atomic load.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};

/// Pages per second-level counter array (4096 pages = 16 MiB of address
/// space per chunk at a 4 KiB page size).
const PAGES_PER_CHUNK: usize = 4096;

struct Chunk {
    counts: Box<[AtomicU8]>,
}

impl Chunk {
    fn new() -> Self {
        let counts: Vec<AtomicU8> = (0..PAGES_PER_CHUNK).map(|_| AtomicU8::new(0)).collect();
        Self {
            counts: counts.into_boxed_slice(),
        }
    }

    fn bump(&self, page: usize) {
        let _ = self.counts[page].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
            Some(if x == u8::MAX { x } else { x + 1 })
        });
    }

    fn drop_one(&self, page: usize) {
        let _ = self.counts[page].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
            Some(match x {
                0 => 0,
                u8::MAX => u8::MAX, // saturated, sticky
                n => n - 1,
            })
        });
    }

    fn occupied(&self, page: usize) -> bool {
        self.counts[page].load(Ordering::Relaxed) > 0
    }

    fn is_empty(&self) -> bool {
        self.counts.iter().all(|c| c.load(Ordering::Relaxed) == 0)
    }
}

/// Two-level page ownership map for one tier.
pub struct SpanOracle {
    page_size: usize,
    chunks: RwLock<HashMap<usize, Chunk>>,
}

impl SpanOracle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            page_size: crate::os::page_size(),
            chunks: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `[base, base+size)` as owned. Counters are bumped before
    /// the caller publishes the region, so a concurrent query never sees
    /// a pointer into a region the oracle does not know about.
    pub fn insert_span(&self, base: usize, size: usize) {
        if size == 0 {
            return;
        }
        let first = base / self.page_size;
        let last = (base + size - 1) / self.page_size;
        for page in first..=last {
            let (chunk_idx, page_idx) = Self::split(page);
            {
                let chunks = self.chunks.read();
                if let Some(chunk) = chunks.get(&chunk_idx) {
                    chunk.bump(page_idx);
                    continue;
                }
            }
            let mut chunks = self.chunks.write();
            chunks.entry(chunk_idx).or_insert_with(Chunk::new).bump(page_idx);
        }
    }

    /// Unregisters `[base, base+size)`. Empty chunks are pruned so a
    /// long-lived process does not accumulate dead counter arrays.
    pub fn remove_span(&self, base: usize, size: usize) {
        if size == 0 {
            return;
        }
        let first = base / self.page_size;
        let last = (base + size - 1) / self.page_size;
        let mut emptied = Vec::new();
        {
            let chunks = self.chunks.read();
            for page in first..=last {
                let (chunk_idx, page_idx) = Self::split(page);
                if let Some(chunk) = chunks.get(&chunk_idx) {
                    chunk.drop_one(page_idx);
                    if chunk.is_empty() {
                        emptied.push(chunk_idx);
                    }
                }
            }
        }
        if !emptied.is_empty() {
            let mut chunks = self.chunks.write();
            for idx in emptied {
                if chunks.get(&idx).is_some_and(Chunk::is_empty) {
                    chunks.remove(&idx);
                }
            }
        }
    }

    /// True when the page containing `addr` belongs to a registered span.
    #[must_use]
    pub fn owns(&self, addr: usize) -> bool {
        let page = addr / self.page_size;
        let (chunk_idx, page_idx) = Self::split(page);
        let chunks = self.chunks.read();
        chunks
            .get(&chunk_idx)
            .is_some_and(|chunk| chunk.occupied(page_idx))
    }

    fn split(page: usize) -> (usize, usize) {
        (page / PAGES_PER_CHUNK, page % PAGES_PER_CHUNK)
    }
}

impl Default for SpanOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::page_size;

    #[test]
    fn insert_and_query() {
        let oracle = SpanOracle::new();
        let ps = page_size();
        let base = 64 * ps;
        oracle.insert_span(base, 4 * ps);
        assert!(oracle.owns(base));
        assert!(oracle.owns(base + 4 * ps - 1));
        assert!(!oracle.owns(base - 1));
        assert!(!oracle.owns(base + 4 * ps));
    }

    #[test]
    fn remove_clears_pages() {
        let oracle = SpanOracle::new();
        let ps = page_size();
        oracle.insert_span(8 * ps, 2 * ps);
        oracle.remove_span(8 * ps, 2 * ps);
        assert!(!oracle.owns(8 * ps));
        assert!(!oracle.owns(9 * ps));
    }

    #[test]
    fn overlapping_spans_are_refcounted() {
        let oracle = SpanOracle::new();
        let ps = page_size();
        // Two spans meeting mid-page: removing one keeps the shared page.
        oracle.insert_span(ps, ps / 2);
        oracle.insert_span(ps + ps / 2, ps / 2);
        oracle.remove_span(ps, ps / 2);
        assert!(oracle.owns(ps + ps / 2));
        oracle.remove_span(ps + ps / 2, ps / 2);
        assert!(!oracle.owns(ps));
    }

    #[test]
    fn spans_crossing_chunk_boundary() {
        let oracle = SpanOracle::new();
        let ps = page_size();
        let chunk_bytes = 4096 * ps;
        let base = chunk_bytes - 2 * ps;
        oracle.insert_span(base, 4 * ps);
        assert!(oracle.owns(chunk_bytes - ps));
        assert!(oracle.owns(chunk_bytes + ps));
        oracle.remove_span(base, 4 * ps);
        assert!(!oracle.owns(chunk_bytes));
    }
}
