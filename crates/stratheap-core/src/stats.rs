//! Per-tier byte accounting.
//!
//! Four counters per allocator, additive across allocators: `used` is
//! what callers asked for (rounded to the tier's unit), `unused` is
//! committed but idle, `overhead` is committed metadata (page headers,
//! block headers, sentinels), and `reserved` is address space held from
//! the OS. Snapshots serialize through serde; [`tagged_bytes`] is the
//! opaque stream handed to an external stats consumer.

use serde::Serialize;

/// Which sub-allocator a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    FsaSmall,
    FsaMid,
    CoalesceMid,
    CoalesceLarge,
    Large,
}

impl TierKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TierKind::FsaSmall => "fsa_small",
            TierKind::FsaMid => "fsa_mid",
            TierKind::CoalesceMid => "coalesce_mid",
            TierKind::CoalesceLarge => "coalesce_large",
            TierKind::Large => "large",
        }
    }
}

/// One allocator's byte counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierStats {
    /// Bytes handed to callers (tier-rounded sizes).
    pub used: usize,
    /// Bytes committed but currently idle.
    pub unused: usize,
    /// Bytes committed to allocator metadata.
    pub overhead: usize,
    /// Bytes of reserved address space.
    pub reserved: usize,
}

impl TierStats {
    /// Adds another allocator's counters into this one.
    pub fn absorb(&mut self, other: TierStats) {
        self.used += other.used;
        self.unused += other.unused;
        self.overhead += other.overhead;
        self.reserved += other.reserved;
    }

    /// Committed bytes implied by the counters.
    #[must_use]
    pub fn committed(&self) -> usize {
        self.used + self.unused + self.overhead
    }
}

/// A whole-heap snapshot, taken under the heap lock.
#[derive(Debug, Clone, Serialize)]
pub struct HeapStats {
    pub fsa_small: TierStats,
    pub fsa_mid: TierStats,
    pub coalesce_mid: TierStats,
    pub coalesce_large: TierStats,
    pub large: TierStats,
    /// Sum over all tiers.
    pub total: TierStats,
    /// OS-level counters from the virtual memory layer. `os_reserved`
    /// can exceed `total.reserved` while releases sit in the lazy cache.
    pub os_reserved: usize,
    pub os_committed: usize,
}

impl HeapStats {
    #[must_use]
    pub fn tier(&self, kind: TierKind) -> TierStats {
        match kind {
            TierKind::FsaSmall => self.fsa_small,
            TierKind::FsaMid => self.fsa_mid,
            TierKind::CoalesceMid => self.coalesce_mid,
            TierKind::CoalesceLarge => self.coalesce_large,
            TierKind::Large => self.large,
        }
    }

    /// Serializes the snapshot as a tagged byte stream for an external
    /// consumer. The tag names the schema so the consumer can dispatch
    /// without knowing this crate's types.
    #[must_use]
    pub fn tagged_bytes(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct Tagged<'a> {
            tag: &'static str,
            version: u32,
            stats: &'a HeapStats,
        }
        serde_json::to_vec(&Tagged {
            tag: "stratheap.stats",
            version: 1,
            stats: self,
        })
        .expect("stats snapshot serializes")
    }
}
