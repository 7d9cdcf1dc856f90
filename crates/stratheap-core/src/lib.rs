//! Tiered allocation logic for the stratheap allocator.
//!
//! A request is routed by size to one of five sub-allocators, each
//! trading internal fragmentation, external fragmentation and speed
//! differently:
//!
//! - [`fsa_heap::FsaHeap`] x2 — fixed-size slot allocators over a
//!   [`page_heap::PageHeap`], for small requests.
//! - [`coalesce::CoalesceHeap`] x2 — best-fit heaps with O(1) neighbor
//!   coalescing, for mid-size requests.
//! - [`large::LargeHeap`] — dedicated OS mappings above all thresholds.
//!
//! [`heap::TieredHeap`] composes them behind per-tier locks; [`api`]
//! adds the optional process-wide handle. This crate denies `unsafe`:
//! all embedded metadata (page headers, block headers, free-list links
//! threaded through free memory) is read and written through the
//! checked accessors of `stratheap-vm`, and allocator logic only ever
//! handles addresses as `usize`.

pub mod api;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod events;
pub mod fsa;
pub mod fsa_heap;
pub mod heap;
pub mod large;
pub mod lock;
pub mod page_heap;
pub mod stats;

pub use api::{destroy, global, heap_alloc, heap_free, heap_get_size, heap_realloc, initialise, initialise_with};
pub use config::{CoalesceTierConfig, FsaTierConfig, HeapConfig};
pub use error::{ConfigError, IntegrityError};
pub use events::{AllocEvent, CallstackProvider, EventKind, EventSink, VecSink};
pub use heap::{HeapGuard, TieredHeap};
pub use stats::{HeapStats, TierKind, TierStats};
