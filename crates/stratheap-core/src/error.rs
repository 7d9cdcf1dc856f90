//! Error types for the allocator core.
//!
//! Allocation failure is not an error type: it is a `None` return, and
//! callers must treat it as out-of-memory. The enums here cover the two
//! checked classes — construction-time configuration mistakes and
//! integrity-walk findings. Usage errors (freeing a foreign pointer,
//! double free) are fatal and panic at the detection site instead.

use thiserror::Error;

/// Construction-time configuration mistakes. These are programmer
/// errors: the heap refuses to come up rather than run misconfigured.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{what} must be a power of two, got {value}")]
    NotPowerOfTwo { what: &'static str, value: usize },

    #[error("{what} must be a multiple of {unit}, got {value}")]
    NotAMultiple {
        what: &'static str,
        unit: usize,
        value: usize,
    },

    #[error("tier thresholds must be strictly increasing: {prev} then {next}")]
    ThresholdOrder { prev: usize, next: usize },

    #[error("tier covering ({min}, {max}] leaves a gap after {prev_max}")]
    ThresholdGap {
        prev_max: usize,
        min: usize,
        max: usize,
    },

    #[error("region size {region} cannot hold a maximum allocation of {max} plus metadata")]
    RegionTooSmall { region: usize, max: usize },

    #[error("{what} must be non-zero")]
    Zero { what: &'static str },
}

/// Findings from a full-heap consistency walk.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("page region {base:#x}: bitfield population {popcount} != recorded occupancy {recorded}")]
    BitfieldMismatch {
        base: usize,
        popcount: usize,
        recorded: usize,
    },

    #[error("page {page:#x}: marker word mismatch (read {found:#x})")]
    MarkerMismatch { page: usize, found: usize },

    #[error("page {page:#x}: free list holds {listed} slots but header says {expected}")]
    FreeListMismatch {
        page: usize,
        listed: usize,
        expected: usize,
    },

    #[error("page {page:#x}: free slot link {offset:#x} out of range")]
    FreeLinkOutOfRange { page: usize, offset: usize },

    #[error("free page list not address sorted near {page:#x}")]
    FreePageOrder { page: usize },

    #[error("coalesce region {base:#x}: header chain does not tile the region (stopped at {offset:#x})")]
    HeaderChainBroken { base: usize, offset: usize },

    #[error("coalesce region {base:#x}: adjacent free blocks at {offset:#x}")]
    AdjacentFree { base: usize, offset: usize },

    #[error("coalesce region {base:#x}: prev-size back link wrong at {offset:#x}")]
    PrevSizeMismatch { base: usize, offset: usize },

    #[error("coalesce bucket {bucket}: ordering violated at node {node}")]
    BucketOrder { bucket: usize, node: usize },

    #[error("coalesce node {node} disagrees with its header at {addr:#x}")]
    NodeHeaderMismatch { node: usize, addr: usize },

    #[error("coalesce free accounting: nodes total {nodes} != region free total {regions}")]
    FreeAccountingMismatch { nodes: usize, regions: usize },

    #[error("large heap: recorded mapping {addr:#x} missing from the reservation registry")]
    LargeMappingMissing { addr: usize },

    #[error("virtual memory counters inconsistent: {0}")]
    VmCounters(String),
}
