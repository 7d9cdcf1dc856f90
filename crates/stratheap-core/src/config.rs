//! Heap configuration.
//!
//! Everything here is fixed at construction; nothing is runtime-mutable.
//! Validation happens before any tier touches the OS, and a bad
//! configuration refuses to construct — size ranges that do not fit their
//! region, overlapping tier thresholds, and similar mistakes are
//! programmer errors, not recoverable conditions.

use crate::error::ConfigError;
use serde::Serialize;
use stratheap_vm::page_size;

/// One fixed-size-allocator tier.
#[derive(Debug, Clone, Serialize)]
pub struct FsaTierConfig {
    /// Largest request (bytes) served by this tier.
    pub max_size: usize,
    /// Slot granularity; requests round up to the next multiple.
    pub granularity: usize,
    /// Page size carved into slots. Power of two, OS-page multiple.
    pub page_size: usize,
    /// Pages per reserved region.
    pub pages_per_region: usize,
}

impl FsaTierConfig {
    /// Bytes reserved per region.
    #[must_use]
    pub fn region_bytes(&self) -> usize {
        self.page_size * self.pages_per_region
    }

    fn validate(&self, label: &'static str) -> Result<(), ConfigError> {
        if self.granularity == 0 {
            return Err(ConfigError::Zero { what: "fsa granularity" });
        }
        if !self.page_size.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                what: "fsa page size",
                value: self.page_size,
            });
        }
        if self.page_size % page_size() != 0 {
            return Err(ConfigError::NotAMultiple {
                what: "fsa page size",
                unit: page_size(),
                value: self.page_size,
            });
        }
        if self.max_size == 0 || self.pages_per_region == 0 {
            return Err(ConfigError::Zero { what: label });
        }
        if self.max_size % self.granularity != 0 {
            return Err(ConfigError::NotAMultiple {
                what: "fsa max size",
                unit: self.granularity,
                value: self.max_size,
            });
        }
        // A page must hold the header plus at least one largest slot.
        if self.page_size < crate::fsa::FIRST_SLOT_MAX_OFFSET + self.max_size {
            return Err(ConfigError::RegionTooSmall {
                region: self.page_size,
                max: self.max_size,
            });
        }
        Ok(())
    }
}

/// One coalescing best-fit tier.
#[derive(Debug, Clone, Serialize)]
pub struct CoalesceTierConfig {
    /// Smallest request (bytes) this tier expects; requests below it are
    /// legal but rounded up.
    pub min_size: usize,
    /// Largest request (bytes) served by this tier.
    pub max_size: usize,
    /// Bytes reserved per region.
    pub region_size: usize,
    /// User-pointer alignment guarantee. Power of two.
    pub alignment: usize,
}

impl CoalesceTierConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.alignment.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                what: "coalesce alignment",
                value: self.alignment,
            });
        }
        if self.min_size == 0 || self.max_size == 0 {
            return Err(ConfigError::Zero { what: "coalesce size range" });
        }
        if self.region_size % page_size() != 0 {
            return Err(ConfigError::NotAMultiple {
                what: "coalesce region size",
                unit: page_size(),
                value: self.region_size,
            });
        }
        // Room for both sentinels, the largest block and its header.
        let overhead = 3 * crate::coalesce::HEADER_BYTES;
        if self.region_size < self.max_size + overhead {
            return Err(ConfigError::RegionTooSmall {
                region: self.region_size,
                max: self.max_size,
            });
        }
        if self.max_size <= self.min_size {
            return Err(ConfigError::ThresholdOrder {
                prev: self.min_size,
                next: self.max_size,
            });
        }
        Ok(())
    }
}

/// Full heap configuration: four bounded tiers, the large tier above
/// them, and the lazy-release flush cadence.
#[derive(Debug, Clone, Serialize)]
pub struct HeapConfig {
    pub fsa_small: FsaTierConfig,
    pub fsa_mid: FsaTierConfig,
    pub coalesce_mid: CoalesceTierConfig,
    pub coalesce_large: CoalesceTierConfig,
    /// Lazy release flush period in milliseconds.
    pub flush_interval_ms: u64,
    /// Spawn the background flush thread. Disabled by deterministic tests.
    pub start_flush_thread: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            fsa_small: FsaTierConfig {
                max_size: 128,
                granularity: 8,
                page_size: 64 * 1024,
                pages_per_region: 64,
            },
            fsa_mid: FsaTierConfig {
                max_size: 1024,
                granularity: 64,
                page_size: 64 * 1024,
                pages_per_region: 64,
            },
            coalesce_mid: CoalesceTierConfig {
                min_size: 1024,
                max_size: 32 * 1024,
                region_size: 2 * 1024 * 1024,
                alignment: 16,
            },
            coalesce_large: CoalesceTierConfig {
                min_size: 32 * 1024,
                max_size: 1024 * 1024,
                region_size: 32 * 1024 * 1024,
                alignment: 16,
            },
            flush_interval_ms: 250,
            start_flush_thread: true,
        }
    }
}

impl HeapConfig {
    /// Requests above this route to the large heap.
    #[must_use]
    pub fn large_threshold(&self) -> usize {
        self.coalesce_large.max_size
    }

    /// Checks the whole configuration. [`crate::heap::TieredHeap::new`]
    /// panics on the error this returns.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fsa_small.validate("fsa small tier")?;
        self.fsa_mid.validate("fsa mid tier")?;
        self.coalesce_mid.validate()?;
        self.coalesce_large.validate()?;

        let thresholds = [
            self.fsa_small.max_size,
            self.fsa_mid.max_size,
            self.coalesce_mid.max_size,
            self.coalesce_large.max_size,
        ];
        for pair in thresholds.windows(2) {
            if pair[1] <= pair[0] {
                return Err(ConfigError::ThresholdOrder {
                    prev: pair[0],
                    next: pair[1],
                });
            }
        }
        // The coalesce tiers must pick up exactly where the tier below
        // them stops, or a band of sizes would have no owner.
        if self.coalesce_mid.min_size > self.fsa_mid.max_size {
            return Err(ConfigError::ThresholdGap {
                prev_max: self.fsa_mid.max_size,
                min: self.coalesce_mid.min_size,
                max: self.coalesce_mid.max_size,
            });
        }
        if self.coalesce_large.min_size > self.coalesce_mid.max_size {
            return Err(ConfigError::ThresholdGap {
                prev_max: self.coalesce_mid.max_size,
                min: self.coalesce_large.min_size,
                max: self.coalesce_large.max_size,
            });
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::Zero { what: "flush interval" });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        HeapConfig::default().validate().expect("default config");
    }

    #[test]
    fn rejects_unordered_thresholds() {
        let mut config = HeapConfig::default();
        config.fsa_mid.max_size = config.fsa_small.max_size;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ThresholdOrder { .. })
        ));
    }

    #[test]
    fn rejects_threshold_gap() {
        let mut config = HeapConfig::default();
        config.coalesce_mid.min_size = config.fsa_mid.max_size * 2;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ThresholdGap { .. })
        ));
    }

    #[test]
    fn rejects_region_smaller_than_max_allocation() {
        let mut config = HeapConfig::default();
        config.coalesce_large.region_size = config.coalesce_large.max_size / 2;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RegionTooSmall { .. })
        ));
    }

    #[test]
    fn rejects_non_page_multiple_region() {
        let mut config = HeapConfig::default();
        config.coalesce_mid.region_size += 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotAMultiple { .. })
        ));
    }

    #[test]
    fn rejects_zero_flush_interval() {
        let mut config = HeapConfig::default();
        config.flush_interval_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Zero { .. })));
    }
}
