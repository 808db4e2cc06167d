//! Cache configuration.

use crate::error::{CoreError, CoreResult};

/// Write-rate budget for the IO governor.
///
/// `allowance` bytes may be written across `ops` operations every `seconds`
/// seconds. The governor derives a per-operation byte allowance and a base
/// polling interval from these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRate {
    /// Total byte allowance per window.
    pub allowance: u32,
    /// Number of write operations per window.
    pub ops: u32,
    /// Window length in seconds.
    pub seconds: u32,
}

impl Default for WriteRate {
    fn default() -> Self {
        Self {
            allowance: 32 << 20, // 32 MiB
            ops: 16,
            seconds: 8,
        }
    }
}

/// Memory-pressure bands that scale the governor's polling interval.
///
/// All three values are percentages of memory-tier fill. Below `threshold`
/// the governor idles (interval doubles); at or above `boost` the interval
/// halves; at or above `super_boost` it halves again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemandBands {
    /// Demand at or below which the governor idles.
    pub threshold: u8,
    /// Demand at which the polling interval halves.
    pub boost: u8,
    /// Demand at which the polling interval quarters.
    pub super_boost: u8,
}

impl Default for DemandBands {
    fn default() -> Self {
        Self {
            threshold: 30,
            boost: 60,
            super_boost: 87,
        }
    }
}

/// Configuration for opening a cache.
///
/// `disk_quota` is the maximum bytes on disk the cache will use, journal
/// included (the data region gets `disk_quota - journal_quota`, aligned down
/// to a 1 MiB block). The journal should hold at least one full wrap of
/// entries so overwrites can be detected; at 16 bytes per record, 4 MiB of
/// journal covers 256K items.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Memory-tier capacity in bytes.
    pub memory_quota: u32,

    /// Total disk budget in bytes (journal + data region).
    pub disk_quota: u64,

    /// Journal budget in bytes, carved out of `disk_quota`.
    pub journal_quota: u32,

    /// Whether to discard any existing on-disk state at open.
    pub drop_cache: bool,

    /// Write-rate budget for the governor.
    pub write_rate: WriteRate,

    /// Memory-pressure bands for the governor.
    pub demand: DemandBands,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_quota: 4 << 20,    // 4 MiB
            disk_quota: 512 << 20,    // 512 MiB
            journal_quota: 4 << 20,   // 4 MiB
            drop_cache: false,
            write_rate: WriteRate::default(),
            demand: DemandBands::default(),
        }
    }
}

impl CacheConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the memory-tier capacity.
    #[must_use]
    pub const fn memory_quota(mut self, bytes: u32) -> Self {
        self.memory_quota = bytes;
        self
    }

    /// Sets the total disk budget.
    #[must_use]
    pub const fn disk_quota(mut self, bytes: u64) -> Self {
        self.disk_quota = bytes;
        self
    }

    /// Sets the journal budget.
    #[must_use]
    pub const fn journal_quota(mut self, bytes: u32) -> Self {
        self.journal_quota = bytes;
        self
    }

    /// Sets whether existing on-disk state is discarded at open.
    #[must_use]
    pub const fn drop_cache(mut self, value: bool) -> Self {
        self.drop_cache = value;
        self
    }

    /// Sets the write-rate budget.
    #[must_use]
    pub const fn write_rate(mut self, rate: WriteRate) -> Self {
        self.write_rate = rate;
        self
    }

    /// Sets the demand bands.
    #[must_use]
    pub const fn demand(mut self, bands: DemandBands) -> Self {
        self.demand = bands;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the memory tier is empty, the data region
    /// would be smaller than one 1 MiB block, the write rate has a zero
    /// divisor, or the demand bands are not monotonic.
    pub fn validate(&self) -> CoreResult<()> {
        if self.memory_quota == 0 {
            return Err(CoreError::invalid_config("memory_quota must be non-zero"));
        }
        if self.disk_quota <= u64::from(self.journal_quota) {
            return Err(CoreError::invalid_config(
                "disk_quota must exceed journal_quota",
            ));
        }
        if self.disk_quota - u64::from(self.journal_quota) < 1 << 20 {
            return Err(CoreError::invalid_config(
                "data region must be at least 1 MiB",
            ));
        }
        if self.write_rate.ops == 0 || self.write_rate.seconds == 0 {
            return Err(CoreError::invalid_config(
                "write_rate ops and seconds must be non-zero",
            ));
        }
        if self.demand.threshold > self.demand.boost || self.demand.boost > self.demand.super_boost
        {
            return Err(CoreError::invalid_config(
                "demand bands must satisfy threshold <= boost <= super_boost",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = CacheConfig::new()
            .memory_quota(1 << 20)
            .disk_quota(64 << 20)
            .journal_quota(64 << 10)
            .drop_cache(true);

        assert_eq!(config.memory_quota, 1 << 20);
        assert_eq!(config.disk_quota, 64 << 20);
        assert_eq!(config.journal_quota, 64 << 10);
        assert!(config.drop_cache);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn journal_must_fit_in_disk_quota() {
        let config = CacheConfig::new().disk_quota(1 << 20).journal_quota(2 << 20);
        assert!(config.validate().is_err());
    }

    #[test]
    fn data_region_needs_a_block() {
        let config = CacheConfig::new()
            .disk_quota((1 << 20) + 512)
            .journal_quota(1 << 10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_rate_divisors_rejected() {
        let mut config = CacheConfig::new();
        config.write_rate.ops = 0;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::new();
        config.write_rate.seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn demand_bands_must_be_monotonic() {
        let mut config = CacheConfig::new();
        config.demand = DemandBands {
            threshold: 80,
            boost: 60,
            super_boost: 90,
        };
        assert!(config.validate().is_err());
    }
}
