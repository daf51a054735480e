//! Arena configuration.

use once_cell::sync::Lazy;

use crate::error::{PoolError, PoolResult};
use crate::trace_set::TraceSet;

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    4096
});

/// The platform page size, queried once.
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// How the shield turns barriers into protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtectionMode {
    /// Record protection without touching page tables. Faults are delivered
    /// explicitly through the arena.
    #[default]
    Software,
    /// Apply protection with `mprotect`. A fault trap must be installed by
    /// the embedder.
    Mprotect,
}

/// `ArenaConfig` controls segment geometry, the address-space budget and the
/// number of concurrently live traces.
///
/// # Examples
///
/// ```
/// use poolgc::config::{ArenaConfig, ProtectionMode};
///
/// let config = ArenaConfig::default()
///     .with_segment_size(128 * 1024)
///     .with_max_traces(4);
/// assert!(config.validate().is_ok());
/// assert_eq!(config.protection, ProtectionMode::Software);
///
/// let broken = ArenaConfig::default().with_segment_size(1000);
/// assert!(broken.validate().is_err());
/// ```
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    pub page_size: usize,
    pub segment_size: usize,
    /// Total segment bytes the arena may hold.
    pub commit_limit: usize,
    /// Address bits per zone in reference summaries.
    pub zone_shift: u32,
    pub max_traces: usize,
    pub protection: ProtectionMode,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            page_size: page_size(),
            segment_size: 64 * 1024,        // 64KB
            commit_limit: 256 * 1024 * 1024, // 256MB
            zone_shift: 20,
            max_traces: 8,
            protection: ProtectionMode::Software,
        }
    }
}

impl ArenaConfig {
    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.segment_size = segment_size;
        self
    }

    pub fn with_commit_limit(mut self, commit_limit: usize) -> Self {
        self.commit_limit = commit_limit;
        self
    }

    pub fn with_zone_shift(mut self, zone_shift: u32) -> Self {
        self.zone_shift = zone_shift;
        self
    }

    pub fn with_max_traces(mut self, max_traces: usize) -> Self {
        self.max_traces = max_traces;
        self
    }

    pub fn with_protection(mut self, protection: ProtectionMode) -> Self {
        self.protection = protection;
        self
    }

    pub fn validate(&self) -> PoolResult<()> {
        if !self.page_size.is_power_of_two() {
            return Err(PoolError::InvalidConfig(format!(
                "page size {} is not a power of two",
                self.page_size
            )));
        }
        if self.segment_size == 0 || self.segment_size % self.page_size != 0 {
            return Err(PoolError::InvalidConfig(format!(
                "segment size {} is not a multiple of the page size {}",
                self.segment_size, self.page_size
            )));
        }
        if self.commit_limit < self.segment_size {
            return Err(PoolError::InvalidConfig(format!(
                "commit limit {} is below one segment",
                self.commit_limit
            )));
        }
        if self.zone_shift >= usize::BITS {
            return Err(PoolError::InvalidConfig(format!(
                "zone shift {} exceeds the address width",
                self.zone_shift
            )));
        }
        if self.max_traces == 0 || self.max_traces > TraceSet::CAPACITY {
            return Err(PoolError::InvalidConfig(format!(
                "max traces must be between 1 and {}",
                TraceSet::CAPACITY
            )));
        }
        Ok(())
    }
}
