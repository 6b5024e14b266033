//! Runtime Configuration
//!
//! Sizes and revoker tuning fixed at construction. Defaults are sized for
//! a small embedded target.

use core::fmt;

use crate::mm::GRANULE;
use crate::revoke::RevokerMode;

/// Default arena size (64 KiB).
pub const DEFAULT_HEAP_SIZE: usize = 64 * 1024;

/// Default number of capability slots swept per tick.
pub const DEFAULT_SWEEP_SLOTS: usize = 16;

/// Smallest arena accepted.
pub const MIN_HEAP_SIZE: usize = 1024;

/// Construction-time configuration of a `Runtime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Arena size in bytes. Must be a multiple of the granule.
    pub heap_size: usize,
    /// Who drives the revocation sweep.
    pub revoker_mode: RevokerMode,
    /// Capability slots swept per tick.
    pub sweep_slots_per_tick: usize,
}

impl RuntimeConfig {
    pub const fn new() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_SIZE,
            revoker_mode: RevokerMode::Background,
            sweep_slots_per_tick: DEFAULT_SWEEP_SLOTS,
        }
    }

    #[must_use]
    pub const fn with_heap_size(mut self, heap_size: usize) -> Self {
        self.heap_size = heap_size;
        self
    }

    #[must_use]
    pub const fn with_revoker_mode(mut self, mode: RevokerMode) -> Self {
        self.revoker_mode = mode;
        self
    }

    #[must_use]
    pub const fn with_sweep_slots(mut self, slots: usize) -> Self {
        self.sweep_slots_per_tick = slots;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heap_size < MIN_HEAP_SIZE {
            return Err(ConfigError::HeapTooSmall(self.heap_size));
        }
        if self.heap_size % GRANULE != 0 {
            return Err(ConfigError::HeapUnaligned(self.heap_size));
        }
        if self.sweep_slots_per_tick == 0 {
            return Err(ConfigError::NoSweepProgress);
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Error type for runtime construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The heap size is below `MIN_HEAP_SIZE`.
    HeapTooSmall(usize),
    /// The heap size is not a whole number of granules.
    HeapUnaligned(usize),
    /// A tick would sweep nothing.
    NoSweepProgress,
    /// The arena's backing memory could not be obtained.
    HeapUnavailable,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeapTooSmall(size) => {
                write!(f, "heap of {} bytes is below the {} byte minimum", size, MIN_HEAP_SIZE)
            }
            Self::HeapUnaligned(size) => {
                write!(f, "heap size {} is not a multiple of {}", size, GRANULE)
            }
            Self::NoSweepProgress => write!(f, "sweep slots per tick must be non-zero"),
            Self::HeapUnavailable => write!(f, "heap memory unavailable"),
        }
    }
}
