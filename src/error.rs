//! Runtime Error Codes
//!
//! Every fallible operation of the memory core returns a `HeapError`.
//! Errors are values, never panics: a compartment that passes bad
//! capabilities gets an error back and the runtime stays healthy.
//!
//! # Compartment ABI
//! Cross-compartment calls return negative errno values. `HeapError::errno`
//! gives the value a compartment sees.

use core::fmt;

/// errno values used by the compartment call ABI.
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOMEM: i32 = 12;
    pub const EINVAL: i32 = 22;
    pub const ETIMEDOUT: i32 = 110;
}

/// Error type for allocator, revocation and token operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// The arena cannot satisfy the request, even after reclaiming
    /// everything in quarantine.
    OutOfMemory,
    /// The quota does not have enough budget left.
    QuotaExceeded,
    /// The capability failed a tag, bounds, exactness, seal or liveness
    /// check.
    InvalidCapability,
    /// A blocking wait ran out of time.
    Timeout,
    /// The quota capability is invalid, lacks the required permission, or
    /// does not own (or claim) the allocation.
    NotOwner,
}

impl HeapError {
    /// The negative errno returned across a compartment boundary.
    #[inline]
    pub const fn errno(self) -> i32 {
        match self {
            Self::OutOfMemory | Self::QuotaExceeded => -errno::ENOMEM,
            Self::InvalidCapability => -errno::EINVAL,
            Self::Timeout => -errno::ETIMEDOUT,
            Self::NotOwner => -errno::EPERM,
        }
    }

    /// Whether retrying later (with more time) could succeed.
    #[inline]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::QuotaExceeded => write!(f, "quota exceeded"),
            Self::InvalidCapability => write!(f, "invalid capability"),
            Self::Timeout => write!(f, "timed out"),
            Self::NotOwner => write!(f, "not owner"),
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = core::result::Result<T, HeapError>;
