//! Heap Memory Management
//!
//! Provides:
//! - The arena: one contiguous region carved by a first-fit engine
//! - Allocation records, claims and quota accounting
//! - Quarantine: freed chunks waiting for revocation
//! - `Heap`: the allocator context that ties them together
//!
//! # Security Principles
//! - Freed memory is zeroed and never reused before revocation
//! - Every capability handed in is checked against the record table
//! - Unsafe code is confined to the arena

mod arena;
mod heap;
mod quarantine;
mod quota;
mod record;

pub use arena::Arena;
pub use heap::{AllocateWait, Heap};
pub use quota::{AllocatorCapability, AllocatorPermissions, QuotaId};
pub use record::RecordState;

/// log2 of the allocation granule.
pub const GRANULE_SHIFT: usize = 3;

/// Allocation granule in bytes. Sizes and bases are multiples of this.
pub const GRANULE: usize = 1 << GRANULE_SHIFT;

/// Round `size` up to a whole number of granules.
#[inline]
pub const fn round_up(size: usize) -> Option<usize> {
    match size.checked_add(GRANULE - 1) {
        Some(padded) => Some(padded & !(GRANULE - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0), Some(0));
        assert_eq!(round_up(1), Some(8));
        assert_eq!(round_up(8), Some(8));
        assert_eq!(round_up(61), Some(64));
        assert_eq!(round_up(usize::MAX), None);
    }
}
