//! Capability Space (CSpace)
//!
//! A CSpace is the capability-holding memory of one compartment: its
//! globals. Compartments keep long-lived capabilities here, and the
//! revocation sweep walks every registered CSpace clearing the tag of any
//! capability that points into freed memory.
//!
//! # Design
//! - Fixed-size array of capability slots
//! - Slots are addressed by CapSlot indices
//! - Operations: lookup, insert, replace, delete, sweep
//!
//! Do not hold a CSpace lock across calls into the runtime: a forced sweep
//! takes every CSpace lock. Finish the call first, then lock:
//!
//! ```
//! use panther_rt::{Runtime, RuntimeConfig, Timeout};
//!
//! let rt = Runtime::new(RuntimeConfig::default()).unwrap();
//! let space = rt.compartment_space();
//! let quota = rt.quota_new(1024).unwrap();
//!
//! let cap = rt.allocate(&mut Timeout::new(100), &quota, 64).unwrap();
//! let slot = space.lock().push(cap).unwrap();
//! // Or, equivalently:
//! let _again = rt.stash(&space, cap).unwrap();
//! # let _ = slot;
//! ```

use alloc::sync::Arc;

use spin::Mutex;

use super::capability::Capability;
use crate::revoke::ShadowBitmap;

/// Number of slots in a CSpace.
pub const CSPACE_SIZE: usize = 64;

/// A CSpace shared between its compartment and the revoker.
pub type SharedCSpace = Arc<Mutex<CSpace>>;

/// A slot index in a CSpace.
///
/// This is a newtype to prevent using arbitrary integers as slot indices.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct CapSlot(u32);

impl CapSlot {
    /// Create a new slot index.
    ///
    /// Returns None if the index is out of range.
    #[inline]
    pub const fn new(index: u32) -> Option<Self> {
        if (index as usize) < CSPACE_SIZE {
            Some(Self(index))
        } else {
            None
        }
    }

    /// Get the index value.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// First slot.
    pub const FIRST: Self = Self(0);
}

/// Error type for CSpace operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CSpaceError {
    /// The slot is already occupied.
    SlotOccupied,
    /// The slot is empty.
    SlotEmpty,
    /// No free slot is left.
    Full,
}

impl core::fmt::Display for CSpaceError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::SlotOccupied => write!(f, "slot already occupied"),
            Self::SlotEmpty => write!(f, "slot is empty"),
            Self::Full => write!(f, "capability space is full"),
        }
    }
}

/// Capability storage for a compartment.
///
/// Slots that held a revoked capability keep it with the tag cleared, the
/// same way a tagged memory word keeps its bits after revocation.
#[derive(Debug)]
pub struct CSpace {
    slots: [Capability; CSPACE_SIZE],
}

impl CSpace {
    /// Create a new empty CSpace.
    pub const fn new() -> Self {
        const NULL: Capability = Capability::null();
        Self {
            slots: [NULL; CSPACE_SIZE],
        }
    }

    /// Create an empty CSpace ready to be registered with a revoker.
    pub fn shared() -> SharedCSpace {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Look up the capability in a slot.
    ///
    /// A revoked capability is returned as-is (untagged).
    #[inline]
    pub fn lookup(&self, slot: CapSlot) -> Result<Capability, CSpaceError> {
        let cap = self.slots[slot.index()];
        if cap.is_null() {
            Err(CSpaceError::SlotEmpty)
        } else {
            Ok(cap)
        }
    }

    /// Insert a capability into a slot.
    ///
    /// Fails if the slot is already occupied.
    pub fn insert(&mut self, slot: CapSlot, cap: Capability) -> Result<(), CSpaceError> {
        if !self.slots[slot.index()].is_null() {
            return Err(CSpaceError::SlotOccupied);
        }
        self.slots[slot.index()] = cap;
        Ok(())
    }

    /// Insert a capability into the first free slot.
    pub fn push(&mut self, cap: Capability) -> Result<CapSlot, CSpaceError> {
        let slot = self.find_free(CapSlot::FIRST).ok_or(CSpaceError::Full)?;
        self.slots[slot.index()] = cap;
        Ok(slot)
    }

    /// Replace a capability in a slot.
    ///
    /// Returns the old capability.
    pub fn replace(&mut self, slot: CapSlot, cap: Capability) -> Capability {
        core::mem::replace(&mut self.slots[slot.index()], cap)
    }

    /// Delete a capability from a slot.
    ///
    /// Returns the deleted capability, or error if slot is empty.
    pub fn delete(&mut self, slot: CapSlot) -> Result<Capability, CSpaceError> {
        if self.slots[slot.index()].is_null() {
            return Err(CSpaceError::SlotEmpty);
        }
        Ok(core::mem::replace(
            &mut self.slots[slot.index()],
            Capability::null(),
        ))
    }

    /// Find a free slot.
    ///
    /// Returns the first empty slot >= start_from.
    pub fn find_free(&self, start_from: CapSlot) -> Option<CapSlot> {
        (start_from.index()..CSPACE_SIZE)
            .find(|&i| self.slots[i].is_null())
            .map(|i| CapSlot(i as u32))
    }

    /// Number of tagged capabilities held.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|cap| cap.is_valid()).count()
    }

    /// Clear the tag of every capability in `[start, start + count)` whose
    /// base is painted in `bitmap`.
    ///
    /// Returns the number of capabilities revoked.
    pub(crate) fn sweep(&mut self, start: usize, count: usize, bitmap: &ShadowBitmap) -> usize {
        let end = start.saturating_add(count).min(CSPACE_SIZE);
        let mut revoked = 0;
        for cap in self.slots[start.min(end)..end].iter_mut() {
            if cap.is_valid() && bitmap.bit_get(cap.base()) {
                cap.invalidate();
                revoked += 1;
            }
        }
        revoked
    }
}

impl Default for CSpace {
    fn default() -> Self {
        Self::new()
    }
}
