//! Sealing Keys
//!
//! A sealing key is a capability whose single-address bounds name one
//! object type. SEAL lets its holder create objects of that type; UNSEAL
//! lets its holder open them. Either can be dropped before handing the key
//! to another compartment.

use core::fmt;

use crate::cap::{Capability, Permissions};

/// Capability authorizing sealing and unsealing of one object type.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SealingKey(Capability);

impl SealingKey {
    pub(crate) const fn new(otype: u32) -> Self {
        Self(Capability::new(
            otype as usize,
            1,
            Permissions::GLOBAL.union(Permissions::SEAL).union(Permissions::UNSEAL),
            0,
        ))
    }

    /// Wrap an arbitrary capability as a key. Every use of it is checked.
    pub fn from_capability(cap: Capability) -> Self {
        Self(cap)
    }

    #[inline]
    pub fn as_capability(&self) -> &Capability {
        &self.0
    }

    #[inline]
    pub fn permissions(&self) -> Permissions {
        self.0.permissions()
    }

    /// Derive a key carrying only the permissions also present in `mask`.
    #[must_use]
    pub fn permissions_and(self, mask: Permissions) -> Self {
        Self(self.0.and_permissions(mask))
    }

    /// The object type this key names, if it is usable with `required`.
    pub(crate) fn otype(&self, required: Permissions) -> Option<u32> {
        let cap = &self.0;
        if !cap.is_valid() || cap.is_sealed() || !cap.has_permissions(required) {
            return None;
        }
        if !cap.covers(cap.address(), 1) {
            return None;
        }
        u32::try_from(cap.address()).ok()
    }
}

impl fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealingKey({:?})", self.0)
    }
}
