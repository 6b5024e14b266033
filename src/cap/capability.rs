//! Capability Values and Permissions
//!
//! Defines the capability primitive used throughout the memory core.
//!
//! # Capability Structure
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Capability                          │
//! ├──────────────────────────────────────────────────────────┤
//! │  address: usize          - Cursor within the bounds      │
//! │  base / length           - Accessible region             │
//! │  permissions             - Permitted operations          │
//! │  otype: u32              - Object type, 0 when unsealed  │
//! │  generation: u32         - Allocation incarnation        │
//! │  tag: bool               - Validity                      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Security Properties
//! - Fields are private: capabilities only come out of the runtime
//! - Bounds and permissions are monotone: derivation can only shrink them
//! - Sealed capabilities are immutable; touching one clears its tag

use core::fmt;

use bitflags::bitflags;

bitflags! {
    /// Permissions carried by a capability.
    ///
    /// Deriving a capability can remove permissions but never add them.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Permissions: u32 {
        /// May be stored outside of the holder's stack.
        const GLOBAL = 1 << 0;
        /// May load data.
        const LOAD = 1 << 1;
        /// May store data.
        const STORE = 1 << 2;
        /// May load and store capabilities.
        const LOAD_STORE_CAPABILITY = 1 << 3;
        /// May seal other capabilities (sealing keys only).
        const SEAL = 1 << 4;
        /// May unseal other capabilities (sealing keys only).
        const UNSEAL = 1 << 5;
        /// Software-defined permission.
        const USER0 = 1 << 6;
    }
}

impl Permissions {
    /// Permissions on a freshly allocated heap object.
    pub const HEAP: Self = Self::GLOBAL
        .union(Self::LOAD)
        .union(Self::STORE)
        .union(Self::LOAD_STORE_CAPABILITY);
}

/// Object type of an unsealed capability.
pub const OTYPE_UNSEALED: u32 = 0;

/// A capability: an unforgeable, bounded, permission-carrying reference.
///
/// A capability whose tag is clear is inert: every check fails on it.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    address: usize,
    base: usize,
    length: usize,
    permissions: Permissions,
    otype: u32,
    generation: u32,
    tag: bool,
}

impl Capability {
    /// Create a null (untagged) capability.
    pub const fn null() -> Self {
        Self {
            address: 0,
            base: 0,
            length: 0,
            permissions: Permissions::empty(),
            otype: OTYPE_UNSEALED,
            generation: 0,
            tag: false,
        }
    }

    /// Create a new tagged capability covering `[base, base + length)`.
    ///
    /// Only the allocator mints capabilities.
    pub(crate) const fn new(
        base: usize,
        length: usize,
        permissions: Permissions,
        generation: u32,
    ) -> Self {
        Self {
            address: base,
            base,
            length,
            permissions,
            otype: OTYPE_UNSEALED,
            generation,
            tag: true,
        }
    }

    /// Check if this is the null capability.
    #[inline]
    pub fn is_null(&self) -> bool {
        *self == Self::null()
    }

    /// Check the validity tag.
    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.tag
    }

    /// Check whether this capability is sealed.
    #[inline]
    pub const fn is_sealed(&self) -> bool {
        self.otype != OTYPE_UNSEALED
    }

    #[inline]
    pub const fn address(&self) -> usize {
        self.address
    }

    #[inline]
    pub const fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub const fn length(&self) -> usize {
        self.length
    }

    /// One past the last accessible byte.
    #[inline]
    pub const fn top(&self) -> usize {
        self.base.saturating_add(self.length)
    }

    #[inline]
    pub const fn permissions(&self) -> Permissions {
        self.permissions
    }

    #[inline]
    pub const fn otype(&self) -> u32 {
        self.otype
    }

    /// Allocation generation this capability was minted for.
    #[inline]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Check if this capability carries all of `required`.
    #[inline]
    pub const fn has_permissions(&self, required: Permissions) -> bool {
        self.permissions.contains(required)
    }

    /// Move the address cursor. Bounds are unchanged.
    ///
    /// Modifying a sealed capability clears its tag.
    #[must_use]
    pub fn with_address(mut self, address: usize) -> Self {
        if self.is_sealed() {
            self.tag = false;
        }
        self.address = address;
        self
    }

    /// Derive a capability with narrower bounds.
    ///
    /// Returns None if this capability is untagged or sealed, or if the
    /// requested region is not inside the current bounds.
    pub fn set_bounds(&self, base: usize, length: usize) -> Option<Self> {
        if !self.tag || self.is_sealed() {
            return None;
        }
        let top = base.checked_add(length)?;
        if base < self.base || top > self.top() {
            return None;
        }
        Some(Self {
            address: base,
            base,
            length,
            ..*self
        })
    }

    /// Derive a capability holding only the permissions present in both
    /// this capability and `mask`.
    #[must_use]
    pub fn and_permissions(mut self, mask: Permissions) -> Self {
        if self.is_sealed() {
            self.tag = false;
        }
        self.permissions = self.permissions.intersection(mask);
        self
    }

    /// Bitwise comparison of every field, including the tag.
    #[inline]
    pub fn exact_eq(&self, other: &Self) -> bool {
        self == other
    }

    /// Whether the whole of `[base, base + length)` is covered.
    #[inline]
    pub const fn covers(&self, base: usize, length: usize) -> bool {
        match base.checked_add(length) {
            Some(top) => base >= self.base && top <= self.top(),
            None => false,
        }
    }

    /// Resolve an access of `len` bytes at `offset` past the cursor.
    ///
    /// # Returns
    /// The absolute address of the access, or None if:
    /// - The capability is untagged or sealed
    /// - It lacks any of `required`
    /// - The access overflows or leaves the bounds
    pub fn resolve(&self, offset: usize, len: usize, required: Permissions) -> Option<usize> {
        if !self.tag || self.is_sealed() || !self.has_permissions(required) {
            return None;
        }
        let start = self.address.checked_add(offset)?;
        if self.covers(start, len) {
            Some(start)
        } else {
            None
        }
    }

    /// Seal with `otype`. Sealing an untagged or sealed capability yields
    /// an untagged one.
    pub(crate) fn seal(mut self, otype: u32) -> Self {
        if !self.tag || self.is_sealed() || otype == OTYPE_UNSEALED {
            self.tag = false;
        }
        self.otype = otype;
        self
    }

    /// Unseal if this capability is tagged and sealed with `otype`.
    pub(crate) fn unseal(mut self, otype: u32) -> Option<Self> {
        if !self.tag || otype == OTYPE_UNSEALED || self.otype != otype {
            return None;
        }
        self.otype = OTYPE_UNSEALED;
        Some(self)
    }

    /// Clear the tag. Used by the revocation sweep.
    #[inline]
    pub(crate) fn invalidate(&mut self) {
        self.tag = false;
    }
}

impl Default for Capability {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "Cap(null)");
        }
        write!(
            f,
            "Cap({:#x} [{:#x}..{:#x}) {:?} gen={}",
            self.address,
            self.base,
            self.top(),
            self.permissions,
            self.generation
        )?;
        if self.is_sealed() {
            write!(f, " otype={:#x}", self.otype)?;
        }
        if !self.tag {
            write!(f, " untagged")?;
        }
        write!(f, ")")
    }
}
