//! Allocator Quotas
//!
//! An `AllocatorCapability` authorizes allocation against one quota. It is
//! a plain copyable value: compartments may hand narrowed copies to others.
//! The budget itself lives in the heap's quota table.

use core::fmt;

use bitflags::bitflags;

bitflags! {
    /// Operations an allocator capability authorizes.
    ///
    /// Freeing is implicit and cannot be removed.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AllocatorPermissions: u32 {
        /// Allocate and claim against the quota.
        const ALLOCATE = 1 << 0;
        /// Release everything the quota owns in one call.
        const FREE_ALL = 1 << 1;
    }
}

/// Identifier of a quota within one heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QuotaId(u32);

impl QuotaId {
    pub(crate) const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for QuotaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "quota#{}", self.0)
    }
}

/// Capability to allocate against a quota.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AllocatorCapability {
    heap: u32,
    id: QuotaId,
    permissions: AllocatorPermissions,
    tag: bool,
}

impl AllocatorCapability {
    pub(crate) const fn new(heap: u32, id: QuotaId, permissions: AllocatorPermissions) -> Self {
        Self {
            heap,
            id,
            permissions,
            tag: true,
        }
    }

    /// An allocator capability that authorizes nothing.
    pub const fn null() -> Self {
        Self {
            heap: 0,
            id: QuotaId(0),
            permissions: AllocatorPermissions::empty(),
            tag: false,
        }
    }

    #[inline]
    pub const fn id(&self) -> QuotaId {
        self.id
    }

    #[inline]
    pub const fn permissions(&self) -> AllocatorPermissions {
        self.permissions
    }

    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.tag
    }

    #[inline]
    pub(crate) const fn heap(&self) -> u32 {
        self.heap
    }

    /// Derive a copy that keeps only the permissions also in `mask`.
    #[must_use]
    pub fn permissions_and(mut self, mask: AllocatorPermissions) -> Self {
        self.permissions = self.permissions.intersection(mask);
        self
    }
}

impl fmt::Debug for AllocatorCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AllocCap({} heap={} {:?}{})",
            self.id,
            self.heap,
            self.permissions,
            if self.tag { "" } else { " untagged" }
        )
    }
}

/// Budget bookkeeping for one quota.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QuotaState {
    pub(crate) limit: usize,
    pub(crate) remaining: usize,
}

/// The heap's table of quotas.
#[derive(Debug, Default)]
pub(crate) struct QuotaTable {
    quotas: alloc::vec::Vec<QuotaState>,
}

impl QuotaTable {
    pub(crate) fn create(&mut self, limit: usize) -> Option<QuotaId> {
        let id = u32::try_from(self.quotas.len()).ok()?;
        self.quotas.push(QuotaState {
            limit,
            remaining: limit,
        });
        Some(QuotaId::new(id))
    }

    pub(crate) fn get(&self, id: QuotaId) -> Option<&QuotaState> {
        self.quotas.get(id.index())
    }

    /// Take `bytes` from the budget. Fails without side effects if the
    /// budget is insufficient.
    pub(crate) fn debit(&mut self, id: QuotaId, bytes: usize) -> bool {
        match self.quotas.get_mut(id.index()) {
            Some(q) if q.remaining >= bytes => {
                q.remaining -= bytes;
                true
            }
            _ => false,
        }
    }

    /// Return `bytes` to the budget.
    ///
    /// # Panics
    /// If the refund would exceed the quota's limit: the record table and
    /// the quota table disagree.
    pub(crate) fn refund(&mut self, id: QuotaId, bytes: usize) {
        let q = self
            .quotas
            .get_mut(id.index())
            .filter(|q| q.remaining + bytes <= q.limit);
        match q {
            Some(q) => q.remaining += bytes,
            None => panic!("quota table corrupted: refund of {} to {}", bytes, id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permissions_and_narrows() {
        let cap = AllocatorCapability::new(1, QuotaId(0), AllocatorPermissions::all());
        let narrowed = cap.permissions_and(AllocatorPermissions::ALLOCATE);
        assert_eq!(narrowed.permissions(), AllocatorPermissions::ALLOCATE);
        let again = narrowed.permissions_and(AllocatorPermissions::all());
        assert_eq!(again.permissions(), AllocatorPermissions::ALLOCATE);
        assert!(again.is_valid());
    }

    #[test]
    fn test_null_is_invalid() {
        assert!(!AllocatorCapability::null().is_valid());
        assert!(AllocatorCapability::null().permissions().is_empty());
    }

    #[test]
    fn test_debit_and_refund() {
        let mut table = QuotaTable::default();
        let q = table.create(100).unwrap();
        assert!(table.debit(q, 60));
        assert!(!table.debit(q, 41));
        assert_eq!(table.get(q).unwrap().remaining, 40);
        table.refund(q, 60);
        assert_eq!(table.get(q).unwrap().remaining, 100);
    }

    #[test]
    #[should_panic(expected = "quota table corrupted")]
    fn test_over_refund_panics() {
        let mut table = QuotaTable::default();
        let q = table.create(8).unwrap();
        table.refund(q, 8);
    }
}
