//! Allocation Records
//!
//! One record per chunk carved from the arena, from allocation until the
//! chunk leaves quarantine.
//!
//! ```text
//!   Allocated ──free / last claim dropped──▶ PendingRevocation
//!   PendingRevocation ──epoch finished──▶ Free (record removed)
//! ```

use alloc::vec::Vec;

use super::quota::QuotaId;

/// Lifecycle state of the memory at an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Allocated,
    PendingRevocation,
    Free,
}

/// A quota's shared ownership of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Claim {
    pub(crate) quota: QuotaId,
    pub(crate) count: u32,
}

#[derive(Debug)]
pub(crate) struct AllocationRecord {
    pub(crate) base: usize,
    /// Bytes charged to quotas and covered by the capability.
    pub(crate) length: usize,
    pub(crate) owner: Option<QuotaId>,
    pub(crate) claims: Vec<Claim>,
    pub(crate) generation: u32,
    pub(crate) sealed: bool,
    pub(crate) state: RecordState,
}

impl AllocationRecord {
    pub(crate) fn new(
        base: usize,
        length: usize,
        owner: QuotaId,
        generation: u32,
        sealed: bool,
    ) -> Self {
        Self {
            base,
            length,
            owner: Some(owner),
            claims: Vec::new(),
            generation,
            sealed,
            state: RecordState::Allocated,
        }
    }

    #[inline]
    pub(crate) fn top(&self) -> usize {
        self.base + self.length
    }

    #[inline]
    pub(crate) fn is_live(&self) -> bool {
        self.state == RecordState::Allocated
    }

    /// No quota holds the allocation any more.
    #[inline]
    pub(crate) fn is_unreferenced(&self) -> bool {
        self.owner.is_none() && self.claims.is_empty()
    }

    pub(crate) fn claim_of(&self, quota: QuotaId) -> Option<&Claim> {
        self.claims.iter().find(|c| c.quota == quota)
    }

    /// Add one claim reference for `quota`. Returns true if this is the
    /// quota's first claim, i.e. the one that must be paid for.
    pub(crate) fn add_claim(&mut self, quota: QuotaId, count: u32) -> bool {
        match self.claims.iter_mut().find(|c| c.quota == quota) {
            Some(claim) => {
                claim.count = claim.count.saturating_add(count);
                false
            }
            None => {
                self.claims.push(Claim { quota, count });
                true
            }
        }
    }

    /// Drop one claim reference for `quota`. Returns Some(true) if that was
    /// the last one, None if the quota holds no claim.
    pub(crate) fn drop_claim(&mut self, quota: QuotaId) -> Option<bool> {
        let ix = self.claims.iter().position(|c| c.quota == quota)?;
        let claim = &mut self.claims[ix];
        // A saturated count stays pinned.
        if claim.count != u32::MAX {
            claim.count -= 1;
        }
        if claim.count == 0 {
            self.claims.swap_remove(ix);
            Some(true)
        } else {
            Some(false)
        }
    }

    /// Remove every claim reference `quota` holds.
    pub(crate) fn drop_all_claims(&mut self, quota: QuotaId) -> bool {
        let before = self.claims.len();
        self.claims.retain(|c| c.quota != quota);
        self.claims.len() != before
    }
}
