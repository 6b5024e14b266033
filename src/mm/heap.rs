//! Quota Heap
//!
//! The allocator context: arena, record table, quarantine and quota table
//! behind one lock, plus the revoker and the futex allocators sleep on.
//!
//! # Allocation Failure Classes
//! | Class         | Meaning                                   | Outcome            |
//! |---------------|-------------------------------------------|--------------------|
//! | Permanent     | larger than the arena                     | `OutOfMemory`      |
//! | Quota         | budget insufficient                       | `QuotaExceeded`    |
//! | Revocation    | quarantine + free space would fit it      | dequeue, or kick and wait |
//! | HeapFull      | nothing would fit it                      | wait for a free    |
//!
//! # Lock Order
//! heap lock → revoker lock. Anything that may sweep (and so take CSpace
//! locks) runs with the heap lock dropped.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use log::{debug, trace, warn};
use spin::Mutex;

use super::arena::Arena;
use super::quarantine::Quarantine;
use super::quota::{AllocatorCapability, AllocatorPermissions, QuotaId, QuotaTable};
use super::record::{AllocationRecord, RecordState};
use super::round_up;
use crate::cap::{Capability, Permissions, SharedCSpace};
use crate::error::{HeapError, Result};
use crate::revoke::{Revoker, RevokerMode};
use crate::sync::{Futex, SpinWaiter, Timeout, Waiter};

bitflags! {
    /// Conditions an allocation is willing to block on.
    ///
    /// Quota exhaustion never blocks.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AllocateWait: u32 {
        /// Wait for quarantined memory to be revoked.
        const REVOCATION_NEEDED = 1 << 0;
        /// Wait for another allocation to be freed.
        const HEAP_FULL = 1 << 1;
        const ANY = Self::REVOCATION_NEEDED.bits() | Self::HEAP_FULL.bits();
    }
}

/// Quarantined chunks moved back to the arena on each allocation.
const DEQUEUE_ON_ALLOCATE: usize = 4;
/// Quarantined chunks moved back to the arena on each free.
const DEQUEUE_ON_FREE: usize = 3;

/// Free futex value while no allocator sleeps on it.
const NO_WAITERS: u32 = u32::MAX;

static NEXT_HEAP_ID: AtomicU32 = AtomicU32::new(1);

enum Shortfall {
    Permanent,
    Quota,
    Revocation { epoch: u32 },
    HeapFull,
}

/// What a successful free did to the allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    OwnerFreed,
    ClaimDropped { last: bool },
}

/// Everything guarded by the heap lock.
struct HeapState {
    arena: Arena,
    records: BTreeMap<usize, AllocationRecord>,
    quarantine: Quarantine,
    quotas: QuotaTable,
    next_generation: u32,
}

impl HeapState {
    fn check_quota(
        &self,
        heap: u32,
        cap: &AllocatorCapability,
        required: AllocatorPermissions,
    ) -> Result<QuotaId> {
        if !cap.is_valid()
            || cap.heap() != heap
            || !cap.permissions().contains(required)
            || self.quotas.get(cap.id()).is_none()
        {
            warn!("invalid allocator capability {:?}", cap);
            return Err(HeapError::NotOwner);
        }
        Ok(cap.id())
    }

    fn record_at(&self, addr: usize) -> Option<&AllocationRecord> {
        self.records
            .range(..=addr)
            .next_back()
            .map(|(_, rec)| rec)
            .filter(|rec| addr < rec.top())
    }

    /// The live record `cap` was minted for.
    fn live_record(&self, cap: &Capability) -> Result<&AllocationRecord> {
        if !cap.is_valid() || cap.is_sealed() {
            return Err(HeapError::InvalidCapability);
        }
        match self.record_at(cap.base()) {
            Some(rec)
                if rec.is_live()
                    && rec.generation == cap.generation()
                    && cap.top() <= rec.top() =>
            {
                Ok(rec)
            }
            _ => {
                debug!("stale or foreign capability {:?}", cap);
                Err(HeapError::InvalidCapability)
            }
        }
    }

    fn next_generation(&mut self) -> u32 {
        let generation = self.next_generation;
        self.next_generation = match generation.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        generation
    }

    /// Return up to `max` revoked chunks to the arena.
    fn dequeue(&mut self, revoker: &Revoker, max: usize) -> usize {
        let mut dequeued = 0;
        while dequeued < max {
            let Some((base, len)) = self.quarantine.pop_finished(revoker.epoch()) else {
                break;
            };
            match self.records.remove(&base) {
                Some(rec) if rec.state == RecordState::PendingRevocation && rec.length == len => {}
                other => panic!(
                    "record table corrupted: quarantined chunk {:#x} has record {:?}",
                    base, other
                ),
            }
            revoker.bitmap().paint_range(base, base + len, false);
            self.arena.release(base, len);
            dequeued += 1;
        }
        if dequeued > 0 {
            trace!(
                "dequeued {} chunks, {} bytes left in quarantine",
                dequeued,
                self.quarantine.bytes()
            );
        }
        dequeued
    }

    fn try_allocate(
        &mut self,
        revoker: &Revoker,
        quota: QuotaId,
        len: usize,
        sealed: bool,
    ) -> core::result::Result<(usize, u32), Shortfall> {
        self.dequeue(revoker, DEQUEUE_ON_ALLOCATE);
        if len > self.arena.size() {
            return Err(Shortfall::Permanent);
        }
        if self.quotas.get(quota).map_or(true, |q| q.remaining < len) {
            return Err(Shortfall::Quota);
        }
        let mut carved = self.arena.carve(len);
        // Everything already revoked goes back before deciding how to fail.
        if carved.is_none() && self.dequeue(revoker, usize::MAX) > 0 {
            carved = self.arena.carve(len);
        }
        let Some(base) = carved else {
            let quarantined = self.quarantine.bytes();
            return match self.quarantine.oldest_epoch() {
                Some(epoch)
                    if quarantined > 0 && quarantined + self.arena.free_bytes() >= len =>
                {
                    Err(Shortfall::Revocation { epoch })
                }
                _ => Err(Shortfall::HeapFull),
            };
        };
        if !self.quotas.debit(quota, len) {
            self.arena.release(base, len);
            return Err(Shortfall::Quota);
        }
        let generation = self.next_generation();
        self.records.insert(
            base,
            AllocationRecord::new(base, len, quota, generation, sealed),
        );
        Ok((base, generation))
    }

    /// Scrub, paint and quarantine an allocation nobody holds any more.
    fn quarantine_chunk(&mut self, revoker: &Revoker, base: usize) {
        let Some(rec) = self.records.get_mut(&base) else {
            return;
        };
        rec.state = RecordState::PendingRevocation;
        let len = rec.length;
        self.arena.zero(base, len);
        revoker.bitmap().paint_range(base, base + len, true);
        let epoch = revoker.epoch();
        self.quarantine.push(epoch, base, len);
        trace!("chunk {:#x}+{:#x} quarantined at epoch {}", base, len, epoch);

        self.dequeue(revoker, DEQUEUE_ON_FREE);
        let free = self.arena.free_bytes();
        if self.quarantine.bytes() > free / 4 || free < self.arena.size() / 8 {
            revoker.start();
        }
    }

    /// Validate and, unless `dry_run`, perform a free of `cap` by `quota`.
    fn release(
        &mut self,
        revoker: &Revoker,
        quota: QuotaId,
        cap: &Capability,
        allow_sealed: bool,
        dry_run: bool,
    ) -> Result<()> {
        let base = self.live_record(cap)?.base;
        let Some(rec) = self.records.get_mut(&base) else {
            return Err(HeapError::InvalidCapability);
        };
        let precise = cap.base() == rec.base && cap.length() == rec.length;
        let action = if precise && rec.owner == Some(quota) && (allow_sealed || !rec.sealed) {
            Release::OwnerFreed
        } else if rec.claim_of(quota).is_some() {
            Release::ClaimDropped { last: false }
        } else if rec.owner == Some(quota) {
            debug!("free of {:?} is not precise", cap);
            return Err(HeapError::InvalidCapability);
        } else {
            return Err(HeapError::NotOwner);
        };
        if dry_run {
            return Ok(());
        }

        let action = match action {
            Release::OwnerFreed => {
                rec.owner = None;
                action
            }
            Release::ClaimDropped { .. } => Release::ClaimDropped {
                last: rec.drop_claim(quota) == Some(true),
            },
        };
        let (len, unreferenced) = (rec.length, rec.is_unreferenced());
        if matches!(action, Release::OwnerFreed | Release::ClaimDropped { last: true }) {
            self.quotas.refund(quota, len);
        }
        if unreferenced {
            self.quarantine_chunk(revoker, base);
        }
        Ok(())
    }
}

/// A quota-accounted heap with deferred, revocation-gated reuse.
pub struct Heap<W: Waiter = SpinWaiter> {
    id: u32,
    state: Mutex<HeapState>,
    revoker: Revoker,
    free_futex: Futex,
    waiter: W,
}

impl Heap<SpinWaiter> {
    /// Create a heap that blocks by polling.
    pub fn new(size: usize, mode: RevokerMode, slots_per_tick: usize) -> Result<Self> {
        Self::with_waiter(size, mode, slots_per_tick, SpinWaiter::new())
    }
}

impl<W: Waiter> Heap<W> {
    /// Create a heap of `size` bytes that blocks through `waiter`.
    pub fn with_waiter(
        size: usize,
        mode: RevokerMode,
        slots_per_tick: usize,
        waiter: W,
    ) -> Result<Self> {
        let arena = Arena::new(size).ok_or(HeapError::OutOfMemory)?;
        let revoker = Revoker::new(arena.base(), arena.size(), mode, slots_per_tick);
        debug!("heap: {:?}, revoker {:?}", arena, revoker);
        Ok(Self {
            id: NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(HeapState {
                arena,
                records: BTreeMap::new(),
                quarantine: Quarantine::default(),
                quotas: QuotaTable::default(),
                next_generation: 1,
            }),
            revoker,
            free_futex: Futex::new(NO_WAITERS),
            waiter,
        })
    }

    #[inline]
    pub fn revoker(&self) -> &Revoker {
        &self.revoker
    }

    #[inline]
    pub fn waiter(&self) -> &W {
        &self.waiter
    }

    /// Make `space` subject to revocation sweeps.
    pub fn register(&self, space: &SharedCSpace) {
        self.revoker.register(space);
    }

    /// Create a quota of `limit` bytes with every allocator permission.
    pub fn quota_new(&self, limit: usize) -> Result<AllocatorCapability> {
        let id = self
            .state
            .lock()
            .quotas
            .create(limit)
            .ok_or(HeapError::OutOfMemory)?;
        Ok(AllocatorCapability::new(
            self.id,
            id,
            AllocatorPermissions::all(),
        ))
    }

    /// Total arena size.
    pub fn size(&self) -> usize {
        self.state.lock().arena.size()
    }

    /// Free bytes in the arena, not counting quarantine.
    pub fn available(&self) -> usize {
        self.state.lock().arena.free_bytes()
    }

    /// Bytes waiting in quarantine.
    pub fn quarantined(&self) -> usize {
        self.state.lock().quarantine.bytes()
    }

    /// Lifecycle state of the memory at `addr`.
    pub fn record_state(&self, addr: usize) -> RecordState {
        self.state
            .lock()
            .record_at(addr)
            .map_or(RecordState::Free, |rec| rec.state)
    }

    pub fn quota_remaining(&self, quota: &AllocatorCapability) -> Result<usize> {
        let state = self.state.lock();
        let id = state.check_quota(self.id, quota, AllocatorPermissions::empty())?;
        Ok(state.quotas.get(id).map_or(0, |q| q.remaining))
    }

    /// Allocate `size` bytes, waiting for anything that could make room.
    pub fn allocate(
        &self,
        timeout: &mut Timeout,
        quota: &AllocatorCapability,
        size: usize,
    ) -> Result<Capability> {
        self.allocate_with_flags(timeout, quota, size, AllocateWait::ANY)
    }

    /// Allocate `size` bytes, rounded up to whole granules.
    ///
    /// The returned capability covers the rounded size and the quota is
    /// charged for it. The memory is zeroed.
    pub fn allocate_with_flags(
        &self,
        timeout: &mut Timeout,
        quota: &AllocatorCapability,
        size: usize,
        flags: AllocateWait,
    ) -> Result<Capability> {
        let len = match round_up(size) {
            Some(len) if len > 0 => len,
            _ => return Err(HeapError::OutOfMemory),
        };
        let (base, generation) = self.allocate_chunk(timeout, quota, len, false, flags)?;
        Ok(Capability::new(base, len, Permissions::HEAP, generation))
    }

    /// Allocate `count` elements of `size` bytes each.
    pub fn allocate_array(
        &self,
        timeout: &mut Timeout,
        quota: &AllocatorCapability,
        count: usize,
        size: usize,
        flags: AllocateWait,
    ) -> Result<Capability> {
        let total = count.checked_mul(size).ok_or(HeapError::OutOfMemory)?;
        self.allocate_with_flags(timeout, quota, total, flags)
    }

    /// Allocate a chunk for a sealed object. It is skipped by `free_all`
    /// and only its creator can free it, through the token service.
    pub(crate) fn allocate_sealed_chunk(
        &self,
        timeout: &mut Timeout,
        quota: &AllocatorCapability,
        size: usize,
    ) -> Result<Capability> {
        let len = match round_up(size) {
            Some(len) if len > 0 => len,
            _ => return Err(HeapError::OutOfMemory),
        };
        let (base, generation) = self.allocate_chunk(timeout, quota, len, true, AllocateWait::ANY)?;
        Ok(Capability::new(base, len, Permissions::HEAP, generation))
    }

    fn allocate_chunk(
        &self,
        timeout: &mut Timeout,
        quota: &AllocatorCapability,
        len: usize,
        sealed: bool,
        flags: AllocateWait,
    ) -> Result<(usize, u32)> {
        let mut state = self.state.lock();
        let id = state.check_quota(self.id, quota, AllocatorPermissions::ALLOCATE)?;
        loop {
            match state.try_allocate(&self.revoker, id, len, sealed) {
                Ok(found) => return Ok(found),
                Err(Shortfall::Permanent) => {
                    debug!("{}-byte allocation can never succeed", len);
                    return Err(HeapError::OutOfMemory);
                }
                Err(Shortfall::Quota) => {
                    debug!("{}-byte allocation exceeds {}", len, id);
                    return Err(HeapError::QuotaExceeded);
                }
                Err(Shortfall::Revocation { epoch }) => {
                    if !flags.contains(AllocateWait::REVOCATION_NEEDED) {
                        return Err(HeapError::OutOfMemory);
                    }
                    if !timeout.may_block() {
                        return Err(HeapError::Timeout);
                    }
                    if state.dequeue(&self.revoker, DEQUEUE_ON_ALLOCATE) > 0 {
                        continue;
                    }
                    debug!(
                        "quarantine holds enough for {}-byte allocation, kicking revoker",
                        len
                    );
                    self.revoker.start();
                    drop(state);
                    self.wait_for_revocation(timeout, epoch)?;
                    state = self.state.lock();
                }
                Err(Shortfall::HeapFull) => {
                    if !flags.contains(AllocateWait::HEAP_FULL) {
                        return Err(HeapError::OutOfMemory);
                    }
                    if !timeout.may_block() {
                        return Err(HeapError::Timeout);
                    }
                    debug!("not enough free space for {}-byte allocation, sleeping", len);
                    let expected =
                        u32::try_from(state.arena.free_bytes()).map_or(NO_WAITERS - 1, |free| {
                            free.min(NO_WAITERS - 1)
                        });
                    self.free_futex.store(expected);
                    // Quarantined chunks may become reusable without a
                    // free; look again after one tick.
                    let budget = if state.quarantine.is_empty() {
                        timeout.remaining
                    } else {
                        1
                    };
                    drop(state);
                    let mut slice = Timeout::new(budget);
                    let woken = self.free_futex.wait(&self.waiter, expected, &mut slice);
                    timeout.elapse(slice.elapsed);
                    if woken.is_err() && !timeout.may_block() {
                        return Err(HeapError::Timeout);
                    }
                    state = self.state.lock();
                }
            }
        }
    }

    /// Poll until memory freed at `epoch` has been revoked. Called with the
    /// heap lock dropped.
    fn wait_for_revocation(&self, timeout: &mut Timeout, epoch: u32) -> Result<()> {
        while !self.revoker.has_revocation_finished_for_epoch(epoch, false) {
            if !self.revoker.is_sweeping() {
                self.revoker.start();
            }
            self.waiter.yield_now(timeout)?;
        }
        Ok(())
    }

    fn wake_allocators(&self) {
        if self.free_futex.load() != NO_WAITERS {
            trace!("waking blocked allocators");
            self.free_futex.set_and_wake_all(&self.waiter, NO_WAITERS);
        }
    }

    /// Release `quota`'s hold on the allocation `cap` points into.
    ///
    /// - An exact capability freed by the owner ends the ownership
    /// - Otherwise one claim reference held by `quota` is dropped
    ///
    /// The memory is quarantined once nothing owns or claims it.
    pub fn free(&self, quota: &AllocatorCapability, cap: &Capability) -> Result<()> {
        let mut state = self.state.lock();
        let id = state.check_quota(self.id, quota, AllocatorPermissions::empty())?;
        state.release(&self.revoker, id, cap, false, false)?;
        self.wake_allocators();
        Ok(())
    }

    /// Check whether `free` would succeed, without freeing.
    pub fn can_free(&self, quota: &AllocatorCapability, cap: &Capability) -> Result<()> {
        let mut state = self.state.lock();
        let id = state.check_quota(self.id, quota, AllocatorPermissions::empty())?;
        state.release(&self.revoker, id, cap, false, true)
    }

    /// Free a sealed object's whole-allocation capability.
    pub(crate) fn free_sealed(
        &self,
        quota: &AllocatorCapability,
        cap: &Capability,
        dry_run: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let id = state.check_quota(self.id, quota, AllocatorPermissions::empty())?;
        state.release(&self.revoker, id, cap, true, dry_run)?;
        if !dry_run {
            self.wake_allocators();
        }
        Ok(())
    }

    /// Add a claim on the allocation `cap` points into. Returns its size.
    ///
    /// The first claim by a quota is charged the allocation size; further
    /// claims only bump the count. An owner claiming its own allocation
    /// turns its ownership into two claim references.
    pub fn claim(&self, quota: &AllocatorCapability, cap: &Capability) -> Result<usize> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let id = state.check_quota(self.id, quota, AllocatorPermissions::ALLOCATE)?;
        let base = state.live_record(cap)?.base;
        let Some(rec) = state.records.get_mut(&base) else {
            return Err(HeapError::InvalidCapability);
        };
        if rec.owner == Some(id) {
            rec.owner = None;
            rec.add_claim(id, 2);
        } else if rec.claim_of(id).is_some() {
            rec.add_claim(id, 1);
        } else {
            if !state.quotas.debit(id, rec.length) {
                debug!("claim of {} bytes exceeds {}", rec.length, id);
                return Err(HeapError::QuotaExceeded);
            }
            rec.add_claim(id, 1);
        }
        Ok(rec.length)
    }

    /// Free everything `quota` owns or claims, except sealed objects.
    /// Returns the number of bytes released from the quota.
    pub fn free_all(&self, quota: &AllocatorCapability) -> Result<usize> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let id = state.check_quota(self.id, quota, AllocatorPermissions::FREE_ALL)?;
        let held: Vec<usize> = state
            .records
            .values()
            .filter(|rec| {
                rec.is_live()
                    && !rec.sealed
                    && (rec.owner == Some(id) || rec.claim_of(id).is_some())
            })
            .map(|rec| rec.base)
            .collect();

        let mut freed = 0;
        for base in held {
            let Some(rec) = state.records.get_mut(&base) else {
                continue;
            };
            if rec.owner == Some(id) {
                rec.owner = None;
            }
            rec.drop_all_claims(id);
            let (len, unreferenced) = (rec.length, rec.is_unreferenced());
            state.quotas.refund(id, len);
            freed += len;
            if unreferenced {
                state.quarantine_chunk(&self.revoker, base);
            }
        }
        if freed > 0 {
            debug!("free_all released {} bytes from {}", freed, id);
            self.wake_allocators();
        }
        Ok(freed)
    }

    /// Start a sweep, wait for it to cover everything in quarantine, and
    /// return all of it to the arena.
    pub fn quarantine_flush(&self, timeout: &mut Timeout) -> Result<()> {
        let target = {
            let mut state = self.state.lock();
            // Everything in quarantine was freed at or before this epoch.
            let target = self.revoker.epoch().wrapping_add(1) & !1;
            self.revoker.start();
            while state.dequeue(&self.revoker, usize::MAX) > 0 {}
            if state.quarantine.is_empty() {
                return Ok(());
            }
            target
        };
        self.wait_for_revocation(timeout, target)?;
        let mut state = self.state.lock();
        state.dequeue(&self.revoker, usize::MAX);
        debug!("{} bytes left in quarantine", state.quarantine.bytes());
        Ok(())
    }

    /// Copy `buf.len()` bytes at `offset` past the capability's cursor.
    pub fn load(&self, cap: &Capability, offset: usize, buf: &mut [u8]) -> Result<()> {
        let addr = cap
            .resolve(offset, buf.len(), Permissions::LOAD)
            .ok_or(HeapError::InvalidCapability)?;
        let state = self.state.lock();
        state.live_record(cap)?;
        buf.copy_from_slice(state.arena.bytes(addr, buf.len()));
        Ok(())
    }

    /// Copy `data` to `offset` past the capability's cursor.
    pub fn store(&self, cap: &Capability, offset: usize, data: &[u8]) -> Result<()> {
        let addr = cap
            .resolve(offset, data.len(), Permissions::STORE)
            .ok_or(HeapError::InvalidCapability)?;
        let mut state = self.state.lock();
        state.live_record(cap)?;
        state.arena.bytes_mut(addr, data.len()).copy_from_slice(data);
        Ok(())
    }

    /// Read the header word of a live sealed object, given the capability
    /// to its whole allocation.
    pub(crate) fn sealed_header(&self, whole: &Capability) -> Option<u32> {
        let state = self.state.lock();
        let rec = state.live_record(whole).ok()?;
        if !rec.sealed || whole.base() != rec.base || whole.length() != rec.length {
            return None;
        }
        let word: [u8; 4] = state.arena.bytes(rec.base, 4).try_into().ok()?;
        Some(u32::from_le_bytes(word))
    }
}

impl<W: Waiter> core::fmt::Debug for Heap<W> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Heap")
            .field("id", &self.id)
            .field("revoker", &self.revoker)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: usize = 4096;

    fn heap() -> Heap {
        Heap::new(SIZE, RevokerMode::Synchronous, 64).unwrap()
    }

    /// Drive the revoker through one full sweep.
    fn sweep(heap: &Heap) {
        heap.revoker().kick();
        while heap.revoker().is_sweeping() {
            heap.revoker().tick();
        }
    }

    #[test]
    fn test_allocate_rounds_and_charges() {
        let heap = heap();
        let q = heap.quota_new(1024).unwrap();
        let cap = heap.allocate(&mut Timeout::non_blocking(), &q, 61).unwrap();
        assert_eq!(cap.length(), 64);
        assert!(cap.has_permissions(Permissions::HEAP));
        assert_eq!(heap.quota_remaining(&q), Ok(960));
        assert_eq!(heap.record_state(cap.base()), RecordState::Allocated);
    }

    #[test]
    fn test_zero_and_oversized_requests() {
        let heap = heap();
        let q = heap.quota_new(usize::MAX).unwrap();
        let mut t = Timeout::new(10);
        assert_eq!(heap.allocate(&mut t, &q, 0), Err(HeapError::OutOfMemory));
        assert_eq!(heap.allocate(&mut t, &q, SIZE + 8), Err(HeapError::OutOfMemory));
        assert_eq!(heap.allocate(&mut t, &q, usize::MAX), Err(HeapError::OutOfMemory));
        assert_eq!(
            heap.allocate_array(&mut t, &q, usize::MAX, 2, AllocateWait::ANY),
            Err(HeapError::OutOfMemory)
        );
        assert_eq!(t.elapsed, 0);
    }

    #[test]
    fn test_quota_exceeded_never_waits() {
        let heap = heap();
        let q = heap.quota_new(32).unwrap();
        let mut t = Timeout::new(100);
        assert_eq!(heap.allocate(&mut t, &q, 40), Err(HeapError::QuotaExceeded));
        assert_eq!(t.elapsed, 0);
        assert_eq!(heap.quota_remaining(&q), Ok(32));
    }

    #[test]
    fn test_allocate_needs_permission() {
        let heap = heap();
        let q = heap
            .quota_new(1024)
            .unwrap()
            .permissions_and(AllocatorPermissions::FREE_ALL);
        assert_eq!(
            heap.allocate(&mut Timeout::non_blocking(), &q, 8),
            Err(HeapError::NotOwner)
        );
        assert_eq!(
            heap.allocate(&mut Timeout::non_blocking(), &AllocatorCapability::null(), 8),
            Err(HeapError::NotOwner)
        );
    }

    #[test]
    fn test_foreign_heap_quota_rejected() {
        let a = heap();
        let b = heap();
        let qa = a.quota_new(1024).unwrap();
        assert_eq!(
            b.allocate(&mut Timeout::non_blocking(), &qa, 8),
            Err(HeapError::NotOwner)
        );
    }

    #[test]
    fn test_free_quarantines_and_refunds() {
        let heap = heap();
        let q = heap.quota_new(1024).unwrap();
        let cap = heap.allocate(&mut Timeout::non_blocking(), &q, 64).unwrap();
        heap.free(&q, &cap).unwrap();
        assert_eq!(heap.quota_remaining(&q), Ok(1024));
        assert_eq!(heap.record_state(cap.base()), RecordState::PendingRevocation);
        assert_eq!(heap.quarantined(), 64);
        assert!(heap.revoker().bitmap().bit_get(cap.base()));
        // A second free of the same capability finds no live record.
        assert_eq!(heap.free(&q, &cap), Err(HeapError::InvalidCapability));
    }

    #[test]
    fn test_free_requires_exact_capability_from_owner() {
        let heap = heap();
        let q = heap.quota_new(1024).unwrap();
        let other = heap.quota_new(1024).unwrap();
        let cap = heap.allocate(&mut Timeout::non_blocking(), &q, 64).unwrap();
        let inner = cap.set_bounds(cap.base() + 8, 16).unwrap();
        assert_eq!(heap.free(&q, &inner), Err(HeapError::InvalidCapability));
        assert_eq!(heap.free(&other, &cap), Err(HeapError::NotOwner));
        assert_eq!(heap.can_free(&q, &cap), Ok(()));
        assert_eq!(heap.record_state(cap.base()), RecordState::Allocated);
        heap.free(&q, &cap).unwrap();
    }

    #[test]
    fn test_memory_is_zeroed_between_owners() {
        let heap = heap();
        let q = heap.quota_new(SIZE).unwrap();
        let cap = heap.allocate(&mut Timeout::non_blocking(), &q, 32).unwrap();
        heap.store(&cap, 0, &[0x5a; 32]).unwrap();
        heap.free(&q, &cap).unwrap();
        sweep(&heap);
        sweep(&heap);
        heap.quarantine_flush(&mut Timeout::new(100)).unwrap();
        assert_eq!(heap.quarantined(), 0);

        let again = heap.allocate(&mut Timeout::non_blocking(), &q, 32).unwrap();
        let mut buf = [0xffu8; 32];
        heap.load(&again, 0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 32]);
    }

    #[test]
    fn test_stale_copy_fails_after_reuse() {
        let heap = heap();
        let q = heap.quota_new(SIZE).unwrap();
        let cap = heap.allocate(&mut Timeout::non_blocking(), &q, SIZE).unwrap();
        heap.free(&q, &cap).unwrap();
        // Only room for the same chunk: waits for revocation, then reuses it.
        let again = heap.allocate(&mut Timeout::new(1000), &q, SIZE).unwrap();
        assert_eq!(again.base(), cap.base());
        assert_ne!(again.generation(), cap.generation());

        let mut buf = [0u8; 8];
        assert_eq!(heap.load(&cap, 0, &mut buf), Err(HeapError::InvalidCapability));
        assert_eq!(heap.free(&q, &cap), Err(HeapError::InvalidCapability));
        assert!(heap.load(&again, 0, &mut buf).is_ok());
    }

    #[test]
    fn test_load_store_checks() {
        let heap = heap();
        let q = heap.quota_new(1024).unwrap();
        let cap = heap.allocate(&mut Timeout::non_blocking(), &q, 16).unwrap();
        heap.store(&cap, 8, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        heap.load(&cap, 8, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        assert_eq!(
            heap.store(&cap, 14, &[0; 4]),
            Err(HeapError::InvalidCapability)
        );
        let ro = cap.and_permissions(Permissions::LOAD);
        assert_eq!(heap.store(&ro, 0, &[0]), Err(HeapError::InvalidCapability));
        assert!(heap.load(&ro, 0, &mut buf).is_ok());
    }

    #[test]
    fn test_claim_keeps_memory_alive() {
        let heap = heap();
        let owner = heap.quota_new(1024).unwrap();
        let claimer = heap.quota_new(1024).unwrap();
        let cap = heap.allocate(&mut Timeout::non_blocking(), &owner, 64).unwrap();

        assert_eq!(heap.claim(&claimer, &cap), Ok(64));
        assert_eq!(heap.claim(&claimer, &cap), Ok(64));
        assert_eq!(heap.quota_remaining(&claimer), Ok(960));

        heap.free(&owner, &cap).unwrap();
        assert_eq!(heap.quota_remaining(&owner), Ok(1024));
        assert_eq!(heap.record_state(cap.base()), RecordState::Allocated);

        let inner = cap.set_bounds(cap.base() + 16, 8).unwrap();
        heap.free(&claimer, &inner).unwrap();
        assert_eq!(heap.quota_remaining(&claimer), Ok(960));
        heap.free(&claimer, &cap).unwrap();
        assert_eq!(heap.quota_remaining(&claimer), Ok(1024));
        assert_eq!(heap.record_state(cap.base()), RecordState::PendingRevocation);
    }

    #[test]
    fn test_owner_claim_converts_ownership() {
        let heap = heap();
        let q = heap.quota_new(1024).unwrap();
        let cap = heap.allocate(&mut Timeout::non_blocking(), &q, 32).unwrap();
        assert_eq!(heap.claim(&q, &cap), Ok(32));
        assert_eq!(heap.quota_remaining(&q), Ok(992));
        heap.free(&q, &cap).unwrap();
        assert_eq!(heap.record_state(cap.base()), RecordState::Allocated);
        heap.free(&q, &cap).unwrap();
        assert_eq!(heap.record_state(cap.base()), RecordState::PendingRevocation);
        assert_eq!(heap.quota_remaining(&q), Ok(1024));
    }

    #[test]
    fn test_claim_exceeding_quota() {
        let heap = heap();
        let owner = heap.quota_new(1024).unwrap();
        let poor = heap.quota_new(16).unwrap();
        let cap = heap.allocate(&mut Timeout::non_blocking(), &owner, 64).unwrap();
        assert_eq!(heap.claim(&poor, &cap), Err(HeapError::QuotaExceeded));
        assert_eq!(heap.quota_remaining(&poor), Ok(16));
    }

    #[test]
    fn test_free_all() {
        let heap = heap();
        let q = heap.quota_new(1024).unwrap();
        let other = heap.quota_new(1024).unwrap();
        let a = heap.allocate(&mut Timeout::non_blocking(), &q, 64).unwrap();
        let _b = heap.allocate(&mut Timeout::non_blocking(), &q, 32).unwrap();
        let c = heap.allocate(&mut Timeout::non_blocking(), &other, 16).unwrap();
        heap.claim(&q, &c).unwrap();

        let narrowed = q.permissions_and(AllocatorPermissions::ALLOCATE);
        assert_eq!(heap.free_all(&narrowed), Err(HeapError::NotOwner));

        assert_eq!(heap.free_all(&q), Ok(112));
        assert_eq!(heap.quota_remaining(&q), Ok(1024));
        assert_eq!(heap.record_state(a.base()), RecordState::PendingRevocation);
        assert_eq!(heap.record_state(c.base()), RecordState::Allocated);
        assert_eq!(heap.free_all(&q), Ok(0));
    }

    #[test]
    fn test_non_blocking_allocation_with_quarantine() {
        let heap = Heap::new(SIZE, RevokerMode::Background, 64).unwrap();
        let q = heap.quota_new(SIZE).unwrap();
        let cap = heap.allocate(&mut Timeout::non_blocking(), &q, SIZE).unwrap();
        heap.free(&q, &cap).unwrap();

        assert_eq!(
            heap.allocate(&mut Timeout::non_blocking(), &q, 64),
            Err(HeapError::Timeout)
        );
        assert_eq!(
            heap.allocate_with_flags(
                &mut Timeout::new(10),
                &q,
                64,
                AllocateWait::HEAP_FULL
            ),
            Err(HeapError::OutOfMemory)
        );
        // Nobody ticks a background revoker here.
        let mut t = Timeout::new(50);
        assert_eq!(heap.allocate(&mut t, &q, 64), Err(HeapError::Timeout));
        assert_eq!(t.remaining, 0);
    }

    #[test]
    fn test_revoked_chunks_all_return_before_failing() {
        let heap = heap();
        let q = heap.quota_new(SIZE).unwrap();
        let chunks: Vec<_> = (0..8)
            .map(|_| heap.allocate(&mut Timeout::non_blocking(), &q, 512).unwrap())
            .collect();
        let lowest = chunks[0].base();
        for cap in &chunks {
            heap.free(&q, cap).unwrap();
        }
        sweep(&heap);
        sweep(&heap);
        sweep(&heap);
        assert!(heap.revoker().epoch_passed(1, false));

        // More revoked chunks than one allocation dequeues on its own.
        let whole = heap
            .allocate(&mut Timeout::non_blocking(), &q, SIZE)
            .unwrap();
        assert_eq!(whole.base(), lowest);
        assert_eq!(heap.quarantined(), 0);
    }

    #[test]
    fn test_revoked_chunks_satisfy_revocation_only_wait() {
        let heap = heap();
        let q = heap.quota_new(SIZE).unwrap();
        let chunks: Vec<_> = (0..8)
            .map(|_| heap.allocate(&mut Timeout::non_blocking(), &q, 512).unwrap())
            .collect();
        for cap in &chunks {
            heap.free(&q, cap).unwrap();
        }
        sweep(&heap);
        sweep(&heap);
        sweep(&heap);

        let mut t = Timeout::new(100);
        let whole = heap
            .allocate_with_flags(&mut t, &q, SIZE, AllocateWait::REVOCATION_NEEDED)
            .unwrap();
        assert_eq!(whole.length(), SIZE);
        assert_eq!(t.elapsed, 0);
    }

    #[test]
    fn test_sealed_header_reads_first_word() {
        let heap = heap();
        let q = heap.quota_new(1024).unwrap();
        let whole = heap
            .allocate_sealed_chunk(&mut Timeout::non_blocking(), &q, 24)
            .unwrap();
        heap.store(&whole, 0, &0xdead_beefu32.to_le_bytes()).unwrap();
        assert_eq!(heap.sealed_header(&whole), Some(0xdead_beef));

        let plain = heap.allocate(&mut Timeout::non_blocking(), &q, 24).unwrap();
        assert_eq!(heap.sealed_header(&plain), None);
        let inner = whole.set_bounds(whole.base() + 8, 16).unwrap();
        assert_eq!(heap.sealed_header(&inner), None);
    }

    #[test]
    fn test_heap_full_without_wait_flag() {
        let heap = heap();
        // Enough budget that the quota never stops the request first.
        let q = heap.quota_new(2 * SIZE).unwrap();
        let _all = heap.allocate(&mut Timeout::non_blocking(), &q, SIZE).unwrap();
        assert_eq!(
            heap.allocate_with_flags(
                &mut Timeout::new(10),
                &q,
                8,
                AllocateWait::REVOCATION_NEEDED
            ),
            Err(HeapError::OutOfMemory)
        );
        let mut t = Timeout::new(10);
        assert_eq!(heap.allocate(&mut t, &q, 8), Err(HeapError::Timeout));
        assert_eq!(t.elapsed, 10);
    }
}
