//! Runtime Facade
//!
//! The entry points compartments call. A `Runtime` owns one heap (with its
//! revoker) and the token service layered on it; every operation forwards
//! to them.

use log::info;

use crate::cap::{CSpace, CSpaceError, CapSlot, Capability, SharedCSpace};
use crate::config::{ConfigError, RuntimeConfig};
use crate::error::Result;
use crate::mm::{AllocateWait, AllocatorCapability, Heap, RecordState};
use crate::sync::{SpinWaiter, Timeout, Waiter};
use crate::token::{SealingKey, TokenService};

/// The memory-safety core of the compartment runtime.
#[derive(Debug)]
pub struct Runtime<W: Waiter = SpinWaiter> {
    heap: Heap<W>,
    tokens: TokenService,
}

impl Runtime<SpinWaiter> {
    /// Create a runtime that blocks by polling.
    pub fn new(config: RuntimeConfig) -> core::result::Result<Self, ConfigError> {
        Self::with_waiter(config, SpinWaiter::new())
    }
}

impl<W: Waiter> Runtime<W> {
    /// Create a runtime that blocks through `waiter`.
    pub fn with_waiter(
        config: RuntimeConfig,
        waiter: W,
    ) -> core::result::Result<Self, ConfigError> {
        config.validate()?;
        let heap = Heap::with_waiter(
            config.heap_size,
            config.revoker_mode,
            config.sweep_slots_per_tick,
            waiter,
        )
        .map_err(|_| ConfigError::HeapUnavailable)?;
        info!(
            "runtime up: {} byte heap, {:?} revoker, {} slots per tick",
            config.heap_size, config.revoker_mode, config.sweep_slots_per_tick
        );
        Ok(Self {
            heap,
            tokens: TokenService::new(),
        })
    }

    #[inline]
    pub fn heap(&self) -> &Heap<W> {
        &self.heap
    }

    #[inline]
    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    // Compartments

    /// Create a capability space that revocation sweeps cover.
    pub fn compartment_space(&self) -> SharedCSpace {
        let space = CSpace::shared();
        self.heap.register(&space);
        space
    }

    /// Bring an existing capability space under revocation.
    pub fn register_space(&self, space: &SharedCSpace) {
        self.heap.register(space);
    }

    /// Store `cap` in the first free slot of `space`.
    ///
    /// Takes the capability by value so that any allocation producing it
    /// has returned, and released the heap, before the space is locked.
    pub fn stash(
        &self,
        space: &SharedCSpace,
        cap: Capability,
    ) -> core::result::Result<CapSlot, CSpaceError> {
        space.lock().push(cap)
    }

    // Allocator

    pub fn quota_new(&self, limit: usize) -> Result<AllocatorCapability> {
        self.heap.quota_new(limit)
    }

    pub fn allocate(
        &self,
        timeout: &mut Timeout,
        quota: &AllocatorCapability,
        size: usize,
    ) -> Result<Capability> {
        self.heap.allocate(timeout, quota, size)
    }

    pub fn allocate_with_flags(
        &self,
        timeout: &mut Timeout,
        quota: &AllocatorCapability,
        size: usize,
        flags: AllocateWait,
    ) -> Result<Capability> {
        self.heap.allocate_with_flags(timeout, quota, size, flags)
    }

    pub fn allocate_array(
        &self,
        timeout: &mut Timeout,
        quota: &AllocatorCapability,
        count: usize,
        size: usize,
    ) -> Result<Capability> {
        self.heap
            .allocate_array(timeout, quota, count, size, AllocateWait::ANY)
    }

    pub fn free(&self, quota: &AllocatorCapability, cap: &Capability) -> Result<()> {
        self.heap.free(quota, cap)
    }

    pub fn can_free(&self, quota: &AllocatorCapability, cap: &Capability) -> Result<()> {
        self.heap.can_free(quota, cap)
    }

    pub fn claim(&self, quota: &AllocatorCapability, cap: &Capability) -> Result<usize> {
        self.heap.claim(quota, cap)
    }

    pub fn quota_remaining(&self, quota: &AllocatorCapability) -> Result<usize> {
        self.heap.quota_remaining(quota)
    }

    pub fn free_all(&self, quota: &AllocatorCapability) -> Result<usize> {
        self.heap.free_all(quota)
    }

    pub fn quarantine_flush(&self, timeout: &mut Timeout) -> Result<()> {
        self.heap.quarantine_flush(timeout)
    }

    pub fn available(&self) -> usize {
        self.heap.available()
    }

    pub fn record_state(&self, addr: usize) -> RecordState {
        self.heap.record_state(addr)
    }

    pub fn load(&self, cap: &Capability, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.heap.load(cap, offset, buf)
    }

    pub fn store(&self, cap: &Capability, offset: usize, data: &[u8]) -> Result<()> {
        self.heap.store(cap, offset, data)
    }

    // Tokens

    pub fn new_key(&self) -> Option<SealingKey> {
        self.tokens.new_key()
    }

    /// Allocate a sealed object; return `(unsealed, sealed)`.
    pub fn seal_allocate(
        &self,
        timeout: &mut Timeout,
        quota: &AllocatorCapability,
        key: &SealingKey,
        size: usize,
    ) -> Result<(Capability, Capability)> {
        self.tokens
            .allocate_sealed(&self.heap, timeout, quota, key, size)
    }

    pub fn sealed_alloc(
        &self,
        timeout: &mut Timeout,
        quota: &AllocatorCapability,
        key: &SealingKey,
        size: usize,
    ) -> Result<Capability> {
        self.tokens.sealed_alloc(&self.heap, timeout, quota, key, size)
    }

    pub fn unseal(&self, key: &SealingKey, sealed: &Capability) -> Option<Capability> {
        self.tokens.unseal(&self.heap, key, sealed)
    }

    pub fn destroy(
        &self,
        quota: &AllocatorCapability,
        key: &SealingKey,
        sealed: &Capability,
    ) -> Result<()> {
        self.tokens.destroy(&self.heap, quota, key, sealed)
    }

    pub fn can_destroy(
        &self,
        quota: &AllocatorCapability,
        key: &SealingKey,
        sealed: &Capability,
    ) -> Result<()> {
        self.tokens.can_destroy(&self.heap, quota, key, sealed)
    }

    // Revocation

    /// Current revocation epoch. Odd while a sweep is running.
    pub fn epoch_get(&self) -> u32 {
        self.heap.revoker().epoch()
    }

    /// Whether memory freed at `epoch` has been revoked.
    ///
    /// With a synchronous revoker this also advances a running sweep.
    pub fn epoch_finished(&self, epoch: u32, allow_partial: bool) -> bool {
        self.heap
            .revoker()
            .has_revocation_finished_for_epoch(epoch, allow_partial)
    }

    /// Start a sweep, or finish the running one. Returns the new epoch.
    pub fn kick(&self) -> u32 {
        self.heap.revoker().kick()
    }

    /// Timer hook: advance a running sweep. True if it just completed.
    pub fn tick(&self) -> bool {
        self.heap.revoker().tick()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revoke::RevokerMode;

    fn runtime() -> Runtime {
        Runtime::new(
            RuntimeConfig::new()
                .with_heap_size(8192)
                .with_revoker_mode(RevokerMode::Synchronous),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        assert_eq!(
            Runtime::new(RuntimeConfig::new().with_sweep_slots(0)).map(|_| ()),
            Err(ConfigError::NoSweepProgress)
        );
    }

    #[test]
    fn test_compartment_space_is_swept() {
        let rt = runtime();
        let space = rt.compartment_space();
        let q = rt.quota_new(1024).unwrap();
        let cap = rt.allocate(&mut Timeout::non_blocking(), &q, 32).unwrap();
        let slot = space.lock().push(cap).unwrap();

        rt.free(&q, &cap).unwrap();
        let epoch = rt.epoch_get();
        rt.kick();
        while !rt.epoch_finished(epoch, false) {}
        assert!(!space.lock().lookup(slot).unwrap().is_valid());
    }

    #[test]
    fn test_stash_then_revoke() {
        let rt = runtime();
        let space = rt.compartment_space();
        let q = rt.quota_new(16384).unwrap();
        let all = rt.allocate(&mut Timeout::non_blocking(), &q, 1024).unwrap();
        let slot = rt.stash(&space, all).unwrap();
        rt.free(&q, &all).unwrap();

        // The allocation has to wait for a sweep of `space`.
        let again = rt.allocate(&mut Timeout::new(10_000), &q, 8192).unwrap();
        let held = rt.stash(&space, again).unwrap();
        assert!(!space.lock().lookup(slot).unwrap().is_valid());
        assert!(space.lock().lookup(held).unwrap().is_valid());
    }

    #[test]
    fn test_kick_and_epoch_queries() {
        let rt = runtime();
        let start = rt.epoch_get();
        assert_eq!(start, 0);
        assert_eq!(rt.kick(), 1);
        assert_eq!(rt.kick(), 2);
        assert!(rt.epoch_finished(start, false));
        // Idle: nothing to tick, nothing passes.
        assert!(!rt.epoch_finished(2, true));
        assert_eq!(rt.epoch_get(), 2);
    }
}
