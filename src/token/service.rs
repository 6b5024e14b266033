//! Token Service
//!
//! Sealed objects are heap allocations with a one-word header naming the
//! key that created them.
//!
//! # Object Layout
//! ```text
//!  base                base + HEADER                      top
//!   ├──── header ───────┼──────────── payload ─────────────┤
//!   │ key otype │ pad   │                                  │
//!   └───────────────────┴──────────────────────────────────┘
//!   sealed handle:   cursor at payload, bounds [base, top), allocator otype
//!   unsealed handle: bounds [base + HEADER, top)
//! ```
//!
//! Every way an unseal can fail looks the same to the caller.

use log::debug;
use spin::Mutex;

use super::key::SealingKey;
use crate::cap::{Capability, Permissions};
use crate::error::{HeapError, Result};
use crate::mm::{AllocatorCapability, Heap};
use crate::sync::{Timeout, Waiter};

/// Size of the object header.
pub const HEADER: usize = 8;

/// Object type the service seals every handle with.
pub const ALLOCATOR_OTYPE: u32 = 1;

/// First object type handed out to keys. Keys count down from here.
const FIRST_KEY_OTYPE: u32 = u32::MAX;
/// Key types below this are reserved.
const MIN_KEY_OTYPE: u32 = 1 << 24;

/// Issues sealing keys and manages sealed objects on a heap.
#[derive(Debug)]
pub struct TokenService {
    next_key: Mutex<Option<u32>>,
    min_key: u32,
}

impl Default for TokenService {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenService {
    pub const fn new() -> Self {
        Self::with_key_range(FIRST_KEY_OTYPE, MIN_KEY_OTYPE)
    }

    /// Service that issues keys `first`, `first - 1`, ..., `min`.
    pub(crate) const fn with_key_range(first: u32, min: u32) -> Self {
        Self {
            next_key: Mutex::new(Some(first)),
            min_key: min,
        }
    }

    /// Mint a fresh key with SEAL and UNSEAL. None once the type space is
    /// exhausted.
    pub fn new_key(&self) -> Option<SealingKey> {
        let mut next = self.next_key.lock();
        let otype = (*next).filter(|&otype| otype >= self.min_key)?;
        *next = otype.checked_sub(1);
        Some(SealingKey::new(otype))
    }

    /// Allocate a sealed object; return `(unsealed, sealed)`.
    ///
    /// The key needs SEAL and UNSEAL.
    pub fn allocate_sealed<W: Waiter>(
        &self,
        heap: &Heap<W>,
        timeout: &mut Timeout,
        quota: &AllocatorCapability,
        key: &SealingKey,
        size: usize,
    ) -> Result<(Capability, Capability)> {
        self.allocate_object(
            heap,
            timeout,
            quota,
            key,
            size,
            Permissions::SEAL | Permissions::UNSEAL,
        )
    }

    /// Allocate a sealed object and return only the sealed handle.
    ///
    /// The key needs SEAL.
    pub fn sealed_alloc<W: Waiter>(
        &self,
        heap: &Heap<W>,
        timeout: &mut Timeout,
        quota: &AllocatorCapability,
        key: &SealingKey,
        size: usize,
    ) -> Result<Capability> {
        self.allocate_object(heap, timeout, quota, key, size, Permissions::SEAL)
            .map(|(_, sealed)| sealed)
    }

    fn allocate_object<W: Waiter>(
        &self,
        heap: &Heap<W>,
        timeout: &mut Timeout,
        quota: &AllocatorCapability,
        key: &SealingKey,
        size: usize,
        required: Permissions,
    ) -> Result<(Capability, Capability)> {
        let Some(otype) = key.otype(required) else {
            debug!("operation requires {:?}, cannot derive from {:?}", required, key);
            return Err(HeapError::InvalidCapability);
        };
        if size == 0 {
            return Err(HeapError::OutOfMemory);
        }
        let total = size.checked_add(HEADER).ok_or(HeapError::OutOfMemory)?;
        let whole = heap.allocate_sealed_chunk(timeout, quota, total)?;
        heap.store(&whole, 0, &otype.to_le_bytes())?;

        let payload = whole.base() + HEADER;
        let unsealed = whole
            .set_bounds(payload, whole.length() - HEADER)
            .ok_or(HeapError::InvalidCapability)?;
        let sealed = whole.with_address(payload).seal(ALLOCATOR_OTYPE);
        Ok((unsealed, sealed))
    }

    /// Unseal to the whole-allocation capability.
    fn open<W: Waiter>(
        &self,
        heap: &Heap<W>,
        key: &SealingKey,
        sealed: &Capability,
    ) -> Option<Capability> {
        let otype = key.otype(Permissions::UNSEAL)?;
        let whole = sealed.unseal(ALLOCATOR_OTYPE)?;
        if whole.address() != whole.base().checked_add(HEADER)? {
            return None;
        }
        if heap.sealed_header(&whole)? != otype {
            return None;
        }
        Some(whole)
    }

    /// Return the payload of `sealed` if `key` created it and it is live.
    pub fn unseal<W: Waiter>(
        &self,
        heap: &Heap<W>,
        key: &SealingKey,
        sealed: &Capability,
    ) -> Option<Capability> {
        let whole = self.open(heap, key, sealed)?;
        whole.set_bounds(whole.base() + HEADER, whole.length() - HEADER)
    }

    /// Free a sealed object. Later unseals of any copy fail.
    pub fn destroy<W: Waiter>(
        &self,
        heap: &Heap<W>,
        quota: &AllocatorCapability,
        key: &SealingKey,
        sealed: &Capability,
    ) -> Result<()> {
        let whole = self
            .open(heap, key, sealed)
            .ok_or(HeapError::InvalidCapability)?;
        heap.free_sealed(quota, &whole, false)
    }

    /// Check whether `destroy` would succeed, without destroying.
    pub fn can_destroy<W: Waiter>(
        &self,
        heap: &Heap<W>,
        quota: &AllocatorCapability,
        key: &SealingKey,
        sealed: &Capability,
    ) -> Result<()> {
        let whole = self
            .open(heap, key, sealed)
            .ok_or(HeapError::InvalidCapability)?;
        heap.free_sealed(quota, &whole, true)
    }
}
