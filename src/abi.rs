//! Compartment Call ABI
//!
//! Integer-returning entry points for callers on the far side of a
//! compartment boundary, which see errors only as negative errno values.
//!
//! # Conventions
//! - Status calls return 0 on success
//! - Size calls return the size on success
//! - Failures return `HeapError::errno()`
//! - Calls producing a capability return an untagged one on failure

use log::trace;

use crate::cap::Capability;
use crate::error::Result;
use crate::mm::AllocatorCapability;
use crate::runtime::Runtime;
use crate::sync::{Timeout, Waiter};
use crate::token::SealingKey;

fn status(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            trace!("call failed: {}", e);
            e.errno()
        }
    }
}

fn size(result: Result<usize>) -> isize {
    match result {
        Ok(n) => isize::try_from(n).unwrap_or(isize::MAX),
        Err(e) => {
            trace!("call failed: {}", e);
            e.errno() as isize
        }
    }
}

fn capability(result: Result<Capability>) -> Capability {
    result.unwrap_or_else(|e| {
        trace!("call failed: {}", e);
        Capability::null()
    })
}

/// Allocate `size` bytes, waiting for space or revocation.
///
/// # Returns
/// The allocation, or an untagged capability.
pub fn heap_allocate<W: Waiter>(
    rt: &Runtime<W>,
    timeout: &mut Timeout,
    quota: &AllocatorCapability,
    size: usize,
) -> Capability {
    capability(rt.allocate(timeout, quota, size))
}

pub fn heap_allocate_array<W: Waiter>(
    rt: &Runtime<W>,
    timeout: &mut Timeout,
    quota: &AllocatorCapability,
    count: usize,
    size: usize,
) -> Capability {
    capability(rt.allocate_array(timeout, quota, count, size))
}

/// Free an allocation.
///
/// # Returns
/// 0, or -EINVAL for a bad capability, -EPERM if `quota` holds nothing.
pub fn heap_free<W: Waiter>(rt: &Runtime<W>, quota: &AllocatorCapability, cap: &Capability) -> i32 {
    status(rt.free(quota, cap))
}

/// Check whether `heap_free` would succeed.
pub fn heap_can_free<W: Waiter>(
    rt: &Runtime<W>,
    quota: &AllocatorCapability,
    cap: &Capability,
) -> i32 {
    status(rt.can_free(quota, cap))
}

/// Claim an allocation.
///
/// # Returns
/// The allocation's size, or a negative errno.
pub fn heap_claim<W: Waiter>(
    rt: &Runtime<W>,
    quota: &AllocatorCapability,
    cap: &Capability,
) -> isize {
    size(rt.claim(quota, cap))
}

/// Free everything a quota holds.
///
/// # Returns
/// Bytes released, or -EPERM without the FREE_ALL permission.
pub fn heap_free_all<W: Waiter>(rt: &Runtime<W>, quota: &AllocatorCapability) -> isize {
    size(rt.free_all(quota))
}

/// Wait until everything in quarantine has been revoked and reclaimed.
///
/// # Returns
/// 0, or -ETIMEDOUT.
pub fn heap_quarantine_flush<W: Waiter>(rt: &Runtime<W>, timeout: &mut Timeout) -> i32 {
    status(rt.quarantine_flush(timeout))
}

pub fn heap_quota_remaining<W: Waiter>(rt: &Runtime<W>, quota: &AllocatorCapability) -> isize {
    size(rt.quota_remaining(quota))
}

/// Allocate a sealed object.
///
/// # Returns
/// `(unsealed, sealed)`, both untagged on failure.
pub fn token_sealed_unsealed_alloc<W: Waiter>(
    rt: &Runtime<W>,
    timeout: &mut Timeout,
    quota: &AllocatorCapability,
    key: &SealingKey,
    size: usize,
) -> (Capability, Capability) {
    rt.seal_allocate(timeout, quota, key, size)
        .unwrap_or_else(|e| {
            trace!("call failed: {}", e);
            (Capability::null(), Capability::null())
        })
}

/// Allocate a sealed object and return only the sealed handle.
pub fn token_sealed_alloc<W: Waiter>(
    rt: &Runtime<W>,
    timeout: &mut Timeout,
    quota: &AllocatorCapability,
    key: &SealingKey,
    size: usize,
) -> Capability {
    capability(rt.sealed_alloc(timeout, quota, key, size))
}

/// Unseal a sealed object. Untagged if `key` does not open it.
pub fn token_obj_unseal<W: Waiter>(
    rt: &Runtime<W>,
    key: &SealingKey,
    sealed: &Capability,
) -> Capability {
    rt.unseal(key, sealed).unwrap_or_else(Capability::null)
}

/// Destroy a sealed object.
///
/// # Returns
/// 0, or -EINVAL if the handle does not unseal with `key`.
pub fn token_obj_destroy<W: Waiter>(
    rt: &Runtime<W>,
    quota: &AllocatorCapability,
    key: &SealingKey,
    sealed: &Capability,
) -> i32 {
    status(rt.destroy(quota, key, sealed))
}

/// Check whether `token_obj_destroy` would succeed.
pub fn token_obj_can_destroy<W: Waiter>(
    rt: &Runtime<W>,
    quota: &AllocatorCapability,
    key: &SealingKey,
    sealed: &Capability,
) -> i32 {
    status(rt.can_destroy(quota, key, sealed))
}
