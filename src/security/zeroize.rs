//! Secure Memory Zeroization
//!
//! Freed heap chunks are scrubbed before they enter quarantine so that
//! nothing the previous owner wrote survives into the next allocation.
//!
//! # Design
//! - `Zeroize` trait for values that can be securely cleared
//! - Volatile writes followed by a compiler fence, so the clearing of
//!   memory that is about to become unreachable cannot be elided

use core::ptr;
use core::sync::atomic::{compiler_fence, Ordering};

/// Trait for types that can be securely zeroed.
pub trait Zeroize {
    /// Overwrite this value with zeros.
    fn zeroize(&mut self);
}

impl Zeroize for [u8] {
    fn zeroize(&mut self) {
        // SAFETY: the slice is valid for writes of its whole length.
        unsafe {
            volatile_set_memory(self.as_mut_ptr(), 0, self.len());
        }
        compiler_fence(Ordering::SeqCst);
    }
}

impl<const N: usize> Zeroize for [u8; N] {
    fn zeroize(&mut self) {
        self.as_mut_slice().zeroize();
    }
}

/// Volatile memset that cannot be optimized away.
///
/// # Safety
/// `dst` must be valid for writes of `count` bytes.
#[inline]
unsafe fn volatile_set_memory(dst: *mut u8, val: u8, count: usize) {
    for i in 0..count {
        // SAFETY: caller guarantees dst is valid for count bytes.
        unsafe {
            ptr::write_volatile(dst.add(i), val);
        }
    }
}
