//! Revocation Shadow Bitmap
//!
//! One bit per allocation granule of the arena. A set bit means the granule
//! belongs to freed memory awaiting revocation; any capability whose base
//! lands on a set bit is stale.
//!
//! # Design
//! - The allocator paints on free and clears when memory leaves quarantine
//! - The revoker only reads bits during a sweep
//! - Words are atomic so the two sides never share a lock

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::mm::GRANULE_SHIFT;

const WORD_BITS: usize = u32::BITS as usize;

/// Shadow bitmap covering `[base, base + size)`.
#[derive(Debug)]
pub struct ShadowBitmap {
    base: usize,
    size: usize,
    words: Box<[AtomicU32]>,
}

impl ShadowBitmap {
    /// Create a bitmap covering `size` bytes starting at `base`, all clear.
    pub fn new(base: usize, size: usize) -> Self {
        let bits = size >> GRANULE_SHIFT;
        let words = (0..bits.div_ceil(WORD_BITS))
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { base, size, words }
    }

    /// Bit offset of `addr`, or None outside the covered range.
    #[inline]
    fn offset_bits(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base)?;
        if offset >= self.size {
            return None;
        }
        Some(offset >> GRANULE_SHIFT)
    }

    /// Mask of bits `[lo, hi)` within one word.
    #[inline]
    fn mask(lo: usize, hi: usize) -> u32 {
        let width = hi - lo;
        if width >= WORD_BITS {
            u32::MAX
        } else {
            ((1u32 << width) - 1) << lo
        }
    }

    /// Set or clear the bit for a single granule.
    pub fn paint_single(&self, addr: usize, fill: bool) {
        if let Some(bit) = self.offset_bits(addr) {
            let mask = 1u32 << (bit % WORD_BITS);
            let word = &self.words[bit / WORD_BITS];
            if fill {
                word.fetch_or(mask, Ordering::Release);
            } else {
                word.fetch_and(!mask, Ordering::Release);
            }
        }
    }

    /// Set or clear the bits for every granule in `[base, top)`.
    ///
    /// The range is clipped to the covered region.
    pub fn paint_range(&self, base: usize, top: usize, fill: bool) {
        let start = base.max(self.base);
        let end = top.min(self.base.saturating_add(self.size));
        if start >= end {
            return;
        }
        let mut bit = (start - self.base) >> GRANULE_SHIFT;
        let end_bit = (end - self.base).div_ceil(1 << GRANULE_SHIFT);
        while bit < end_bit {
            let word_ix = bit / WORD_BITS;
            let lo = bit % WORD_BITS;
            let hi = (end_bit - word_ix * WORD_BITS).min(WORD_BITS);
            let mask = Self::mask(lo, hi);
            if fill {
                self.words[word_ix].fetch_or(mask, Ordering::Release);
            } else {
                self.words[word_ix].fetch_and(!mask, Ordering::Release);
            }
            bit = (word_ix + 1) * WORD_BITS;
        }
    }

    /// Return the bit for `addr`. Addresses outside the range read clear.
    #[inline]
    pub fn bit_get(&self, addr: usize) -> bool {
        match self.offset_bits(addr) {
            Some(bit) => {
                let word = self.words[bit / WORD_BITS].load(Ordering::Acquire);
                word & (1 << (bit % WORD_BITS)) != 0
            }
            None => false,
        }
    }

    /// Whether any granule of `[base, top)` is painted.
    pub fn any_painted(&self, base: usize, top: usize) -> bool {
        let mut addr = base;
        while addr < top {
            if self.bit_get(addr) {
                return true;
            }
            addr += 1 << GRANULE_SHIFT;
        }
        false
    }
}
