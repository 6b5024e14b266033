//! Heap Arena
//!
//! Uses `linked_list_allocator` to carve one contiguous region into chunks.
//!
//! # Memory Layout
//! The arena owns a single granule-aligned buffer taken from the global
//! allocator at construction and returned on drop. Chunk bases handed out
//! are granule aligned; lengths are whole granules.
//!
//! # Security Considerations
//! - Chunks are zeroed when handed out and again when released
//! - Every raw access is bounds-checked against the arena first

use core::alloc::Layout;
use core::ptr::NonNull;

use linked_list_allocator::Heap as FirstFit;

use super::GRANULE;
use crate::security::Zeroize;

/// Alignment of the backing buffer.
const ARENA_ALIGN: usize = 64;

/// Smallest arena the first-fit engine can manage.
pub const MIN_ARENA_SIZE: usize = 256;

/// A contiguous heap region.
pub struct Arena {
    engine: FirstFit,
    memory: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the arena exclusively owns its buffer; all access goes through
// `&self`/`&mut self`, and the heap keeps the arena behind a lock.
unsafe impl Send for Arena {}

impl Arena {
    /// Create an arena of `size` bytes, rounded down to whole granules.
    ///
    /// Returns None if the size is too small or the buffer cannot be
    /// obtained.
    pub fn new(size: usize) -> Option<Self> {
        let size = size & !(GRANULE - 1);
        if size < MIN_ARENA_SIZE {
            return None;
        }
        let layout = Layout::from_size_align(size, ARENA_ALIGN).ok()?;
        // SAFETY: layout has a non-zero size.
        let memory = NonNull::new(unsafe { alloc::alloc::alloc_zeroed(layout) })?;
        let mut engine = FirstFit::empty();
        // SAFETY: `memory` is valid for `size` bytes, exclusively owned by
        // this arena and outlives `engine`.
        unsafe {
            engine.init(memory.as_ptr(), size);
        }
        Some(Self {
            engine,
            memory,
            layout,
        })
    }

    /// Address of the first byte.
    #[inline]
    pub fn base(&self) -> usize {
        self.memory.as_ptr() as usize
    }

    /// Total size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// One past the last byte.
    #[inline]
    pub fn top(&self) -> usize {
        self.base() + self.size()
    }

    /// Bytes not currently handed out.
    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.engine.free()
    }

    #[inline]
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.base() && end <= self.top(),
            None => false,
        }
    }

    #[inline]
    fn chunk_layout(len: usize) -> Option<Layout> {
        Layout::from_size_align(len, GRANULE).ok()
    }

    /// Carve a zeroed chunk of `len` bytes. Returns its base address.
    pub(crate) fn carve(&mut self, len: usize) -> Option<usize> {
        let layout = Self::chunk_layout(len)?;
        let chunk = self.engine.allocate_first_fit(layout).ok()?;
        let base = chunk.as_ptr() as usize;
        // The free list keeps its bookkeeping inside free memory.
        self.zero(base, len);
        Some(base)
    }

    /// Return a chunk previously produced by `carve` with the same length.
    pub(crate) fn release(&mut self, base: usize, len: usize) {
        let Some(layout) = Self::chunk_layout(len) else {
            return;
        };
        assert!(
            self.contains(base, len),
            "arena corrupted: chunk {:#x}+{:#x} outside arena",
            base,
            len
        );
        if let Some(ptr) = NonNull::new(base as *mut u8) {
            // SAFETY: the record table only releases chunks it carved, once,
            // with the length it carved them with.
            unsafe { self.engine.deallocate(ptr, layout) };
        }
    }

    /// Mutable view of `[addr, addr + len)`.
    ///
    /// # Panics
    /// If the range is not inside the arena.
    pub(crate) fn bytes_mut(&mut self, addr: usize, len: usize) -> &mut [u8] {
        assert!(self.contains(addr, len), "access outside arena");
        let offset = addr - self.base();
        // SAFETY: the range lies inside the owned buffer and `&mut self`
        // guarantees exclusivity.
        unsafe { core::slice::from_raw_parts_mut(self.memory.as_ptr().add(offset), len) }
    }

    /// Shared view of `[addr, addr + len)`.
    ///
    /// # Panics
    /// If the range is not inside the arena.
    pub(crate) fn bytes(&self, addr: usize, len: usize) -> &[u8] {
        assert!(self.contains(addr, len), "access outside arena");
        let offset = addr - self.base();
        // SAFETY: the range lies inside the owned buffer; no `&mut` view can
        // coexist with `&self`.
        unsafe { core::slice::from_raw_parts(self.memory.as_ptr().add(offset), len) }
    }

    /// Scrub `[addr, addr + len)`.
    pub(crate) fn zero(&mut self, addr: usize, len: usize) {
        self.bytes_mut(addr, len).zeroize();
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: `memory` came from `alloc_zeroed` with `layout`.
        unsafe { alloc::alloc::dealloc(self.memory.as_ptr(), self.layout) };
    }
}

impl core::fmt::Debug for Arena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Arena")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("size", &self.size())
            .field("free", &self.free_bytes())
            .finish()
    }
}
