//! Quarantine
//!
//! Freed chunks wait here until a revocation sweep has covered them.
//!
//! # Design
//! - Up to `PENDING_RINGS` pending batches, each tagged with the epoch its
//!   chunks were freed in
//! - A finished queue of chunks whose epoch has passed, ready to go back
//!   to the arena
//! - A fourth distinct epoch can only be observed after the oldest batch's
//!   sweep has completed, so pushing into a full ring set retires the
//!   oldest batch first

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use log::trace;

use crate::revoke::epoch_finished;

/// Number of epochs that can have chunks pending at once.
pub(crate) const PENDING_RINGS: usize = 3;

#[derive(Debug)]
struct Batch {
    epoch: u32,
    chunks: Vec<(usize, usize)>,
}

#[derive(Debug, Default)]
pub(crate) struct Quarantine {
    pending: VecDeque<Batch>,
    finished: VecDeque<(usize, usize)>,
    bytes: usize,
}

impl Quarantine {
    /// Total bytes held, pending or finished.
    #[inline]
    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    /// Epoch of the oldest pending batch.
    pub(crate) fn oldest_epoch(&self) -> Option<u32> {
        self.pending.front().map(|b| b.epoch)
    }

    /// Epoch of the newest pending batch.
    pub(crate) fn newest_epoch(&self) -> Option<u32> {
        self.pending.back().map(|b| b.epoch)
    }

    /// Queue the chunk `[base, base + len)`, freed at `epoch`.
    ///
    /// # Panics
    /// If every ring is taken and the oldest batch has not finished: the
    /// epoch went backwards.
    pub(crate) fn push(&mut self, epoch: u32, base: usize, len: usize) {
        match self.pending.back_mut() {
            Some(batch) if batch.epoch == epoch => batch.chunks.push((base, len)),
            _ => {
                if self.pending.len() == PENDING_RINGS {
                    self.retire_oldest(epoch);
                }
                self.pending.push_back(Batch {
                    epoch,
                    chunks: alloc::vec![(base, len)],
                });
            }
        }
        self.bytes += len;
    }

    fn retire_oldest(&mut self, current: u32) {
        let Some(oldest) = self.pending.pop_front() else {
            return;
        };
        assert!(
            epoch_finished(current, oldest.epoch, false),
            "quarantine corrupted: epoch {} still pending at {}",
            oldest.epoch,
            current
        );
        trace!(
            "quarantine: {} chunks from epoch {} finished",
            oldest.chunks.len(),
            oldest.epoch
        );
        self.finished.extend(oldest.chunks);
    }

    /// Move every batch whose epoch has finished onto the finished queue.
    fn promote(&mut self, current: u32) {
        while self
            .pending
            .front()
            .is_some_and(|b| epoch_finished(current, b.epoch, false))
        {
            self.retire_oldest(current);
        }
    }

    /// Take the next chunk that is safe to reuse at epoch `current`.
    pub(crate) fn pop_finished(&mut self, current: u32) -> Option<(usize, usize)> {
        if self.finished.is_empty() {
            self.promote(current);
        }
        let chunk = self.finished.pop_front()?;
        self.bytes -= chunk.1;
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nothing_leaves_before_epoch_finishes() {
        let mut q = Quarantine::default();
        q.push(0, 0x1000, 32);
        assert_eq!(q.bytes(), 32);
        assert_eq!(q.pop_finished(0), None);
        assert_eq!(q.pop_finished(1), None);
        assert_eq!(q.pop_finished(2), Some((0x1000, 32)));
        assert!(q.is_empty());
    }

    #[test]
    fn test_odd_epoch_needs_extra_step() {
        let mut q = Quarantine::default();
        q.push(1, 0x1000, 16);
        assert_eq!(q.pop_finished(3), None);
        assert_eq!(q.pop_finished(4), Some((0x1000, 16)));
    }

    #[test]
    fn test_batches_leave_in_order() {
        let mut q = Quarantine::default();
        q.push(0, 0x1000, 8);
        q.push(0, 0x2000, 8);
        q.push(1, 0x3000, 8);
        assert_eq!(q.oldest_epoch(), Some(0));
        assert_eq!(q.newest_epoch(), Some(1));
        assert_eq!(q.pop_finished(2), Some((0x1000, 8)));
        assert_eq!(q.pop_finished(2), Some((0x2000, 8)));
        assert_eq!(q.pop_finished(2), None);
        assert_eq!(q.pop_finished(4), Some((0x3000, 8)));
    }

    #[test]
    fn test_fourth_epoch_retires_oldest() {
        let mut q = Quarantine::default();
        q.push(0, 0x1000, 8);
        q.push(1, 0x2000, 8);
        q.push(2, 0x3000, 8);
        q.push(3, 0x4000, 8);
        assert_eq!(q.oldest_epoch(), Some(1));
        assert_eq!(q.bytes(), 32);
        // Epoch 0 was retired by the push; epoch 1 needs epoch 4.
        assert_eq!(q.pop_finished(3), Some((0x1000, 8)));
        assert_eq!(q.pop_finished(3), None);
    }

    #[test]
    #[should_panic(expected = "quarantine corrupted")]
    fn test_epoch_going_backwards_panics() {
        let mut q = Quarantine::default();
        q.push(1, 0x1000, 8);
        q.push(2, 0x2000, 8);
        q.push(3, 0x3000, 8);
        q.push(2, 0x4000, 8);
    }
}
