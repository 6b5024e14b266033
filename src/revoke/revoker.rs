//! Revocation Sweep State Machine
//!
//! # Epoch Protocol
//! ```text
//!            kick()                    last slot swept
//!   Idle ───────────────▶ Sweeping ───────────────────▶ Idle
//!   epoch even            epoch odd                     epoch even
//! ```
//! The epoch is incremented once when a sweep starts and once when it
//! finishes. Memory freed at epoch `e` is safe to reuse once a complete
//! sweep has started after `e`:
//! - `e` even (idle at free time): the epoch must reach `e + 2`
//! - `e` odd (a sweep was already running): the running sweep may have
//!   passed the slot already, so the epoch must reach `e + 3`
//!
//! # Driving the Sweep
//! `tick()` sweeps a bounded number of slots. In background mode something
//! external (a timer interrupt) calls it; in synchronous mode every epoch
//! query made while a sweep is running also ticks.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use log::{debug, trace};
use spin::Mutex;

use super::bitmap::ShadowBitmap;
use crate::cap::{CSpace, SharedCSpace, CSPACE_SIZE};

/// Who drives the sweep forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokerMode {
    /// Only explicit `tick()` calls make progress.
    Background,
    /// Querying a running sweep's progress also ticks it.
    Synchronous,
}

/// Whether the sweep that guards memory freed at `previous` has completed,
/// given the epoch is now `current`.
///
/// Uses wrapping arithmetic: correct as long as fewer than 2^31 epochs pass
/// between the two observations.
#[inline]
pub const fn epoch_finished(current: u32, previous: u32, allow_partial: bool) -> bool {
    let delta = current.wrapping_sub(previous);
    if allow_partial {
        delta >= 1
    } else {
        delta >= 2 + (previous & 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepState {
    Idle,
    Sweeping { space: usize, slot: usize },
}

/// Sweep cursor and the spaces it walks. Guarded by the revoker's own lock.
struct Sweep {
    state: SweepState,
    spaces: Vec<Weak<Mutex<CSpace>>>,
    revoked: usize,
}

/// The revocation engine.
pub struct Revoker {
    epoch: AtomicU32,
    bitmap: ShadowBitmap,
    sweep: Mutex<Sweep>,
    mode: RevokerMode,
    slots_per_tick: usize,
}

impl Revoker {
    /// Create a revoker for the arena `[base, base + size)`.
    pub fn new(base: usize, size: usize, mode: RevokerMode, slots_per_tick: usize) -> Self {
        Self {
            epoch: AtomicU32::new(0),
            bitmap: ShadowBitmap::new(base, size),
            sweep: Mutex::new(Sweep {
                state: SweepState::Idle,
                spaces: Vec::new(),
                revoked: 0,
            }),
            mode,
            slots_per_tick: slots_per_tick.max(1),
        }
    }

    #[inline]
    pub fn mode(&self) -> RevokerMode {
        self.mode
    }

    /// The shadow bitmap consulted by the sweep.
    #[inline]
    pub fn bitmap(&self) -> &ShadowBitmap {
        &self.bitmap
    }

    /// Add a capability space to the set swept on every pass.
    ///
    /// The revoker only keeps a weak reference; dropped spaces fall out of
    /// the set at the start of the next sweep.
    pub fn register(&self, space: &SharedCSpace) {
        self.sweep.lock().spaces.push(Arc::downgrade(space));
    }

    /// Number of spaces currently registered (live or not yet pruned).
    pub fn registered_spaces(&self) -> usize {
        self.sweep.lock().spaces.len()
    }

    /// Current epoch. Odd while a sweep is running.
    #[inline]
    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_sweeping(&self) -> bool {
        self.epoch() & 1 == 1
    }

    /// Pure epoch check; never drives the sweep.
    #[inline]
    pub fn epoch_passed(&self, previous: u32, allow_partial: bool) -> bool {
        epoch_finished(self.epoch(), previous, allow_partial)
    }

    /// Check whether revocation has finished for memory freed at `previous`.
    ///
    /// In synchronous mode a running sweep is ticked first.
    pub fn has_revocation_finished_for_epoch(&self, previous: u32, allow_partial: bool) -> bool {
        if self.mode == RevokerMode::Synchronous && self.is_sweeping() {
            self.tick();
        }
        self.epoch_passed(previous, allow_partial)
    }

    /// Start a sweep, or finish the running one.
    ///
    /// Every kick advances the epoch. Returns the new epoch.
    pub fn kick(&self) -> u32 {
        let mut sweep = self.sweep.lock();
        match sweep.state {
            SweepState::Idle => self.begin(&mut sweep),
            SweepState::Sweeping { .. } => {
                self.scan(&mut sweep, usize::MAX);
            }
        }
        self.epoch()
    }

    /// Start a sweep if none is running. Never sweeps any slots itself.
    pub(crate) fn start(&self) -> u32 {
        let mut sweep = self.sweep.lock();
        if sweep.state == SweepState::Idle {
            self.begin(&mut sweep);
        }
        self.epoch()
    }

    /// Sweep up to the configured number of slots.
    ///
    /// Returns true if this tick completed a sweep.
    pub fn tick(&self) -> bool {
        let mut sweep = self.sweep.lock();
        self.scan(&mut sweep, self.slots_per_tick)
    }

    fn begin(&self, sweep: &mut Sweep) {
        sweep.spaces.retain(|space| space.strong_count() > 0);
        sweep.state = SweepState::Sweeping { space: 0, slot: 0 };
        sweep.revoked = 0;
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        debug_assert!(epoch & 1 == 1);
        debug!(
            "revocation epoch {} started over {} spaces",
            epoch,
            sweep.spaces.len()
        );
    }

    fn complete(&self, sweep: &mut Sweep) {
        sweep.state = SweepState::Idle;
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        debug_assert!(epoch & 1 == 0);
        debug!(
            "revocation epoch {} finished, {} capabilities revoked",
            epoch, sweep.revoked
        );
    }

    /// Sweep at most `budget` slots. Returns true if the sweep completed.
    fn scan(&self, sweep: &mut Sweep, mut budget: usize) -> bool {
        loop {
            let SweepState::Sweeping { space, slot } = sweep.state else {
                return false;
            };
            if space >= sweep.spaces.len() {
                self.complete(sweep);
                return true;
            }
            if budget == 0 {
                return false;
            }
            let count = budget.min(CSPACE_SIZE - slot);
            if let Some(cspace) = sweep.spaces[space].upgrade() {
                let revoked = cspace.lock().sweep(slot, count, &self.bitmap);
                if revoked > 0 {
                    trace!("space {}: revoked {} capabilities", space, revoked);
                }
                sweep.revoked += revoked;
            }
            budget -= count;
            let next = slot + count;
            sweep.state = if next >= CSPACE_SIZE {
                SweepState::Sweeping {
                    space: space + 1,
                    slot: 0,
                }
            } else {
                SweepState::Sweeping { space, slot: next }
            };
        }
    }
}

impl core::fmt::Debug for Revoker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Revoker")
            .field("epoch", &self.epoch())
            .field("mode", &self.mode)
            .field("slots_per_tick", &self.slots_per_tick)
            .finish()
    }
}
