//! Timeouts
//!
//! A `Timeout` is chained across every blocking step of one call: each wait
//! charges the ticks it used, so a call that blocks several times never
//! exceeds the caller's budget.
//!
//! Timeouts belong on the caller's stack and are passed by `&mut`.

/// Scheduler ticks.
pub type Ticks = u32;

/// Remaining time of a timeout that never expires.
pub const UNLIMITED_TIMEOUT: Ticks = Ticks::MAX;

/// Time budget for a blocking call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    /// Ticks spent blocking so far. Saturates.
    pub elapsed: Ticks,
    /// Ticks left. Clamped at zero.
    pub remaining: Ticks,
}

impl Timeout {
    /// A timeout allowing `ticks` ticks to elapse.
    #[inline]
    pub const fn new(ticks: Ticks) -> Self {
        Self {
            elapsed: 0,
            remaining: ticks,
        }
    }

    /// A timeout that must not block at all.
    #[inline]
    pub const fn non_blocking() -> Self {
        Self::new(0)
    }

    /// A timeout that never expires.
    #[inline]
    pub const fn unlimited() -> Self {
        Self::new(UNLIMITED_TIMEOUT)
    }

    #[inline]
    pub const fn is_unlimited(&self) -> bool {
        self.remaining == UNLIMITED_TIMEOUT
    }

    /// Charge `time` ticks to this timeout.
    pub fn elapse(&mut self, time: Ticks) {
        self.elapsed = self.elapsed.saturating_add(time);
        if !self.is_unlimited() {
            self.remaining = self.remaining.saturating_sub(time);
        }
    }

    /// Whether the owner of this timeout may still block.
    #[inline]
    pub const fn may_block(&self) -> bool {
        self.remaining > 0
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Self::non_blocking()
    }
}
