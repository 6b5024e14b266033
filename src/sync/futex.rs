//! Futex Words
//!
//! The scheduler owns blocking; the memory core only needs two primitives
//! from it, expressed as the `Waiter` trait:
//! - `wait(word, expected, timeout)`: sleep while `word == expected`
//! - `wake(word, count)`: wake up to `count` sleepers on `word`
//!
//! `SpinWaiter` is a scheduler-less implementation: it polls the word and
//! charges one tick per poll. It is what runs on a single hardware thread
//! before a scheduler is attached, and in host tests.

use core::sync::atomic::{AtomicU32, Ordering};

use super::timeout::Timeout;
use crate::error::{HeapError, Result};

/// Blocking primitives supplied by the scheduler.
pub trait Waiter: Send + Sync {
    /// Block while `word` holds `expected`, charging the time spent to
    /// `timeout`.
    ///
    /// Returns `Ok` once the value changed (or was already different),
    /// `Err(Timeout)` if the budget ran out first.
    fn wait(&self, word: &AtomicU32, expected: u32, timeout: &mut Timeout) -> Result<()>;

    /// Wake at most `count` threads waiting on `word`. Returns the number
    /// woken.
    fn wake(&self, word: &AtomicU32, count: u32) -> u32;

    /// Give up the CPU for one tick.
    fn yield_now(&self, timeout: &mut Timeout) -> Result<()>;
}

/// Polling waiter: one tick per poll.
#[derive(Debug, Default)]
pub struct SpinWaiter {
    waiting: AtomicU32,
}

impl SpinWaiter {
    pub const fn new() -> Self {
        Self {
            waiting: AtomicU32::new(0),
        }
    }
}

impl Waiter for SpinWaiter {
    fn wait(&self, word: &AtomicU32, expected: u32, timeout: &mut Timeout) -> Result<()> {
        if word.load(Ordering::Acquire) != expected {
            return Ok(());
        }
        self.waiting.fetch_add(1, Ordering::Relaxed);
        let result = loop {
            if !timeout.may_block() {
                break Err(HeapError::Timeout);
            }
            core::hint::spin_loop();
            timeout.elapse(1);
            if word.load(Ordering::Acquire) != expected {
                break Ok(());
            }
        };
        self.waiting.fetch_sub(1, Ordering::Relaxed);
        result
    }

    fn wake(&self, _word: &AtomicU32, count: u32) -> u32 {
        // Pollers notice the store on their own; report how many were polling.
        self.waiting.load(Ordering::Relaxed).min(count)
    }

    fn yield_now(&self, timeout: &mut Timeout) -> Result<()> {
        if !timeout.may_block() {
            return Err(HeapError::Timeout);
        }
        core::hint::spin_loop();
        timeout.elapse(1);
        Ok(())
    }
}

/// A 32-bit word that threads can sleep on.
#[derive(Debug)]
pub struct Futex {
    word: AtomicU32,
}

impl Futex {
    pub const fn new(value: u32) -> Self {
        Self {
            word: AtomicU32::new(value),
        }
    }

    #[inline]
    pub fn load(&self) -> u32 {
        self.word.load(Ordering::Acquire)
    }

    #[inline]
    pub fn store(&self, value: u32) {
        self.word.store(value, Ordering::Release);
    }

    /// Sleep while the word still holds `expected`.
    pub fn wait<W: Waiter + ?Sized>(
        &self,
        waiter: &W,
        expected: u32,
        timeout: &mut Timeout,
    ) -> Result<()> {
        waiter.wait(&self.word, expected, timeout)
    }

    /// Store `value` and wake every sleeper.
    pub fn set_and_wake_all<W: Waiter + ?Sized>(&self, waiter: &W, value: u32) -> u32 {
        self.store(value);
        waiter.wake(&self.word, u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_returns_when_value_differs() {
        let futex = Futex::new(1);
        let waiter = SpinWaiter::new();
        let mut t = Timeout::new(10);
        assert_eq!(futex.wait(&waiter, 0, &mut t), Ok(()));
        assert_eq!(t.elapsed, 0);
    }

    #[test]
    fn test_wait_times_out() {
        let futex = Futex::new(1);
        let waiter = SpinWaiter::new();
        let mut t = Timeout::new(10);
        assert_eq!(futex.wait(&waiter, 1, &mut t), Err(HeapError::Timeout));
        assert_eq!(t.elapsed, 10);
        assert_eq!(t.remaining, 0);
    }

    #[test]
    fn test_non_blocking_wait_fails_immediately() {
        let futex = Futex::new(1);
        let waiter = SpinWaiter::new();
        let mut t = Timeout::non_blocking();
        assert_eq!(futex.wait(&waiter, 1, &mut t), Err(HeapError::Timeout));
        assert_eq!(t.elapsed, 0);
    }

    #[test]
    fn test_wake_across_threads() {
        use std::sync::Arc;

        let futex = Arc::new(Futex::new(7));
        let waiter = Arc::new(SpinWaiter::new());
        let (f, w) = (futex.clone(), waiter.clone());
        let sleeper = std::thread::spawn(move || {
            let mut t = Timeout::unlimited();
            f.wait(&*w, 7, &mut t)
        });
        std::thread::sleep(std::time::Duration::from_millis(10));
        futex.set_and_wake_all(&*waiter, 8);
        assert_eq!(sleeper.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_yield_charges_one_tick() {
        let waiter = SpinWaiter::new();
        let mut t = Timeout::new(2);
        assert!(waiter.yield_now(&mut t).is_ok());
        assert!(waiter.yield_now(&mut t).is_ok());
        assert_eq!(waiter.yield_now(&mut t), Err(HeapError::Timeout));
    }
}
