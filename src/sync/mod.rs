//! Synchronization Glue
//!
//! The small set of blocking primitives the memory core depends on:
//! - `Timeout`: a tick budget chained across blocking steps
//! - `Futex`: a word threads sleep on until it changes
//! - `Waiter`: the scheduler seam that actually blocks

pub mod futex;
pub mod timeout;

pub use futex::{Futex, SpinWaiter, Waiter};
pub use timeout::{Ticks, Timeout, UNLIMITED_TIMEOUT};
