//! PantherOS Compartment Runtime: Memory Safety Core
//!
//! The trusted core that arbitrates memory between compartments on a
//! capability machine.
//!
//! # Components
//! - Capabilities: bounded, permission-carrying, sealable references
//! - Quota heap: allocation, claims and free-all against per-compartment
//!   budgets
//! - Revocation: freed memory sits in quarantine until an epoch-tracked
//!   sweep has invalidated every capability to it
//! - Tokens: sealed objects only the holder of the right key can open
//!
//! # Security Features
//! - No reuse of freed memory before revocation
//! - Freed memory is zeroed
//! - Stale capabilities fail closed, swept or not
//! - Failed unseals are indistinguishable from one another
//!
//! # Usage
//! ```
//! use panther_rt::{Runtime, RuntimeConfig, Timeout};
//!
//! let rt = Runtime::new(RuntimeConfig::default()).unwrap();
//! let quota = rt.quota_new(1024).unwrap();
//! let cap = rt.allocate(&mut Timeout::non_blocking(), &quota, 64).unwrap();
//! assert_eq!(rt.quota_remaining(&quota), Ok(960));
//! rt.free(&quota, &cap).unwrap();
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod abi;
pub mod cap;
pub mod config;
pub mod error;
pub mod mm;
pub mod revoke;
pub mod runtime;
pub mod security;
pub mod sync;
pub mod token;

pub use cap::{CSpace, CSpaceError, CapSlot, Capability, Permissions, SharedCSpace};
pub use config::{ConfigError, RuntimeConfig};
pub use error::{HeapError, Result};
pub use mm::{AllocateWait, AllocatorCapability, AllocatorPermissions, Heap, RecordState};
pub use revoke::{epoch_finished, Revoker, RevokerMode};
pub use runtime::Runtime;
pub use sync::{Futex, SpinWaiter, Timeout, Waiter};
pub use token::{SealingKey, TokenService};
