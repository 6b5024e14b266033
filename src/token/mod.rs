//! Sealing and Tokens
//!
//! Opaque, unforgeable handles built on the heap:
//! - `SealingKey`: names an object type, carries SEAL and/or UNSEAL
//! - `TokenService`: mints keys, allocates sealed objects, unseals and
//!   destroys them

pub mod key;
pub mod service;

pub use key::SealingKey;
pub use service::{TokenService, ALLOCATOR_OTYPE, HEADER};
