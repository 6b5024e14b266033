//! Capability Primitives
//!
//! The capability value type and per-compartment capability storage.
//!
//! # Design
//! - Capabilities are plain values with private fields and an explicit tag
//! - Bounds and permissions can be narrowed, never widened
//! - Each compartment stores long-lived capabilities in a CSpace, which the
//!   revoker sweeps

pub mod capability;
pub mod cspace;

pub use capability::{Capability, Permissions, OTYPE_UNSEALED};
pub use cspace::{CSpace, CSpaceError, CapSlot, SharedCSpace, CSPACE_SIZE};
