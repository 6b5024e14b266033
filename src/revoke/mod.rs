//! Temporal Safety: Revocation
//!
//! Freed memory is never reused until every capability that could still
//! point at it has been invalidated.
//!
//! # Design
//! - The allocator paints freed regions in a shadow bitmap
//! - A sweep walks registered capability spaces and clears the tag of any
//!   capability whose base is painted
//! - An epoch counter, even when idle and odd while sweeping, is the only
//!   signal between the revoker and the allocator

pub mod bitmap;
pub mod revoker;

pub use bitmap::ShadowBitmap;
pub use revoker::{epoch_finished, Revoker, RevokerMode};
