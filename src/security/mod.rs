//! Security Primitives Module
//!
//! Memory hygiene helpers for the heap:
//! - Scrubbing freed chunks before quarantine
//!
//! # Security Properties
//! - Memory is cleared using volatile writes to prevent optimization

pub mod zeroize;

pub use zeroize::Zeroize;
