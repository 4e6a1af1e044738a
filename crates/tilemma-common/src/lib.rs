#![warn(missing_docs)]

//! Common utilities shared by the tilemma crates.

/// Backtrace capture for host-visible errors.
pub mod backtrace;

/// Deterministic and seeded random data for tests and demos.
pub mod rand;
