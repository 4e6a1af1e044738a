#![warn(missing_docs)]

//! Device-side building blocks of a single tile tensor core matmul.
//!
//! Every primitive runs on the simulated units of [tilemma_runtime]: an arrival barrier
//! that counts both unit arrivals and asynchronously copied bytes, a bulk copy engine moving
//! tiles between global and shared memory, matrix descriptors addressing swizzled operand
//! tiles, and a warpgroup MMA pipeline with its commit and fence protocol.

#[macro_use]
extern crate derive_new;

/// Arrival barrier with transaction counting.
pub mod barrier;
/// Shared memory descriptors for the tensor core.
pub mod descriptor;
/// Accumulator fragment layout and result scatter.
pub mod fragment;
/// Block-local scratch memory.
pub mod shared_memory;
/// 2:4 structured sparsity metadata addressing.
pub mod sparsity;
/// Shared memory swizzle patterns.
pub mod swizzle;
/// Asynchronous bulk copies between global and shared memory.
pub mod tma;
/// Warpgroup matrix multiply-accumulate.
pub mod warpgroup;

pub use tilemma_runtime::kernel::{Role, UnitPos};
pub use tilemma_runtime::server::ExecutionFault;

/// Number of units in a warpgroup.
pub const WARPGROUP_SIZE: u32 = 128;
