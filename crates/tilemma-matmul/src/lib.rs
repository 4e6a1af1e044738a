#![warn(missing_docs)]

//! Single tile tensor core matmul kernels.
//!
//! Three kernels run on one cube of 128 units: a dense `m64n16k16` product, a 2:4 sparse
//! product issuing two `m64n8k32` instructions over K = 64, and a copy-only tile round
//! trip. Each comes with a host launcher. The crate also provides the host side 2:4
//! compression and the CPU references used to verify results.

#[macro_use]
extern crate derive_new;

/// Error types of the host entry points.
pub mod error;
/// Kernels and host launchers.
pub mod kernels;
/// Host side 2:4 compression.
pub mod sparse;
/// CPU references and result comparison.
pub mod verification;

pub use error::{MatmulError, SparsityError, VerificationError};
pub use kernels::{
    dense::{DenseMatmul, launch_dense, matmul_dense},
    sparse::{SparseMatmul, launch_sparse, matmul_sparse, matmul_sparse_compressed},
    tile_copy::{TileCopy, increment_tile, launch_tile_copy},
};

#[cfg(test)]
mod tests;
