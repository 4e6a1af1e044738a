use thiserror::Error;
use tilemma_runtime::server::{LaunchError, ServerError};

/// Errors of the host side matmul entry points.
#[derive(Error, Debug)]
pub enum MatmulError {
    /// The kernel was rejected at launch.
    #[error(transparent)]
    Launch(#[from] LaunchError),
    /// The kernel faulted, reported by the synchronizing read.
    #[error(transparent)]
    Server(#[from] ServerError),
    /// The sparse operand couldn't be compressed.
    #[error(transparent)]
    Sparsity(#[from] SparsityError),
    /// An operand doesn't hold the elements of the fixed tile shape.
    #[error("{operand} holds {actual} elements, the kernel expects {expected}")]
    InvalidOperand {
        /// Name of the operand.
        operand: &'static str,
        /// Elements of the tile.
        expected: usize,
        /// Elements provided.
        actual: usize,
    },
}

/// Errors raised when compressing an operand to the 2:4 structured sparse format.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SparsityError {
    /// The operand dimensions don't fit the compressed layout.
    #[error("a {m}x{k} operand can't be 2:4 compressed, K must be a positive multiple of 32")]
    InvalidShape {
        /// Rows of the operand.
        m: usize,
        /// Reduction extent of the operand.
        k: usize,
    },
    /// The operand data doesn't match its declared dimensions.
    #[error("operand holds {actual} elements, expected {expected}")]
    LengthMismatch {
        /// Elements implied by the dimensions.
        expected: usize,
        /// Elements provided.
        actual: usize,
    },
    /// A group of four elements along K holds more than two nonzeros.
    #[error("group {group} of row {row} holds {nonzeros} nonzero elements, at most 2 are allowed")]
    TooDense {
        /// Row of the group.
        row: usize,
        /// Index of the group along K.
        group: usize,
        /// Nonzeros found in the group.
        nonzeros: usize,
    },
}

/// Verification time finding, the kernel completed but its result is wrong.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerificationError {
    /// An output element differs from the reference beyond the tolerance.
    #[error(
        "values differ more than epsilon: index={index} actual={actual}, expected={expected}, epsilon={epsilon}"
    )]
    NumericalMismatch {
        /// Linear index of the element.
        index: usize,
        /// Value computed by the kernel.
        actual: f32,
        /// Reference value.
        expected: f32,
        /// Tolerance.
        epsilon: f32,
    },
    /// The output and the reference have different lengths.
    #[error("output holds {actual} elements but the reference holds {expected}")]
    LengthMismatch {
        /// Reference length.
        expected: usize,
        /// Output length.
        actual: usize,
    },
}
