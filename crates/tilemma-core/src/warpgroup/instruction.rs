use crate::{ExecutionFault, descriptor::MatrixDescriptor, fragment::FRAGMENT_ROWS};

/// Shape of a warpgroup MMA, `m64nNkK`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MmaShape {
    /// Rows of A and of the accumulator.
    pub m: usize,
    /// Columns of B and of the accumulator.
    pub n: usize,
    /// Logical reduction extent.
    pub k: usize,
}

impl MmaShape {
    /// Dense half precision shape `m64nNk16`.
    pub const fn dense(n: usize) -> Self {
        Self { m: 64, n, k: 16 }
    }

    /// Sparse half precision shape `m64nNk32`.
    pub const fn sparse(n: usize) -> Self {
        Self { m: 64, n, k: 32 }
    }

    pub(crate) fn validate(&self, kind: MmaKind) -> Result<(), ExecutionFault> {
        let k = match kind {
            MmaKind::Dense => 16,
            MmaKind::Sparse { .. } => 32,
        };

        if self.m != FRAGMENT_ROWS || self.k != k || self.n % 8 != 0 || !(8..=256).contains(&self.n)
        {
            return Err(ExecutionFault::protocol(format!(
                "unsupported {kind:?} shape m{}n{}k{}",
                self.m, self.n, self.k
            )));
        }

        Ok(())
    }
}

/// Operand mode of an MMA.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MmaKind {
    /// Both operands dense.
    Dense,
    /// A is 2:4 compressed along K.
    Sparse {
        /// Which pair of lanes of each lane group provides the metadata, 0 or 1.
        selector: u32,
    },
}

/// One warpgroup MMA instruction, `D = A * B + D`.
///
/// Every unit of the warpgroup must issue the same instruction at the same point of a batch.
/// The per-unit sparsity metadata is passed separately at issue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Mma {
    /// Shape of the operation.
    pub shape: MmaShape,
    /// Descriptor of A.
    pub a: MatrixDescriptor,
    /// Descriptor of B.
    pub b: MatrixDescriptor,
    /// Operand mode.
    pub kind: MmaKind,
    /// Accumulate into the existing accumulator when set, overwrite it otherwise.
    pub scale_d: bool,
    /// Negate A.
    pub negate_a: bool,
    /// Negate B.
    pub negate_b: bool,
    /// A is stored M-major instead of K-major.
    pub transpose_a: bool,
    /// B is stored N-major instead of K-major.
    pub transpose_b: bool,
}

impl Mma {
    /// Dense MMA accumulating into the existing result.
    pub fn dense(shape: MmaShape, a: MatrixDescriptor, b: MatrixDescriptor) -> Self {
        Self::with_kind(shape, a, b, MmaKind::Dense)
    }

    /// Sparse MMA accumulating into the existing result.
    pub fn sparse(shape: MmaShape, a: MatrixDescriptor, b: MatrixDescriptor, selector: u32) -> Self {
        Self::with_kind(shape, a, b, MmaKind::Sparse { selector })
    }

    fn with_kind(shape: MmaShape, a: MatrixDescriptor, b: MatrixDescriptor, kind: MmaKind) -> Self {
        Self {
            shape,
            a,
            b,
            kind,
            scale_d: true,
            negate_a: false,
            negate_b: false,
            transpose_a: false,
            transpose_b: false,
        }
    }

    /// Set whether the existing accumulator is added to the product.
    pub fn with_scale_d(mut self, scale_d: bool) -> Self {
        self.scale_d = scale_d;
        self
    }

    /// Negate A.
    pub fn negate_a(mut self) -> Self {
        self.negate_a = true;
        self
    }

    /// Negate B.
    pub fn negate_b(mut self) -> Self {
        self.negate_b = true;
        self
    }

    /// Read A as M-major.
    pub fn transpose_a(mut self) -> Self {
        self.transpose_a = true;
        self
    }

    /// Read B as N-major.
    pub fn transpose_b(mut self) -> Self {
        self.transpose_b = true;
        self
    }

    /// Check the shape and the sparsity selector.
    pub fn validate(&self) -> Result<(), ExecutionFault> {
        self.shape.validate(self.kind)?;

        match self.kind {
            MmaKind::Sparse { selector } if selector > 1 => Err(ExecutionFault::protocol(
                format!("sparsity selector {selector} is out of range"),
            )),
            _ => Ok(()),
        }
    }
}
