//! Host-side tile descriptors ("tensor maps") consumed by the asynchronous copy engine.
//!
//! A tensor map is built once per launch and passed by value to the kernel. Device code never
//! inspects it: the copy engine uses it to translate a box coordinate into global memory
//! accesses.

use crate::storage::{Binding, BytesResource};
use thiserror::Error;

/// Maximum rank of a tensor map.
pub const MAX_RANK: usize = 5;
/// Maximum size of a box dimension, in elements.
pub const MAX_BOX_DIM: u32 = 256;

/// Format of a tensor map.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TensorMapFormat {
    /// Simple tiling, the box is copied as a dense block.
    Tiled {
        /// Box size in elements, outermost dimension first.
        tile_size: Vec<u32>,
    },
}

/// Swizzle pattern applied by the copy engine when writing into shared memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TensorMapSwizzle {
    /// No swizzling.
    #[default]
    None,
    /// Swizzle 16B chunks within a 32B span.
    B32,
    /// Swizzle 16B chunks within a 64B span.
    B64,
    /// Swizzle 16B chunks within a 128B span.
    B128,
}

impl TensorMapSwizzle {
    /// Bytes of one swizzled row, `None` when unswizzled.
    pub fn span_bytes(&self) -> Option<usize> {
        match self {
            TensorMapSwizzle::None => None,
            TensorMapSwizzle::B32 => Some(32),
            TensorMapSwizzle::B64 => Some(64),
            TensorMapSwizzle::B128 => Some(128),
        }
    }
}

/// Value used for elements of a box that fall outside the tensor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OobFill {
    /// Fill with zeros.
    #[default]
    Zero,
    /// Fill with NaN, floating point elements only.
    NaN,
}

/// Element type of a tensor map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TensorMapElem {
    /// Half precision float.
    F16,
    /// Single precision float.
    F32,
    /// 32-bit unsigned integer.
    U32,
}

impl TensorMapElem {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            TensorMapElem::F16 => 2,
            TensorMapElem::F32 | TensorMapElem::U32 => 4,
        }
    }

    fn nan_bytes(&self) -> Option<Vec<u8>> {
        match self {
            TensorMapElem::F16 => Some(half::f16::NAN.to_bits().to_le_bytes().to_vec()),
            TensorMapElem::F32 => Some(f32::NAN.to_bits().to_le_bytes().to_vec()),
            TensorMapElem::U32 => None,
        }
    }
}

/// Errors raised when validating a tensor map against its backing buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TensorMapError {
    /// Rank is zero or above [MAX_RANK].
    #[error("rank {rank} is not supported, expected 1..={MAX_RANK}")]
    InvalidRank {
        /// The rank.
        rank: usize,
    },
    /// A per-dimension list doesn't match the rank.
    #[error("{what} has {len} entries but the rank is {rank}")]
    RankMismatch {
        /// The mismatched field.
        what: &'static str,
        /// Its length.
        len: usize,
        /// The expected rank.
        rank: usize,
    },
    /// A tensor dimension is empty.
    #[error("dimension {dim} of the tensor is empty")]
    EmptyDim {
        /// Index of the dimension.
        dim: usize,
    },
    /// A box dimension is out of range.
    #[error("box dimension {dim} has size {size}, expected 1..={MAX_BOX_DIM}")]
    InvalidBoxDim {
        /// Index of the dimension.
        dim: usize,
        /// Its size.
        size: u32,
    },
    /// The inner box dimension isn't made of whole 16 byte chunks.
    #[error("inner box dimension spans {bytes} bytes, which isn't a multiple of 16")]
    InnerBoxNotAligned {
        /// Size of the inner box dimension in bytes.
        bytes: usize,
    },
    /// The inner box dimension doesn't match the swizzle span.
    #[error("inner box dimension spans {bytes} bytes but swizzle {swizzle:?} spans {span} bytes")]
    SwizzleSpanMismatch {
        /// The swizzle.
        swizzle: TensorMapSwizzle,
        /// Size of the inner box dimension in bytes.
        bytes: usize,
        /// Span of the swizzle pattern.
        span: usize,
    },
    /// The innermost dimension isn't contiguous.
    #[error("innermost stride must be 1, got {stride}")]
    NonContiguousInner {
        /// The innermost stride.
        stride: usize,
    },
    /// An outer stride isn't a multiple of 16 bytes.
    #[error("stride of dimension {dim} is {bytes} bytes, which isn't a multiple of 16")]
    StrideNotAligned {
        /// Index of the dimension.
        dim: usize,
        /// The stride in bytes.
        bytes: usize,
    },
    /// The tensor extends past its backing buffer.
    #[error("tensor requires {required} bytes but its buffer holds {available}")]
    ExceedsBuffer {
        /// Bytes addressed by the tensor.
        required: usize,
        /// Size of the buffer.
        available: usize,
    },
    /// NaN fill requested for a non floating point element.
    #[error("NaN fill isn't supported for {elem:?}")]
    UnsupportedNanFill {
        /// The element type.
        elem: TensorMapElem,
    },
}

/// Metadata of a tensor map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorMapMeta {
    /// Tensormap format.
    pub format: TensorMapFormat,
    /// Shape of the backing tensor in elements, outermost dimension first.
    pub shape: Vec<usize>,
    /// Strides of the backing tensor in elements, outermost dimension first.
    pub strides: Vec<usize>,
    /// Element type.
    pub elem: TensorMapElem,
    /// Swizzle mode.
    pub swizzle: TensorMapSwizzle,
    /// OOB fill value.
    pub oob_fill: OobFill,
}

impl TensorMapMeta {
    /// Tiled tensor map over a tensor, without swizzle and with zero fill.
    pub fn tiled(
        shape: Vec<usize>,
        strides: Vec<usize>,
        tile_size: Vec<u32>,
        elem: TensorMapElem,
    ) -> Self {
        Self {
            format: TensorMapFormat::Tiled { tile_size },
            shape,
            strides,
            elem,
            swizzle: TensorMapSwizzle::None,
            oob_fill: OobFill::Zero,
        }
    }

    /// Tiled tensor map over a contiguous row-major tensor.
    pub fn tiled_contiguous(shape: Vec<usize>, tile_size: Vec<u32>, elem: TensorMapElem) -> Self {
        let mut strides = vec![1; shape.len()];
        for dim in (0..shape.len().saturating_sub(1)).rev() {
            strides[dim] = strides[dim + 1] * shape[dim + 1];
        }
        Self::tiled(shape, strides, tile_size, elem)
    }

    /// Set the swizzle mode.
    pub fn with_swizzle(mut self, swizzle: TensorMapSwizzle) -> Self {
        self.swizzle = swizzle;
        self
    }

    /// Fill out-of-bounds elements with NaN.
    pub fn with_nan_fill(mut self) -> Self {
        self.oob_fill = OobFill::NaN;
        self
    }

    /// Rank of the tensor.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Box size in elements, outermost dimension first.
    pub fn tile_size(&self) -> &[u32] {
        match &self.format {
            TensorMapFormat::Tiled { tile_size } => tile_size,
        }
    }

    /// Size of one box in bytes.
    pub fn box_bytes(&self) -> usize {
        self.tile_size().iter().map(|size| *size as usize).product::<usize>() * self.elem.size()
    }

    /// Check the tensor map against a buffer of `buffer_len` bytes.
    pub fn validate(&self, buffer_len: usize) -> Result<(), TensorMapError> {
        let rank = self.rank();
        if rank == 0 || rank > MAX_RANK {
            return Err(TensorMapError::InvalidRank { rank });
        }

        for (what, len) in [
            ("strides", self.strides.len()),
            ("tile_size", self.tile_size().len()),
        ] {
            if len != rank {
                return Err(TensorMapError::RankMismatch { what, len, rank });
            }
        }

        if let Some(dim) = self.shape.iter().position(|size| *size == 0) {
            return Err(TensorMapError::EmptyDim { dim });
        }

        for (dim, size) in self.tile_size().iter().enumerate() {
            if *size == 0 || *size > MAX_BOX_DIM {
                return Err(TensorMapError::InvalidBoxDim { dim, size: *size });
            }
        }

        let elem_size = self.elem.size();
        let inner_bytes = self.tile_size()[rank - 1] as usize * elem_size;
        if inner_bytes % 16 != 0 {
            return Err(TensorMapError::InnerBoxNotAligned { bytes: inner_bytes });
        }
        if let Some(span) = self.swizzle.span_bytes() {
            if inner_bytes != span {
                return Err(TensorMapError::SwizzleSpanMismatch {
                    swizzle: self.swizzle,
                    bytes: inner_bytes,
                    span,
                });
            }
        }

        if self.strides[rank - 1] != 1 {
            return Err(TensorMapError::NonContiguousInner {
                stride: self.strides[rank - 1],
            });
        }
        for dim in 0..rank - 1 {
            let bytes = self.strides[dim] * elem_size;
            if bytes % 16 != 0 {
                return Err(TensorMapError::StrideNotAligned { dim, bytes });
            }
        }

        let last = self
            .shape
            .iter()
            .zip(self.strides.iter())
            .map(|(size, stride)| (size - 1) * stride)
            .sum::<usize>();
        let required = (last + 1) * elem_size;
        if required > buffer_len {
            return Err(TensorMapError::ExceedsBuffer {
                required,
                available: buffer_len,
            });
        }

        if self.oob_fill == OobFill::NaN && self.elem.nan_bytes().is_none() {
            return Err(TensorMapError::UnsupportedNanFill { elem: self.elem });
        }

        Ok(())
    }
}

/// A tensor map used with TMA ops, as passed to a launch.
#[derive(new, Debug, Clone)]
pub struct TensorMapBinding {
    /// The binding for the backing tensor
    pub binding: Binding,
    /// The tensormap metadata
    pub map: TensorMapMeta,
}

/// A validated tensor map resolved against its backing allocation.
#[derive(Debug, Clone)]
pub struct TensorMap {
    meta: TensorMapMeta,
    resource: BytesResource,
}

impl TensorMap {
    /// Validate `meta` against `resource`.
    pub fn new(meta: TensorMapMeta, resource: BytesResource) -> Result<Self, TensorMapError> {
        meta.validate(resource.len())?;
        Ok(Self { meta, resource })
    }

    /// Tensormap metadata.
    pub fn meta(&self) -> &TensorMapMeta {
        &self.meta
    }

    /// Backing global memory.
    pub fn resource(&self) -> &BytesResource {
        &self.resource
    }

    /// Byte offset of the element at `position`, `None` when it lies outside the tensor.
    pub fn global_offset(&self, position: &[i64]) -> Option<usize> {
        let mut index = 0;

        for ((coord, size), stride) in position
            .iter()
            .zip(self.meta.shape.iter())
            .zip(self.meta.strides.iter())
        {
            if *coord < 0 || *coord as usize >= *size {
                return None;
            }
            index += *coord as usize * stride;
        }

        Some(index * self.meta.elem.size())
    }

    /// Bytes written to shared memory for an out-of-bounds element.
    pub fn fill_bytes(&self) -> Vec<u8> {
        match self.meta.oob_fill {
            OobFill::NaN => self
                .meta
                .elem
                .nan_bytes()
                .unwrap_or_else(|| vec![0; self.meta.elem.size()]),
            OobFill::Zero => vec![0; self.meta.elem.size()],
        }
    }

    /// Positions of every element of the box at `coords`, in shared memory order.
    pub fn box_positions(&self, coords: &[i64]) -> Vec<Vec<i64>> {
        let tile_size = self.meta.tile_size();
        let count = tile_size.iter().map(|size| *size as usize).product::<usize>();

        (0..count)
            .map(|linear| {
                let mut rest = linear;
                let mut position = vec![0; tile_size.len()];
                for dim in (0..tile_size.len()).rev() {
                    let size = tile_size[dim] as usize;
                    position[dim] = coords[dim] + (rest % size) as i64;
                    rest /= size;
                }
                position
            })
            .collect()
    }
}
