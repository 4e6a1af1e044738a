//! 64-bit shared memory matrix descriptors.
//!
//! | bits    | field                                  |
//! |---------|----------------------------------------|
//! | 0..14   | start address >> 4                     |
//! | 16..30  | leading dimension byte offset >> 4     |
//! | 32..46  | stride dimension byte offset >> 4      |
//! | 49..52  | matrix base offset                     |
//! | 62..64  | layout type (0 none, 1 128B, 2 64B, 3 32B) |
//!
//! Building a descriptor is pure. Alignment and range are checked only when the tensor core
//! consumes it.

use crate::{ExecutionFault, swizzle::SwizzleMode};

const ADDRESS_MASK: u64 = 0x3FFF;
const BASE_OFFSET_MASK: u64 = 0x7;

/// Encoded descriptor of an operand tile in shared memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MatrixDescriptor {
    bits: u64,
}

impl MatrixDescriptor {
    /// Encode a descriptor.
    ///
    /// Addresses and offsets are in bytes and keep their 16-byte granularity only; the low
    /// four bits are dropped by the encoding.
    pub const fn build(
        start_address: usize,
        leading_byte_offset: usize,
        stride_byte_offset: usize,
        swizzle: SwizzleMode,
    ) -> Self {
        let layout = swizzle.descriptor_code();

        let bits = (((start_address as u64) >> 4) & ADDRESS_MASK)
            | ((((leading_byte_offset as u64) >> 4) & ADDRESS_MASK) << 16)
            | ((((stride_byte_offset as u64) >> 4) & ADDRESS_MASK) << 32)
            | (layout << 62);

        Self { bits }
    }

    /// Same descriptor with the matrix base offset field set.
    pub const fn with_base_offset(self, base_offset: u8) -> Self {
        let cleared = self.bits & !(BASE_OFFSET_MASK << 49);
        Self {
            bits: cleared | (((base_offset as u64) & BASE_OFFSET_MASK) << 49),
        }
    }

    /// Descriptor from its raw bits.
    pub const fn from_bits(bits: u64) -> Self {
        Self { bits }
    }

    /// Raw bits.
    pub const fn bits(&self) -> u64 {
        self.bits
    }

    /// Decode every field.
    pub fn decode(&self) -> OperandLayout {
        OperandLayout {
            start_address: ((self.bits & ADDRESS_MASK) << 4) as usize,
            leading_byte_offset: (((self.bits >> 16) & ADDRESS_MASK) << 4) as usize,
            stride_byte_offset: (((self.bits >> 32) & ADDRESS_MASK) << 4) as usize,
            base_offset: ((self.bits >> 49) & BASE_OFFSET_MASK) as u8,
            swizzle: SwizzleMode::from_descriptor_code(self.bits >> 62),
        }
    }
}

/// Decoded descriptor, used by the tensor core to address operand elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperandLayout {
    /// Byte address of the tile.
    pub start_address: usize,
    /// Byte offset between core matrices along the contiguous dimension.
    pub leading_byte_offset: usize,
    /// Byte offset between groups of 8 rows along the strided dimension.
    pub stride_byte_offset: usize,
    /// Matrix base offset.
    pub base_offset: u8,
    /// Swizzle mode.
    pub swizzle: SwizzleMode,
}

impl OperandLayout {
    /// Check the start address alignment required by the swizzle mode.
    pub fn validate(&self) -> Result<(), ExecutionFault> {
        let alignment = self.swizzle.alignment();

        match self.start_address % alignment {
            0 => Ok(()),
            _ => Err(ExecutionFault::MisalignedAddress {
                what: "matrix descriptor start address",
                address: self.start_address as u64,
                alignment: alignment as u64,
            }),
        }
    }

    /// Shared memory byte address of a 16-bit element.
    ///
    /// `contiguous` indexes the dimension stored contiguously within a row of the swizzle
    /// pattern, `strided` the other one.
    pub fn address(&self, contiguous: usize, strided: usize) -> usize {
        let row_bytes = self.swizzle.row_bytes();
        let row_elems = row_bytes / 2;

        let logical = self.start_address
            + (strided / 8) * self.stride_byte_offset
            + (strided % 8) * row_bytes
            + (contiguous / row_elems) * self.leading_byte_offset
            + (contiguous % row_elems) * 2;

        self.swizzle.apply(logical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fields_are_placed_at_their_bit_positions() {
        let desc = MatrixDescriptor::build(0x400, 0x10, 0x100, SwizzleMode::B32);

        assert_eq!(desc.bits() & 0x3FFF, 0x40);
        assert_eq!((desc.bits() >> 16) & 0x3FFF, 0x1);
        assert_eq!((desc.bits() >> 32) & 0x3FFF, 0x10);
        assert_eq!(desc.bits() >> 62, 3);
        assert_eq!(
            desc.bits(),
            0x40u64 | (0x1u64 << 16) | (0x10u64 << 32) | (3u64 << 62)
        );
    }

    #[test]
    fn layout_field_carries_the_swizzle_code() {
        for mode in [
            SwizzleMode::None,
            SwizzleMode::B32,
            SwizzleMode::B64,
            SwizzleMode::B128,
        ] {
            let desc = MatrixDescriptor::build(0, 0, 256, mode);

            assert_eq!(desc.bits() >> 62, mode.descriptor_code());
            assert_eq!(desc.decode().swizzle, mode);
        }
    }

    #[test]
    fn decode_recovers_fields() {
        let desc = MatrixDescriptor::build(2048, 128, 256, SwizzleMode::B128).with_base_offset(5);

        assert_eq!(
            desc.decode(),
            OperandLayout {
                start_address: 2048,
                leading_byte_offset: 128,
                stride_byte_offset: 256,
                base_offset: 5,
                swizzle: SwizzleMode::B128,
            }
        );
    }

    #[test]
    fn rebuilding_for_a_sub_tile_gives_an_unrelated_value() {
        let first = MatrixDescriptor::build(0, 0, 256, SwizzleMode::B32);
        let second = MatrixDescriptor::build(2048, 0, 256, SwizzleMode::B32);

        assert_ne!(first, second);
        assert_eq!(second.bits() - first.bits(), 2048 >> 4);
        assert_eq!(first.decode().start_address, 0);
    }

    #[test]
    fn swizzled_tiles_require_128_byte_alignment() {
        let aligned = MatrixDescriptor::build(256, 0, 256, SwizzleMode::B32).decode();
        let misaligned = MatrixDescriptor::build(32, 0, 256, SwizzleMode::B32).decode();
        let unswizzled = MatrixDescriptor::build(32, 0, 128, SwizzleMode::None).decode();

        assert_eq!(aligned.validate(), Ok(()));
        assert_eq!(unswizzled.validate(), Ok(()));
        assert_eq!(
            misaligned.validate(),
            Err(ExecutionFault::MisalignedAddress {
                what: "matrix descriptor start address",
                address: 32,
                alignment: 128,
            })
        );
    }

    #[test]
    fn k_major_swizzled_tile_is_dense_before_swizzle() {
        // A 64x16 half tile with 32-byte rows: row m starts at m * 32.
        let layout = MatrixDescriptor::build(0, 0, 256, SwizzleMode::B32).decode();

        for m in 0..64 {
            for k in 0..16 {
                let expected = SwizzleMode::B32.apply(m * 32 + k * 2);
                assert_eq!(layout.address(k, m), expected);
            }
        }
    }

    #[test]
    fn unswizzled_tile_uses_core_matrices() {
        // 16-byte rows, core matrices of 8 rows laid out every 128 bytes along the
        // strided dimension and every `leading` bytes along the contiguous one.
        let layout = MatrixDescriptor::build(512, 1024, 128, SwizzleMode::None).decode();

        assert_eq!(layout.address(0, 0), 512);
        assert_eq!(layout.address(7, 0), 512 + 14);
        assert_eq!(layout.address(0, 9), 512 + 128 + 16);
        assert_eq!(layout.address(8, 0), 512 + 1024);
    }
}
