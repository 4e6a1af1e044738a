use tilemma_runtime::tma::TensorMapSwizzle;

/// Swizzle mode of an operand tile in shared memory.
///
/// The copy engine and the tensor core apply the same permutation. A tile written with one
/// mode and read through a descriptor carrying another is silently permuted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SwizzleMode {
    /// No swizzling, core matrices of 8 rows of 16 bytes.
    #[default]
    None,
    /// 32 bytes rows.
    B32,
    /// 64 bytes rows.
    B64,
    /// 128 bytes rows.
    B128,
}

impl SwizzleMode {
    /// Bytes of one row of the pattern.
    pub fn row_bytes(&self) -> usize {
        match self {
            SwizzleMode::None => 16,
            SwizzleMode::B32 => 32,
            SwizzleMode::B64 => 64,
            SwizzleMode::B128 => 128,
        }
    }

    /// Alignment required for a tile using this mode.
    pub fn alignment(&self) -> usize {
        match self {
            SwizzleMode::None => 16,
            _ => 128,
        }
    }

    /// Swizzle the shared memory byte address `address`.
    pub fn apply(&self, address: usize) -> usize {
        as_swizzle_object(*self).apply(address)
    }

    /// Layout type field of a matrix descriptor.
    pub const fn descriptor_code(&self) -> u64 {
        match self {
            SwizzleMode::None => 0,
            SwizzleMode::B128 => 1,
            SwizzleMode::B64 => 2,
            SwizzleMode::B32 => 3,
        }
    }

    /// Mode encoded by the two bits of a descriptor layout type field.
    pub fn from_descriptor_code(code: u64) -> Self {
        match code & 0b11 {
            1 => SwizzleMode::B128,
            2 => SwizzleMode::B64,
            3 => SwizzleMode::B32,
            _ => SwizzleMode::None,
        }
    }
}

impl From<TensorMapSwizzle> for SwizzleMode {
    fn from(value: TensorMapSwizzle) -> Self {
        match value {
            TensorMapSwizzle::None => SwizzleMode::None,
            TensorMapSwizzle::B32 => SwizzleMode::B32,
            TensorMapSwizzle::B64 => SwizzleMode::B64,
            TensorMapSwizzle::B128 => SwizzleMode::B128,
        }
    }
}

/// XOR swizzle over byte addresses.
///
/// `bits` bits starting at `base + shift` are XORed into the bits starting at `base`.
#[derive(new, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Swizzle {
    bits: u32,
    base: u32,
    shift: u32,
}

impl Swizzle {
    /// The identity.
    pub fn none() -> Self {
        Self::new(0, 0, 0)
    }

    /// Apply the permutation.
    pub fn apply(&self, address: usize) -> usize {
        let mask = ((1usize << self.bits) - 1) << (self.base + self.shift);
        address ^ ((address & mask) >> self.shift)
    }
}

/// Swizzle object of a mode: 16-byte chunks XORed with the index of the 128-byte row.
pub fn as_swizzle_object(mode: SwizzleMode) -> Swizzle {
    match mode {
        SwizzleMode::None => Swizzle::none(),
        SwizzleMode::B32 => Swizzle::new(1, 4, 3),
        SwizzleMode::B64 => Swizzle::new(2, 4, 3),
        SwizzleMode::B128 => Swizzle::new(3, 4, 3),
    }
}
