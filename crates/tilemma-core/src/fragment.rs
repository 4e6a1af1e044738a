use crate::{ExecutionFault, UnitPos, WARPGROUP_SIZE};
use half::f16;
use tilemma_runtime::storage::BytesResource;

/// Rows of the accumulator tile of a warpgroup MMA.
pub const FRAGMENT_ROWS: usize = 64;

/// Number of 32-bit accumulator registers per unit for an `m64nN` half precision result.
pub fn registers_per_unit(n: usize) -> usize {
    n / 4
}

/// Output coordinate of the low half of accumulator register `register` of `unit`.
///
/// Register `r` holds two consecutive columns of chunk `r / 2` in row band `r % 2`. Each warp
/// owns 16 rows; the lane group picks the row within a band and the lane within the group
/// picks the column pair.
pub fn accumulator_coordinates(unit: UnitPos, register: usize) -> (usize, usize) {
    let chunk = register / 2;
    let band = register % 2;

    let row = 16 * unit.warp() as usize + unit.lane_group() as usize + 8 * band;
    let col = 8 * chunk + 2 * unit.lane_in_group() as usize;

    (row, col)
}

/// Entry of a fragment map.
#[derive(new, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FragmentSlot {
    /// Owning unit.
    pub unit: u32,
    /// Register of the unit.
    pub register: usize,
    /// Output row.
    pub row: usize,
    /// Output column of the low half.
    pub col: usize,
}

/// Every (unit, register) slot of an `m64nN` accumulator with its output coordinate.
pub fn fragment_map(n: usize) -> Vec<FragmentSlot> {
    (0..WARPGROUP_SIZE)
        .flat_map(|unit| {
            (0..registers_per_unit(n)).map(move |register| {
                let (row, col) = accumulator_coordinates(UnitPos::new(unit), register);
                FragmentSlot::new(unit, register, row, col)
            })
        })
        .collect()
}

/// Pack two halves into a register, `low` holding the lower column.
pub fn pack_halves(low: f16, high: f16) -> u32 {
    (low.to_bits() as u32) | ((high.to_bits() as u32) << 16)
}

/// Split a register into its (low, high) halves.
pub fn unpack_halves(register: u32) -> (f16, f16) {
    (
        f16::from_bits(register as u16),
        f16::from_bits((register >> 16) as u16),
    )
}

/// Write the accumulator registers of `unit` to a row-major half precision `64 x n` output.
///
/// Each register is one 32-bit store of two consecutive columns.
pub fn scatter_result(
    unit: UnitPos,
    registers: &[u32],
    n: usize,
    output: &BytesResource,
) -> Result<(), ExecutionFault> {
    for (register, value) in registers.iter().enumerate() {
        let (row, col) = accumulator_coordinates(unit, register);
        output.write_value((row * n + col) / 2, *value)?;
    }

    Ok(())
}
