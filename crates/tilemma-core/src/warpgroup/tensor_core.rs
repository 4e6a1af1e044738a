//! Products are rounded to half precision and accumulated sequentially along K in half
//! precision, `d = d + a * b`. Sparse operands are expanded to their logical K extent first,
//! so the structural zeros take part in the accumulation like any other element.

use super::{
    accumulator::Accumulator,
    instruction::{Mma, MmaKind},
};
use crate::{
    ExecutionFault, UnitPos, WARPGROUP_SIZE,
    descriptor::OperandLayout,
    fragment::{FRAGMENT_ROWS, accumulator_coordinates, pack_halves, unpack_halves},
    shared_memory::SharedMemory,
    sparsity::{expand_row, is_well_formed, row_metadata},
};
use half::f16;

/// Row-major `64 x n` half precision view of the accumulators of a warpgroup.
#[derive(Clone, Debug, PartialEq)]
pub struct AccumulatorTile {
    n: usize,
    values: Vec<f16>,
}

impl AccumulatorTile {
    /// Zero tile.
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            values: vec![f16::ZERO; FRAGMENT_ROWS * n],
        }
    }

    /// Gather the registers of every unit, in unit order.
    pub fn gather(registers: &[Vec<u32>], n: usize) -> Self {
        let mut tile = Self::zeros(n);

        for (unit, registers) in registers.iter().enumerate() {
            for (register, value) in registers.iter().enumerate() {
                let (row, col) = accumulator_coordinates(UnitPos::new(unit as u32), register);
                let (low, high) = unpack_halves(*value);
                tile.values[row * n + col] = low;
                tile.values[row * n + col + 1] = high;
            }
        }

        tile
    }

    /// Registers of `unit`.
    pub fn registers(&self, unit: UnitPos, count: usize) -> Vec<u32> {
        (0..count)
            .map(|register| {
                let (row, col) = accumulator_coordinates(unit, register);
                pack_halves(self.get(row, col), self.get(row, col + 1))
            })
            .collect()
    }

    /// Value at `(row, col)`.
    pub fn get(&self, row: usize, col: usize) -> f16 {
        self.values[row * self.n + col]
    }

    /// Row-major values.
    pub fn values(&self) -> &[f16] {
        &self.values
    }
}

/// Execute one MMA, updating `d` in place.
///
/// `metadata` holds the register issued by every unit, only read by sparse MMAs.
pub fn execute(
    smem: &SharedMemory,
    mma: &Mma,
    d: &mut AccumulatorTile,
    metadata: &[u32],
) -> Result<(), ExecutionFault> {
    mma.validate()?;

    let a_layout = mma.a.decode();
    let b_layout = mma.b.decode();
    a_layout.validate()?;
    b_layout.validate()?;

    let (m, n, k) = (mma.shape.m, mma.shape.n, mma.shape.k);
    if d.n != n {
        return Err(ExecutionFault::protocol(format!(
            "accumulator of {} columns used by an n{n} MMA",
            d.n
        )));
    }

    let a = match mma.kind {
        MmaKind::Dense => (0..m)
            .map(|row| {
                (0..k)
                    .map(|kk| operand(smem, &a_layout, mma.transpose_a, row, kk))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?,
        MmaKind::Sparse { selector } => {
            if metadata.len() != WARPGROUP_SIZE as usize {
                return Err(ExecutionFault::protocol(format!(
                    "sparse MMA issued with {} metadata registers, expected one per unit of the warpgroup",
                    metadata.len()
                )));
            }
            let rows = row_metadata(metadata, selector);
            let mut expanded = Vec::with_capacity(m);

            for (row, meta) in rows.into_iter().enumerate() {
                if !is_well_formed(meta) {
                    return Err(ExecutionFault::protocol(format!(
                        "sparsity metadata {meta:#010x} of row {row} is malformed"
                    )));
                }
                let compressed = (0..k / 2)
                    .map(|kc| operand(smem, &a_layout, mma.transpose_a, row, kc))
                    .collect::<Result<Vec<_>, _>>()?;
                expanded.push(expand_row(&compressed, meta).to_vec());
            }

            expanded
        }
    };

    let b = (0..k)
        .map(|kk| {
            (0..n)
                .map(|col| operand(smem, &b_layout, mma.transpose_b, col, kk))
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<Vec<_>, _>>()?;

    for row in 0..m {
        for col in 0..n {
            let mut acc = match mma.scale_d {
                true => d.get(row, col),
                false => f16::ZERO,
            };

            for kk in 0..k {
                let lhs = sign(a[row][kk], mma.negate_a);
                let rhs = sign(b[kk][col], mma.negate_b);
                acc = acc + lhs * rhs;
            }

            d.values[row * n + col] = acc;
        }
    }

    log::trace!("Executed {:?} m{m}n{n}k{k}", mma.kind);
    Ok(())
}

/// Execute `mma` for a whole warpgroup and retire its accumulators.
pub(crate) fn execute_for_warpgroup(
    smem: &SharedMemory,
    mma: &Mma,
    accumulators: &[Accumulator],
    metadata: &[u32],
) -> Result<(), ExecutionFault> {
    let registers = accumulators
        .iter()
        .map(Accumulator::registers)
        .collect::<Vec<_>>();
    let mut tile = AccumulatorTile::gather(&registers, mma.shape.n);

    execute(smem, mma, &mut tile, metadata)?;

    for (unit, acc) in accumulators.iter().enumerate() {
        acc.retire(tile.registers(UnitPos::new(unit as u32), acc.len()));
    }

    Ok(())
}

// Element `(mn, k)` of an operand, `mn` indexing M for A and N for B.
fn operand(
    smem: &SharedMemory,
    layout: &OperandLayout,
    transpose: bool,
    mn: usize,
    k: usize,
) -> Result<f16, ExecutionFault> {
    let address = match transpose {
        true => layout.address(mn, k),
        false => layout.address(k, mn),
    };

    let mut bytes = [0u8; 2];
    smem.read_async(address, &mut bytes)?;
    Ok(f16::from_le_bytes(bytes))
}

fn sign(value: f16, negate: bool) -> f16 {
    match negate {
        true => -value,
        false => value,
    }
}
