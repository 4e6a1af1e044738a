//! Host side 2:4 structured sparsity.

use crate::error::SparsityError;
use half::f16;
use tilemma_core::sparsity::{GROUPS_PER_METADATA, SPARSE_K, expand_row, group_indices};

/// A row-major `m x k` operand compressed to `m x k/2` values and its metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct CompressedOperand {
    /// Rows.
    pub m: usize,
    /// Logical reduction extent.
    pub k: usize,
    /// Row-major `m x k/2` kept values.
    pub values: Vec<f16>,
    /// One value per row per 32-wide K sub-block, laid out `[k_sub][row]`.
    pub metadata: Vec<u32>,
}

/// Compress a row-major `m x k` operand where every group of four elements along K holds at
/// most two nonzeros.
///
/// Groups with fewer than two nonzeros keep zeros at the lowest free indices.
pub fn compress_2_4(a: &[f16], m: usize, k: usize) -> Result<CompressedOperand, SparsityError> {
    if k == 0 || k % SPARSE_K != 0 {
        return Err(SparsityError::InvalidShape { m, k });
    }
    if a.len() != m * k {
        return Err(SparsityError::LengthMismatch {
            expected: m * k,
            actual: a.len(),
        });
    }

    let k_subs = k / SPARSE_K;
    let mut values = vec![f16::ZERO; m * k / 2];
    let mut metadata = vec![0u32; k_subs * m];

    for row in 0..m {
        for group in 0..k / 4 {
            let elements = &a[row * k + 4 * group..row * k + 4 * group + 4];
            let nonzeros = (0..4)
                .filter(|index| elements[*index] != f16::ZERO)
                .collect::<Vec<_>>();

            if nonzeros.len() > 2 {
                return Err(SparsityError::TooDense {
                    row,
                    group,
                    nonzeros: nonzeros.len(),
                });
            }

            let mut kept = nonzeros;
            for index in 0..4 {
                if kept.len() == 2 {
                    break;
                }
                if !kept.contains(&index) {
                    kept.push(index);
                }
            }
            kept.sort_unstable();

            values[row * k / 2 + 2 * group] = elements[kept[0]];
            values[row * k / 2 + 2 * group + 1] = elements[kept[1]];

            let nibble = (kept[0] | (kept[1] << 2)) as u32;
            let k_sub = group / GROUPS_PER_METADATA;
            metadata[k_sub * m + row] |= nibble << (4 * (group % GROUPS_PER_METADATA));
        }
    }

    log::debug!("Compressed a {m}x{k} operand into {} metadata values", metadata.len());

    Ok(CompressedOperand {
        m,
        k,
        values,
        metadata,
    })
}

/// Expand a compressed operand back to its row-major `m x k` values.
pub fn decompress_2_4(operand: &CompressedOperand) -> Vec<f16> {
    let (m, k) = (operand.m, operand.k);
    let mut out = Vec::with_capacity(m * k);

    for row in 0..m {
        for k_sub in 0..k / SPARSE_K {
            let start = row * k / 2 + k_sub * SPARSE_K / 2;
            let compressed = &operand.values[start..start + SPARSE_K / 2];
            out.extend(expand_row(compressed, operand.metadata[k_sub * m + row]));
        }
    }

    out
}

/// Indices kept by group `group` of `row`.
pub fn kept_indices(operand: &CompressedOperand, row: usize, group: usize) -> (usize, usize) {
    let k_sub = group / GROUPS_PER_METADATA;
    group_indices(
        operand.metadata[k_sub * operand.m + row],
        group % GROUPS_PER_METADATA,
    )
}

/// Zero the two smallest magnitudes of every group of four along K of a row-major operand.
pub fn prune_2_4(a: &mut [f16]) {
    for group in a.chunks_exact_mut(4) {
        let mut order = [0, 1, 2, 3];
        order.sort_by(|lhs, rhs| {
            group[*lhs]
                .to_f32()
                .abs()
                .total_cmp(&group[*rhs].to_f32().abs())
        });
        group[order[0]] = f16::ZERO;
        group[order[1]] = f16::ZERO;
    }
}
