//! Addressing of 2:4 structured sparsity metadata.
//!
//! The host uploads one `u32` per row of A and per 32-wide K sub-block, laid out
//! `[k_sub][row]`: the buffer holds 64 values per K sub-block. Each nibble describes one
//! group of four K elements: bits 0..2 hold the index of the first kept element, bits 2..4
//! the index of the second, in ascending order.
//! The compressed row stores the two kept values of group `g` at `2g` and `2g + 1`.

use crate::{UnitPos, fragment::FRAGMENT_ROWS};
use half::f16;

/// Logical K extent covered by one sparse MMA.
pub const SPARSE_K: usize = 32;
/// Groups of four K elements described by one metadata value.
pub const GROUPS_PER_METADATA: usize = SPARSE_K / 4;

/// Index into the metadata buffer loaded by `unit` for K sub-block `k_sub`.
pub fn metadata_index(k_sub: usize, unit: UnitPos) -> usize {
    let warp = unit.warp() as usize;
    let lane = unit.lane() as usize;

    k_sub * FRAGMENT_ROWS + 16 * warp + 8 * (lane % 2) + lane / 4
}

/// Unit whose metadata register describes `row` of A for the given sparsity selector.
pub fn metadata_source(row: usize, selector: u32) -> UnitPos {
    let warp = row / 16;
    let local = row % 16;
    let lane = 4 * (local % 8) + 2 * selector as usize + local / 8;

    UnitPos::new((32 * warp + lane) as u32)
}

/// Metadata of every row of A, gathered from the registers of the warpgroup.
///
/// A register missing from `registers` reads as zero, which is never well formed.
pub fn row_metadata(registers: &[u32], selector: u32) -> Vec<u32> {
    (0..FRAGMENT_ROWS)
        .map(|row| {
            let source = metadata_source(row, selector).unit as usize;
            registers.get(source).copied().unwrap_or_default()
        })
        .collect()
}

/// Indices of the two kept elements of group `group`.
pub fn group_indices(metadata: u32, group: usize) -> (usize, usize) {
    let nibble = (metadata >> (4 * group)) & 0xF;
    ((nibble & 0b11) as usize, (nibble >> 2) as usize)
}

/// Whether every group of `metadata` keeps two distinct elements in ascending order.
pub fn is_well_formed(metadata: u32) -> bool {
    (0..GROUPS_PER_METADATA).all(|group| {
        let (first, second) = group_indices(metadata, group);
        first < second
    })
}

/// Expand one compressed row of 16 values into its 32 logical values.
pub fn expand_row(compressed: &[f16], metadata: u32) -> [f16; SPARSE_K] {
    let mut row = [f16::ZERO; SPARSE_K];

    for group in 0..GROUPS_PER_METADATA {
        let (first, second) = group_indices(metadata, group);
        row[4 * group + first] = compressed[2 * group];
        row[4 * group + second] = compressed[2 * group + 1];
    }

    row
}
