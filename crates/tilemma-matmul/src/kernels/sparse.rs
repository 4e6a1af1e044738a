use super::{MmaBlock, TileLoad, check_len, halves_from_bytes};
use crate::{
    error::MatmulError,
    sparse::{CompressedOperand, compress_2_4},
};
use half::f16;
use tilemma_core::{
    ExecutionFault, UnitPos, WARPGROUP_SIZE,
    descriptor::MatrixDescriptor,
    fragment::{registers_per_unit, scatter_result},
    shared_memory::{ScratchRegion, SharedMemoryLayout},
    sparsity::{SPARSE_K, metadata_index},
    swizzle::SwizzleMode,
    warpgroup::{Accumulator, Mma, MmaShape},
};
use tilemma_runtime::{
    client::ComputeClient,
    kernel::{BlockContext, CubeCount, CubeDim, CubeKernel, KernelResources},
    server::{Bindings, LaunchError},
    storage::Handle,
    tma::{TensorMapBinding, TensorMapElem, TensorMapMeta, TensorMapSwizzle},
};

/// Rows of the output tile.
pub const SPARSE_M: usize = 64;
/// Columns of the output tile.
pub const SPARSE_N: usize = 8;
/// Logical reduction extent, covered by two instructions.
pub const SPARSE_TOTAL_K: usize = 2 * SPARSE_K;

const K_SUBS: usize = SPARSE_TOTAL_K / SPARSE_K;
// Kept values of one K sub-block of a row.
const COMPRESSED_K: usize = SPARSE_K / 2;
const LHS_SUB_TILE_BYTES: usize = SPARSE_M * COMPRESSED_K * 2;
const RHS_SUB_TILE_BYTES: usize = SPARSE_K * SPARSE_N * 2;
const LHS_STRIDE_BYTES: usize = 8 * 32;
const RHS_STRIDE_BYTES: usize = 8 * 16;

/// Structured sparse `64x64 * 64x8` tile product accumulated in half precision.
///
/// The lhs is 2:4 compressed to `64x32` values and staged as two K-major `64x16` sub-tiles
/// with a 32-byte swizzle; the rhs is staged N-major without swizzle. Each sub-tile feeds
/// one `m64n8k32` instruction with its own descriptors and metadata, both accumulating
/// into the same registers inside a single batch.
///
/// Bindings: tensor maps `[lhs, rhs]`, buffers `[metadata, out]`.
#[derive(new, Clone, Copy, Debug, Default)]
pub struct SparseMatmul;

#[derive(Clone, Copy, Debug)]
struct SparseLayout {
    lhs: ScratchRegion,
    rhs: ScratchRegion,
    size: usize,
}

fn layout() -> SparseLayout {
    let mut layout = SharedMemoryLayout::default();
    let lhs = layout.region(K_SUBS * LHS_SUB_TILE_BYTES, SwizzleMode::B32.alignment());
    let rhs = layout.region(K_SUBS * RHS_SUB_TILE_BYTES, SwizzleMode::None.alignment());

    SparseLayout {
        lhs,
        rhs,
        size: layout.size(),
    }
}

impl CubeKernel for SparseMatmul {
    type Block = MmaBlock;

    fn name(&self) -> &'static str {
        "sparse_matmul_m64n8k32x2"
    }

    fn cube_dim(&self) -> CubeDim {
        CubeDim::new_1d(WARPGROUP_SIZE)
    }

    fn shared_memory_size(&self) -> usize {
        layout().size
    }

    fn init_block(
        &self,
        ctx: &BlockContext,
        _resources: &KernelResources,
    ) -> Result<MmaBlock, ExecutionFault> {
        MmaBlock::start(ctx, layout().size)
    }

    fn execute_unit(
        &self,
        unit: UnitPos,
        ctx: &BlockContext,
        block: &MmaBlock,
        resources: &KernelResources,
    ) -> Result<(), ExecutionFault> {
        let layout = layout();
        let lhs = resources.tensor_map(0)?;
        let rhs = resources.tensor_map(1)?;
        let metadata = resources.buffer(0)?;
        let out = resources.buffer(1)?;

        let lhs_tiles = [
            layout.lhs.slice(0, LHS_SUB_TILE_BYTES)?,
            layout.lhs.slice(LHS_SUB_TILE_BYTES, LHS_SUB_TILE_BYTES)?,
        ];

        let staging = block.staging();
        let role = staging.init_barrier(unit, ctx)?;
        staging.load_and_wait(
            role,
            &[
                TileLoad::new(lhs, &[0, 0], lhs_tiles[0]),
                TileLoad::new(lhs, &[0, COMPRESSED_K as i64], lhs_tiles[1]),
                TileLoad::new(rhs, &[0, 0], layout.rhs),
            ],
        )?;

        let acc = Accumulator::zeroed(registers_per_unit(SPARSE_N));
        let mut warpgroup = block.warpgroup().unit(unit)?;
        warpgroup.group_arrive();

        for (k_sub, lhs_tile) in lhs_tiles.iter().enumerate() {
            // Descriptors are rebuilt from the address of each sub-tile.
            let lhs_desc = MatrixDescriptor::build(
                lhs_tile.address(),
                0,
                LHS_STRIDE_BYTES,
                SwizzleMode::B32,
            );
            let rhs_desc = MatrixDescriptor::build(
                layout.rhs.address() + k_sub * RHS_SUB_TILE_BYTES,
                0,
                RHS_STRIDE_BYTES,
                SwizzleMode::None,
            );
            let meta = metadata.read_value::<u32>(metadata_index(k_sub, unit))?;

            warpgroup.mma_sparse(
                &acc,
                Mma::sparse(MmaShape::sparse(SPARSE_N), lhs_desc, rhs_desc, 0).transpose_b(),
                meta,
            )?;
        }

        warpgroup.commit_batch()?;
        warpgroup.wait_batch(0)?;
        warpgroup.fence();

        scatter_result(unit, &acc.read()?, SPARSE_N, out)
    }

    fn finish_block(&self, _ctx: &BlockContext, block: MmaBlock) -> Result<(), ExecutionFault> {
        block.finish()
    }
}

/// Tensor map staging one `64x16` sub-tile of a row-major compressed `64x32` lhs.
pub fn lhs_tensor_map(lhs: &Handle) -> TensorMapBinding {
    TensorMapBinding::new(
        lhs.clone().binding(),
        TensorMapMeta::tiled_contiguous(
            vec![SPARSE_M, K_SUBS * COMPRESSED_K],
            vec![SPARSE_M as u32, COMPRESSED_K as u32],
            TensorMapElem::F16,
        )
        .with_swizzle(TensorMapSwizzle::B32),
    )
}

/// Tensor map staging a row-major `64x8` rhs in one box.
pub fn rhs_tensor_map(rhs: &Handle) -> TensorMapBinding {
    TensorMapBinding::new(
        rhs.clone().binding(),
        TensorMapMeta::tiled_contiguous(
            vec![SPARSE_TOTAL_K, SPARSE_N],
            vec![SPARSE_TOTAL_K as u32, SPARSE_N as u32],
            TensorMapElem::F16,
        ),
    )
}

/// Queue `out = decompress(lhs) * rhs` on `client`.
///
/// `lhs` holds the compressed `64x32` values, `metadata` the `[2][64]` u32 metadata of
/// [compress_2_4], `out` room for `64x8` halves.
pub fn launch_sparse(
    client: &ComputeClient,
    lhs: &Handle,
    metadata: &Handle,
    rhs: &Handle,
    out: &Handle,
) -> Result<(), LaunchError> {
    client.launch(
        SparseMatmul::new(),
        CubeCount::single(),
        Bindings::new()
            .with_tensor_maps(vec![lhs_tensor_map(lhs), rhs_tensor_map(rhs)])
            .with_buffers(vec![metadata.clone().binding(), out.clone().binding()]),
    )
}

/// Upload a compressed operand and a row-major `64x8` rhs, multiply them and read the `64x8`
/// result.
pub fn matmul_sparse_compressed(
    client: &ComputeClient,
    lhs: &CompressedOperand,
    rhs: &[f16],
) -> Result<Vec<f16>, MatmulError> {
    check_len("lhs", &lhs.values, SPARSE_M * SPARSE_TOTAL_K / 2)?;
    check_len("metadata", &lhs.metadata, K_SUBS * SPARSE_M)?;
    check_len("rhs", rhs, SPARSE_TOTAL_K * SPARSE_N)?;

    let values = client.create_from_slice(&lhs.values);
    let metadata = client.create_from_slice(&lhs.metadata);
    let rhs = client.create_from_slice(rhs);
    let out = client.empty(SPARSE_M * SPARSE_N * size_of::<f16>());

    launch_sparse(client, &values, &metadata, &rhs, &out)?;
    let bytes = client.read_one(out.binding())?;

    Ok(halves_from_bytes(&bytes))
}

/// Compress a row-major 2:4 sparse `64x64` lhs, then multiply it by a row-major `64x8` rhs.
pub fn matmul_sparse(
    client: &ComputeClient,
    lhs: &[f16],
    rhs: &[f16],
) -> Result<Vec<f16>, MatmulError> {
    check_len("lhs", lhs, SPARSE_M * SPARSE_TOTAL_K)?;
    let compressed = compress_2_4(lhs, SPARSE_M, SPARSE_TOTAL_K)?;

    matmul_sparse_compressed(client, &compressed, rhs)
}
