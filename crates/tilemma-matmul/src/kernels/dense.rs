use super::{MmaBlock, TileLoad, check_len, halves_from_bytes};
use crate::error::MatmulError;
use half::f16;
use tilemma_core::{
    ExecutionFault, UnitPos, WARPGROUP_SIZE,
    descriptor::MatrixDescriptor,
    fragment::{registers_per_unit, scatter_result},
    shared_memory::{ScratchRegion, SharedMemoryLayout},
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
pub const DENSE_M: usize = 64;
/// Columns of the output tile.
pub const DENSE_N: usize = 16;
/// Reduction extent.
pub const DENSE_K: usize = 16;

const LHS_BYTES: usize = DENSE_M * DENSE_K * 2;
const RHS_BYTES: usize = DENSE_K * DENSE_N * 2;
// Eight 32-byte rows per core matrix group.
const STRIDE_BYTES: usize = 8 * 32;

/// Dense `64x16 * 16x16` tile product accumulated in half precision.
///
/// Bindings: tensor maps `[lhs, rhs]`, buffers `[out]`. Both operands are row-major and staged
/// with a 32-byte swizzle: the lhs K-major, the rhs N-major.
#[derive(new, Clone, Copy, Debug, Default)]
pub struct DenseMatmul;

#[derive(Clone, Copy, Debug)]
struct DenseLayout {
    lhs: ScratchRegion,
    rhs: ScratchRegion,
    size: usize,
}

fn layout() -> DenseLayout {
    let mut layout = SharedMemoryLayout::default();
    let alignment = SwizzleMode::B32.alignment();
    let lhs = layout.region(LHS_BYTES, alignment);
    let rhs = layout.region(RHS_BYTES, alignment);

    DenseLayout {
        lhs,
        rhs,
        size: layout.size(),
    }
}

impl CubeKernel for DenseMatmul {
    type Block = MmaBlock;

    fn name(&self) -> &'static str {
        "dense_matmul_m64n16k16"
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
        let out = resources.buffer(0)?;

        let staging = block.staging();
        let role = staging.init_barrier(unit, ctx)?;
        staging.load_and_wait(
            role,
            &[
                TileLoad::new(lhs, &[0, 0], layout.lhs),
                TileLoad::new(rhs, &[0, 0], layout.rhs),
            ],
        )?;

        let acc = Accumulator::zeroed(registers_per_unit(DENSE_N));
        let mma = Mma::dense(
            MmaShape::dense(DENSE_N),
            MatrixDescriptor::build(layout.lhs.address(), 0, STRIDE_BYTES, SwizzleMode::B32),
            MatrixDescriptor::build(layout.rhs.address(), 0, STRIDE_BYTES, SwizzleMode::B32),
        )
        .transpose_b();

        let mut warpgroup = block.warpgroup().unit(unit)?;
        warpgroup.group_arrive();
        warpgroup.mma(&acc, mma)?;
        warpgroup.commit_batch()?;
        warpgroup.wait_batch(0)?;
        warpgroup.fence();

        scatter_result(unit, &acc.read()?, DENSE_N, out)
    }

    fn finish_block(&self, _ctx: &BlockContext, block: MmaBlock) -> Result<(), ExecutionFault> {
        block.finish()
    }
}

/// Tensor map staging a row-major `64x16` lhs.
pub fn lhs_tensor_map(lhs: &Handle) -> TensorMapBinding {
    TensorMapBinding::new(
        lhs.clone().binding(),
        TensorMapMeta::tiled_contiguous(
            vec![DENSE_M, DENSE_K],
            vec![DENSE_M as u32, DENSE_K as u32],
            TensorMapElem::F16,
        )
        .with_swizzle(TensorMapSwizzle::B32),
    )
}

/// Tensor map staging a row-major `16x16` rhs.
pub fn rhs_tensor_map(rhs: &Handle) -> TensorMapBinding {
    TensorMapBinding::new(
        rhs.clone().binding(),
        TensorMapMeta::tiled_contiguous(
            vec![DENSE_K, DENSE_N],
            vec![DENSE_K as u32, DENSE_N as u32],
            TensorMapElem::F16,
        )
        .with_swizzle(TensorMapSwizzle::B32),
    )
}

/// Queue `out = lhs * rhs` on `client`.
///
/// `out` must hold `64x16` halves. Faults are reported by the next synchronizing call.
pub fn launch_dense(
    client: &ComputeClient,
    lhs: &Handle,
    rhs: &Handle,
    out: &Handle,
) -> Result<(), LaunchError> {
    client.launch(
        DenseMatmul::new(),
        CubeCount::single(),
        Bindings::new()
            .with_tensor_maps(vec![lhs_tensor_map(lhs), rhs_tensor_map(rhs)])
            .with_buffer(out.clone().binding()),
    )
}

/// Upload row-major `64x16` and `16x16` operands, multiply them and read the `64x16` result.
pub fn matmul_dense(
    client: &ComputeClient,
    lhs: &[f16],
    rhs: &[f16],
) -> Result<Vec<f16>, MatmulError> {
    check_len("lhs", lhs, DENSE_M * DENSE_K)?;
    check_len("rhs", rhs, DENSE_K * DENSE_N)?;

    let lhs = client.create_from_slice(lhs);
    let rhs = client.create_from_slice(rhs);
    let out = client.empty(DENSE_M * DENSE_N * size_of::<f16>());

    launch_dense(client, &lhs, &rhs, &out)?;
    let bytes = client.read_one(out.binding())?;

    Ok(halves_from_bytes(&bytes))
}
