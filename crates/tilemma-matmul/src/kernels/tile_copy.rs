use super::{StagingBlock, TileLoad};
use crate::error::MatmulError;
use tilemma_core::{
    ExecutionFault, Role, UnitPos, WARPGROUP_SIZE,
    shared_memory::{ScratchRegion, SharedMemoryLayout},
    swizzle::SwizzleMode,
};
use tilemma_runtime::{
    client::ComputeClient,
    kernel::{BlockContext, CubeCount, CubeDim, CubeKernel, KernelResources},
    server::{Bindings, LaunchError},
    storage::Handle,
    tma::{TensorMapBinding, TensorMapElem, TensorMapMeta},
};

/// Elements of one tile.
pub const TILE_ELEMS: usize = 16;

fn region() -> (ScratchRegion, usize) {
    let mut layout = SharedMemoryLayout::default();
    let region = layout.region(
        TILE_ELEMS * size_of::<f32>(),
        SwizzleMode::None.alignment(),
    );
    (region, layout.size())
}

/// Loads the f32 tile starting at `offset`, adds one to every element and stores it back.
///
/// Bindings: tensor maps `[data]`.
#[derive(new, Clone, Copy, Debug)]
pub struct TileCopy {
    offset: usize,
}

impl CubeKernel for TileCopy {
    type Block = StagingBlock;

    fn name(&self) -> &'static str {
        "tile_copy"
    }

    fn cube_dim(&self) -> CubeDim {
        CubeDim::new_1d(WARPGROUP_SIZE)
    }

    fn shared_memory_size(&self) -> usize {
        region().1
    }

    fn init_block(
        &self,
        ctx: &BlockContext,
        _resources: &KernelResources,
    ) -> Result<StagingBlock, ExecutionFault> {
        StagingBlock::start(ctx, region().1)
    }

    fn execute_unit(
        &self,
        unit: UnitPos,
        ctx: &BlockContext,
        block: &StagingBlock,
        resources: &KernelResources,
    ) -> Result<(), ExecutionFault> {
        let (region, _) = region();
        let data = resources.tensor_map(0)?;
        let coords = [self.offset as i64];

        let role = block.init_barrier(unit, ctx)?;
        block.load_and_wait(role, &[TileLoad::new(data, &coords, region)])?;

        let index = unit.unit as usize;
        if index < TILE_ELEMS {
            let value = block.smem().read_value::<f32>(&region, index)?;
            block.smem().write_value(unit, &region, index, value + 1.0)?;
            block.tma().fence_proxy_async(unit);
        }
        ctx.sync_units()?;

        if let Role::Leader = role {
            block.tma().copy_out(role, data, &coords, &region)?;
            block.tma().commit_group(role)?;
            block.tma().wait_group_read(role, 0)?;
        }

        Ok(())
    }

    fn finish_block(&self, _ctx: &BlockContext, block: StagingBlock) -> Result<(), ExecutionFault> {
        block.finish()
    }
}

/// Tensor map over a contiguous f32 array tiled in [TILE_ELEMS] element boxes.
pub fn tensor_map(data: &Handle, len: usize) -> TensorMapBinding {
    TensorMapBinding::new(
        data.clone().binding(),
        TensorMapMeta::tiled_contiguous(vec![len], vec![TILE_ELEMS as u32], TensorMapElem::F32),
    )
}

/// Queue the tile round trip at `offset` over the `len` f32 elements of `data`.
pub fn launch_tile_copy(
    client: &ComputeClient,
    data: &Handle,
    len: usize,
    offset: usize,
) -> Result<(), LaunchError> {
    client.launch(
        TileCopy::new(offset),
        CubeCount::single(),
        Bindings::new().with_tensor_maps(vec![tensor_map(data, len)]),
    )
}

/// Upload `values`, add one to the tile at `offset` through shared memory and read the
/// array back.
pub fn increment_tile(
    client: &ComputeClient,
    values: &[f32],
    offset: usize,
) -> Result<Vec<f32>, MatmulError> {
    let data = client.create_from_slice(values);

    launch_tile_copy(client, &data, values.len(), offset)?;
    let bytes = client.read_one(data.binding())?;

    Ok(bytemuck::pod_collect_to_vec(&bytes))
}
