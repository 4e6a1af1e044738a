/// Dense m64n16k16 matmul.
pub mod dense;
/// 2:4 sparse m64n8k32 matmul covering K = 64.
pub mod sparse;
/// Copy-only tile round trip.
pub mod tile_copy;

use crate::error::MatmulError;
use std::sync::Arc;
use tilemma_core::{
    ExecutionFault, Role, UnitPos, barrier::Barrier, shared_memory::SharedMemory,
    shared_memory::ScratchRegion, tma::CopyEngine, warpgroup::Warpgroup,
};
use tilemma_runtime::{kernel::BlockContext, tma::TensorMap};

/// Unit issuing every copy and initializing the barrier.
pub const LEADER: u32 = 0;

/// One box staged into shared memory.
#[derive(new, Clone, Copy, Debug)]
pub struct TileLoad<'a> {
    map: &'a TensorMap,
    coords: &'a [i64],
    region: ScratchRegion,
}

/// Block-shared state of a kernel staging tiles through the copy engine.
pub struct StagingBlock {
    smem: Arc<SharedMemory>,
    barrier: Arc<Barrier>,
    tma: CopyEngine,
}

impl StagingBlock {
    /// Allocate `size` bytes of shared memory and start the copy engine.
    pub fn start(ctx: &BlockContext, size: usize) -> Result<Self, ExecutionFault> {
        let smem = Arc::new(SharedMemory::new(size));
        let tma = CopyEngine::start(ctx, smem.clone())?;

        Ok(Self {
            smem,
            barrier: Arc::new(Barrier::new(ctx.signal().clone())),
            tma,
        })
    }

    /// Shared memory of the block.
    pub fn smem(&self) -> &Arc<SharedMemory> {
        &self.smem
    }

    /// Copy engine of the block.
    pub fn tma(&self) -> &CopyEngine {
        &self.tma
    }

    /// Elect the role of `unit`, have the leader initialize the barrier for every unit of the
    /// cube and synchronize the cube past the initialization.
    pub fn init_barrier(&self, unit: UnitPos, ctx: &BlockContext) -> Result<Role, ExecutionFault> {
        let role = Role::elect(unit, LEADER);

        if role.is_leader() {
            self.barrier.init(role, ctx.cube_dim().num_elems())?;
        }
        ctx.sync_units()?;

        Ok(role)
    }

    /// Stage every box of `loads` in a single barrier phase, then wait for the phase.
    ///
    /// The leader issues the copies and declares their summed bytes when it arrives; the
    /// other units only arrive.
    pub fn load_and_wait(&self, role: Role, loads: &[TileLoad<'_>]) -> Result<(), ExecutionFault> {
        let token = match role {
            Role::Leader => {
                let mut bytes = 0;
                for load in loads {
                    self.tma
                        .copy_in(role, load.map, load.coords, &load.region, &self.barrier)?;
                    bytes += load.map.meta().box_bytes();
                }
                log::trace!("Staging {} tiles, {bytes} bytes", loads.len());
                self.barrier.arrive_with_transaction(bytes as u32)?
            }
            Role::Follower => self.barrier.arrive()?,
        };

        self.barrier.wait(token)
    }

    /// Check that no bulk store outlives the block.
    pub fn finish(&self) -> Result<(), ExecutionFault> {
        self.tma.finish()
    }
}

/// Block-shared state of a kernel feeding staged tiles to the tensor core.
pub struct MmaBlock {
    staging: StagingBlock,
    warpgroup: Warpgroup,
}

impl MmaBlock {
    /// Allocate `size` bytes of shared memory, start the copy engine and the tensor core.
    pub fn start(ctx: &BlockContext, size: usize) -> Result<Self, ExecutionFault> {
        let staging = StagingBlock::start(ctx, size)?;
        let warpgroup = Warpgroup::start(ctx, staging.smem.clone())?;

        Ok(Self { staging, warpgroup })
    }

    /// Staging half of the block.
    pub fn staging(&self) -> &StagingBlock {
        &self.staging
    }

    /// Tensor core of the block.
    pub fn warpgroup(&self) -> &Warpgroup {
        &self.warpgroup
    }

    /// Check that neither copies nor MMA batches outlive the block.
    pub fn finish(&self) -> Result<(), ExecutionFault> {
        self.staging.finish()?;
        self.warpgroup.finish()
    }
}

/// Decode a row-major half precision output read back from global memory.
pub(crate) fn halves_from_bytes(bytes: &[u8]) -> Vec<half::f16> {
    bytemuck::pod_collect_to_vec(bytes)
}

pub(crate) fn check_len<T>(
    operand: &'static str,
    values: &[T],
    expected: usize,
) -> Result<(), MatmulError> {
    match values.len() == expected {
        true => Ok(()),
        false => Err(MatmulError::InvalidOperand {
            operand,
            expected,
            actual: values.len(),
        }),
    }
}
