use crate::{
    config::simulation::SimulationConfig,
    server::ExecutionFault,
    storage::BytesResource,
    sync::{BlockSignal, CubeBarrier},
    tma::TensorMap,
};
use core::fmt::Display;
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

/// Number of units in a warp.
pub const WARP_SIZE: u32 = 32;

/// Number of units per cube in each dimension.
#[derive(new, Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct CubeDim {
    /// Units in the x dimension.
    pub x: u32,
    /// Units in the y dimension.
    pub y: u32,
    /// Units in the z dimension.
    pub z: u32,
}

impl CubeDim {
    /// Create a one dimensional cube.
    pub const fn new_1d(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }

    /// Total number of units in the cube.
    pub const fn num_elems(&self) -> u32 {
        self.x * self.y * self.z
    }
}

impl Display for CubeDim {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Number of cubes of a launch.
#[derive(new, Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct CubeCount {
    /// Cubes in the x dimension.
    pub x: u32,
    /// Cubes in the y dimension.
    pub y: u32,
    /// Cubes in the z dimension.
    pub z: u32,
}

impl CubeCount {
    /// A launch of exactly one cube.
    pub const fn single() -> Self {
        Self { x: 1, y: 1, z: 1 }
    }

    /// Whether the launch is exactly one cube.
    pub fn is_single(&self) -> bool {
        self.as_tuple() == (1, 1, 1)
    }

    /// The count as a tuple.
    pub fn as_tuple(&self) -> (u32, u32, u32) {
        (self.x, self.y, self.z)
    }
}

/// Position of a unit inside its cube.
#[derive(new, Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnitPos {
    /// Linear index of the unit.
    pub unit: u32,
}

impl UnitPos {
    /// Warp of the unit.
    pub fn warp(&self) -> u32 {
        self.unit / WARP_SIZE
    }

    /// Lane of the unit inside its warp.
    pub fn lane(&self) -> u32 {
        self.unit % WARP_SIZE
    }

    /// Group of four consecutive lanes the unit belongs to.
    pub fn lane_group(&self) -> u32 {
        self.lane() / 4
    }

    /// Position of the unit inside its lane group.
    pub fn lane_in_group(&self) -> u32 {
        self.lane() % 4
    }
}

/// Role of a unit in single-writer operations.
///
/// Leader-only operations take the role explicitly, so the unit issuing copies or
/// initializing a barrier is chosen once instead of by scattered index checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The unit performing issue and bookkeeping on behalf of the block.
    Leader,
    /// Every other unit.
    Follower,
}

impl Role {
    /// `Leader` for the `elected` unit, `Follower` otherwise.
    pub fn elect(unit: UnitPos, elected: u32) -> Self {
        match unit.unit == elected {
            true => Role::Leader,
            false => Role::Follower,
        }
    }

    /// Whether this is the leader role.
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader)
    }
}

/// Global memory visible to a running kernel, resolved from its bindings.
#[derive(Default, Debug)]
pub struct KernelResources {
    /// Plain buffers, in binding order.
    pub buffers: Vec<BytesResource>,
    /// Tile descriptors, in binding order.
    pub tensor_maps: Vec<TensorMap>,
}

impl KernelResources {
    /// Buffer bound at `index`.
    pub fn buffer(&self, index: usize) -> Result<&BytesResource, ExecutionFault> {
        self.buffers.get(index).ok_or_else(|| ExecutionFault::Trap {
            reason: format!("no buffer bound at index {index}"),
        })
    }

    /// Tensor map bound at `index`.
    pub fn tensor_map(&self, index: usize) -> Result<&TensorMap, ExecutionFault> {
        self.tensor_maps.get(index).ok_or_else(|| ExecutionFault::Trap {
            reason: format!("no tensor map bound at index {index}"),
        })
    }
}

/// Block-wide state every unit of a running cube can reach.
#[derive(Debug)]
pub struct BlockContext {
    cube_dim: CubeDim,
    signal: Arc<BlockSignal>,
    barrier: CubeBarrier,
    config: SimulationConfig,
}

impl BlockContext {
    /// Create the context of a block about to run.
    pub fn new(cube_dim: CubeDim, config: SimulationConfig) -> Self {
        Self {
            cube_dim,
            signal: Arc::new(BlockSignal::new(config.deadlock_timeout())),
            barrier: CubeBarrier::new(cube_dim.num_elems() as usize),
            config,
        }
    }

    /// Geometry of the cube.
    pub fn cube_dim(&self) -> CubeDim {
        self.cube_dim
    }

    /// Abort flag and watchdog of the block.
    pub fn signal(&self) -> &Arc<BlockSignal> {
        &self.signal
    }

    /// Simulated device parameters.
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Wait until every unit of the cube reaches this point.
    pub fn sync_units(&self) -> Result<(), ExecutionFault> {
        self.barrier.wait(&self.signal)
    }
}

/// A kernel executed by every unit of a single cube.
pub trait CubeKernel: Send + Sync + 'static {
    /// Block-shared state: scratch memory, barriers, pipelines.
    type Block: Send + Sync;

    /// Name used in logs and errors.
    fn name(&self) -> &'static str {
        core::any::type_name::<Self>()
    }

    /// Geometry of the cube.
    fn cube_dim(&self) -> CubeDim;

    /// Static shared memory used by one cube, in bytes.
    fn shared_memory_size(&self) -> usize;

    /// Build the block-shared state before any unit starts.
    fn init_block(
        &self,
        ctx: &BlockContext,
        resources: &KernelResources,
    ) -> Result<Self::Block, ExecutionFault>;

    /// Body run by every unit.
    fn execute_unit(
        &self,
        unit: UnitPos,
        ctx: &BlockContext,
        block: &Self::Block,
        resources: &KernelResources,
    ) -> Result<(), ExecutionFault>;

    /// Called once every unit returned, to check that no asynchronous work outlives the block.
    fn finish_block(&self, _ctx: &BlockContext, _block: Self::Block) -> Result<(), ExecutionFault> {
        Ok(())
    }
}

/// Type-erased kernel, as queued on the server.
pub trait KernelTask: Send {
    /// Name used in logs and errors.
    fn name(&self) -> &'static str;
    /// Geometry of the cube.
    fn cube_dim(&self) -> CubeDim;
    /// Static shared memory used by one cube, in bytes.
    fn shared_memory_size(&self) -> usize;
    /// Run the kernel to completion.
    fn execute(
        &self,
        config: &SimulationConfig,
        resources: KernelResources,
    ) -> Result<(), ExecutionFault>;
}

impl<K: CubeKernel> KernelTask for K {
    fn name(&self) -> &'static str {
        CubeKernel::name(self)
    }

    fn cube_dim(&self) -> CubeDim {
        CubeKernel::cube_dim(self)
    }

    fn shared_memory_size(&self) -> usize {
        CubeKernel::shared_memory_size(self)
    }

    fn execute(
        &self,
        config: &SimulationConfig,
        resources: KernelResources,
    ) -> Result<(), ExecutionFault> {
        execute_block(self, config, resources)
    }
}

/// Run one cube of `kernel`, one OS thread per unit.
///
/// The first fault aborts the block and is the one returned; units released by the abort
/// report [ExecutionFault::Aborted] and are ignored.
fn execute_block<K: CubeKernel>(
    kernel: &K,
    config: &SimulationConfig,
    resources: KernelResources,
) -> Result<(), ExecutionFault> {
    let ctx = BlockContext::new(CubeKernel::cube_dim(kernel), config.clone());
    let block = kernel.init_block(&ctx, &resources)?;
    let units = ctx.cube_dim.num_elems();

    let results = std::thread::scope(|scope| {
        let handles = (0..units)
            .map(|unit| {
                let (ctx, block, resources) = (&ctx, &block, &resources);

                std::thread::Builder::new()
                    .name(format!("{}-unit-{unit}", CubeKernel::name(kernel)))
                    .spawn_scoped(scope, move || {
                        let result = catch_unwind(AssertUnwindSafe(|| {
                            kernel.execute_unit(UnitPos::new(unit), ctx, block, resources)
                        }))
                        .unwrap_or_else(|payload| {
                            Err(ExecutionFault::Trap {
                                reason: panic_message(payload.as_ref()),
                            })
                        });

                        if let Err(fault) = &result {
                            ctx.signal.fail(fault.clone());
                        }

                        result
                    })
                    .inspect_err(|err| {
                        ctx.signal.fail(ExecutionFault::Trap {
                            reason: format!("unable to spawn unit: {err}"),
                        })
                    })
            })
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .map(|handle| match handle {
                Ok(handle) => handle.join().unwrap_or_else(|payload| {
                    Err(ExecutionFault::Trap {
                        reason: panic_message(payload.as_ref()),
                    })
                }),
                Err(err) => Err(ExecutionFault::Trap {
                    reason: format!("unable to spawn unit: {err}"),
                }),
            })
            .collect::<Vec<_>>()
    });

    let finished = match results.iter().all(Result::is_ok) {
        true => kernel.finish_block(&ctx, block),
        false => {
            drop(block);
            Err(ExecutionFault::Aborted)
        }
    };

    // Faults raised by units and by the block's own workers are recorded on the signal.
    match ctx.signal.fault() {
        Some(fault) => Err(fault),
        None => finished,
    }
}

fn panic_message(payload: &(dyn core::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn unit_position_decomposition() {
        let unit = UnitPos::new(77);

        assert_eq!(unit.warp(), 2);
        assert_eq!(unit.lane(), 13);
        assert_eq!(unit.lane_group(), 3);
        assert_eq!(unit.lane_in_group(), 1);
    }

    #[test]
    fn only_the_elected_unit_leads() {
        let leaders = (0..128)
            .map(UnitPos::new)
            .filter(|unit| Role::elect(*unit, 0).is_leader())
            .count();

        assert_eq!(leaders, 1);
        assert_eq!(Role::elect(UnitPos::new(5), 5), Role::Leader);
    }

    struct CountingKernel {
        fault_on: Option<u32>,
    }

    impl CubeKernel for CountingKernel {
        type Block = AtomicU32;

        fn cube_dim(&self) -> CubeDim {
            CubeDim::new_1d(64)
        }

        fn shared_memory_size(&self) -> usize {
            0
        }

        fn init_block(
            &self,
            _ctx: &BlockContext,
            _resources: &KernelResources,
        ) -> Result<Self::Block, ExecutionFault> {
            Ok(AtomicU32::new(0))
        }

        fn execute_unit(
            &self,
            unit: UnitPos,
            ctx: &BlockContext,
            block: &Self::Block,
            _resources: &KernelResources,
        ) -> Result<(), ExecutionFault> {
            if self.fault_on == Some(unit.unit) {
                return Err(ExecutionFault::protocol("injected"));
            }
            block.fetch_add(1, Ordering::SeqCst);
            ctx.sync_units()
        }

        fn finish_block(&self, _ctx: &BlockContext, block: Self::Block) -> Result<(), ExecutionFault> {
            assert_eq!(block.into_inner(), 64);
            Ok(())
        }
    }

    #[test]
    fn all_units_run_and_finish() {
        let kernel = CountingKernel { fault_on: None };
        let result = execute_block(&kernel, &SimulationConfig::default(), KernelResources::default());

        assert_eq!(result, Ok(()));
    }

    #[test]
    fn first_real_fault_wins_over_aborts() {
        let kernel = CountingKernel { fault_on: Some(40) };
        let result = execute_block(&kernel, &SimulationConfig::default(), KernelResources::default());

        assert_eq!(result, Err(ExecutionFault::protocol("injected")));
    }
}
