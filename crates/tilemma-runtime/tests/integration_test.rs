use core::time::Duration;
use tilemma_runtime::{
    client::ComputeClient,
    config::simulation::SimulationConfig,
    kernel::{BlockContext, CubeCount, CubeDim, CubeKernel, KernelResources, UnitPos},
    server::{Bindings, ExecutionFault, LaunchError, MemorySpace, ResourceLimitError},
    tma::{TensorMapBinding, TensorMapElem, TensorMapError, TensorMapMeta},
};

/// Adds two byte buffers, one unit per element.
struct ElementwiseAddition {
    units: u32,
    shared_memory: usize,
}

impl ElementwiseAddition {
    fn new(units: u32) -> Self {
        Self {
            units,
            shared_memory: 0,
        }
    }
}

impl CubeKernel for ElementwiseAddition {
    type Block = ();

    fn name(&self) -> &'static str {
        "elementwise_addition"
    }

    fn cube_dim(&self) -> CubeDim {
        CubeDim::new_1d(self.units)
    }

    fn shared_memory_size(&self) -> usize {
        self.shared_memory
    }

    fn init_block(
        &self,
        _ctx: &BlockContext,
        _resources: &KernelResources,
    ) -> Result<Self::Block, ExecutionFault> {
        Ok(())
    }

    fn execute_unit(
        &self,
        unit: UnitPos,
        _ctx: &BlockContext,
        _block: &Self::Block,
        resources: &KernelResources,
    ) -> Result<(), ExecutionFault> {
        let index = unit.unit as usize;
        let lhs = resources.buffer(0)?.read_value::<u8>(index)?;
        let rhs = resources.buffer(1)?.read_value::<u8>(index)?;
        resources.buffer(2)?.write_value(index, lhs + rhs)
    }
}

/// Unit zero waits for a block synchronization nobody else reaches.
struct StrandedUnit;

impl CubeKernel for StrandedUnit {
    type Block = ();

    fn cube_dim(&self) -> CubeDim {
        CubeDim::new_1d(4)
    }

    fn shared_memory_size(&self) -> usize {
        0
    }

    fn init_block(
        &self,
        _ctx: &BlockContext,
        _resources: &KernelResources,
    ) -> Result<Self::Block, ExecutionFault> {
        Ok(())
    }

    fn execute_unit(
        &self,
        unit: UnitPos,
        ctx: &BlockContext,
        _block: &Self::Block,
        _resources: &KernelResources,
    ) -> Result<(), ExecutionFault> {
        match unit.unit {
            0 => ctx.sync_units(),
            _ => Ok(()),
        }
    }
}

fn client() -> ComputeClient {
    ComputeClient::simulated(SimulationConfig::default())
}

#[test_log::test]
fn created_resource_is_the_same_when_read() {
    let client = client();
    let resource = Vec::from([0u8, 1, 2]);
    let handle = client.create(&resource);

    let obtained = client.read_one(handle.binding()).unwrap();

    assert_eq!(resource, obtained)
}

#[test_log::test]
fn empty_allocates_memory() {
    let client = client();
    let handle = client.empty(4);

    assert_eq!(client.read_one(handle.binding()).unwrap(), vec![0; 4]);
}

#[test_log::test]
fn execute_elementwise_addition() {
    let client = client();
    let lhs = client.create(&[0, 1, 2]);
    let rhs = client.create(&[4, 4, 4]);
    let out = client.empty(3);

    client
        .launch(
            ElementwiseAddition::new(3),
            CubeCount::single(),
            Bindings::new().with_buffers(vec![
                lhs.binding(),
                rhs.binding(),
                out.clone().binding(),
            ]),
        )
        .unwrap();

    assert_eq!(client.read_one(out.binding()).unwrap(), vec![4, 5, 6]);
}

#[test_log::test]
fn out_of_bounds_write_is_reported_on_next_sync() {
    let client = client();
    let lhs = client.create(&[0, 1, 2, 3]);
    let rhs = client.create(&[1, 1, 1, 1]);
    let out = client.empty(3);

    client
        .launch(
            ElementwiseAddition::new(4),
            CubeCount::single(),
            Bindings::new().with_buffers(vec![lhs.binding(), rhs.binding(), out.binding()]),
        )
        .expect("The launch itself is valid");

    let err = client.sync().unwrap_err();
    assert_eq!(
        err.fault(),
        Some(&ExecutionFault::IllegalAddress {
            space: MemorySpace::Global,
            offset: 3,
            size: 1,
            bound: 3,
        })
    );

    // The fault is drained once reported.
    client.sync().unwrap();
}

#[test_log::test]
fn launch_limits_are_checked_synchronously() {
    let client = client();
    let max_units = client.properties().max_units_per_cube;

    let err = client
        .launch(
            ElementwiseAddition::new(max_units + 1),
            CubeCount::single(),
            Bindings::new(),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        LaunchError::TooManyResources(ResourceLimitError::Units { .. })
    ));

    let mut kernel = ElementwiseAddition::new(1);
    kernel.shared_memory = client.properties().max_shared_memory + 1;
    let err = client
        .launch(kernel, CubeCount::single(), Bindings::new())
        .unwrap_err();
    assert!(matches!(
        err,
        LaunchError::TooManyResources(ResourceLimitError::SharedMemory { .. })
    ));

    let err = client
        .launch(
            ElementwiseAddition::new(1),
            CubeCount::new(2, 1, 1),
            Bindings::new(),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        LaunchError::TooManyResources(ResourceLimitError::CubeCount { .. })
    ));

    client.sync().unwrap();
}

#[test_log::test]
fn invalid_tensor_map_is_a_launch_error() {
    let client = client();
    let handle = client.empty(64 * 16 * 2);
    let map = TensorMapMeta::tiled_contiguous(vec![64, 16], vec![64, 4], TensorMapElem::F16);

    let err = client
        .launch(
            ElementwiseAddition::new(1),
            CubeCount::single(),
            Bindings::new().with_tensor_maps(vec![TensorMapBinding::new(handle.binding(), map)]),
        )
        .unwrap_err();

    match err {
        LaunchError::InvalidTensorMap { index, source } => {
            assert_eq!(index, 0);
            assert_eq!(source, TensorMapError::InnerBoxNotAligned { bytes: 8 });
        }
        err => panic!("Unexpected error {err}"),
    }
}

#[test_log::test]
fn stranded_unit_is_reported_as_deadlock() {
    let client = ComputeClient::simulated(
        SimulationConfig::default().with_deadlock_timeout(Duration::from_millis(100)),
    );

    client
        .launch(StrandedUnit, CubeCount::single(), Bindings::new())
        .unwrap();

    let err = client.sync().unwrap_err();
    assert!(matches!(
        err.fault(),
        Some(ExecutionFault::Deadlock {
            waiting_on: "sync_units",
            timeout_ms: 100,
        })
    ));
}
