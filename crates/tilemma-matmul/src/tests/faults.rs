use super::test_utils::{client, operands};
use crate::{
    MatmulError, SparsityError,
    kernels::{
        MmaBlock,
        dense::{DENSE_K, DENSE_M, DENSE_N},
        sparse::{SPARSE_M, SPARSE_N, SPARSE_TOTAL_K},
    },
    launch_dense, launch_sparse, matmul_dense, matmul_sparse,
    sparse::{compress_2_4, prune_2_4},
};
use half::f16;
use tilemma_core::{
    ExecutionFault, UnitPos, WARPGROUP_SIZE,
    descriptor::MatrixDescriptor,
    swizzle::SwizzleMode,
    warpgroup::{Accumulator, Mma, MmaShape},
};
use tilemma_runtime::{
    client::ComputeClient,
    config::simulation::SimulationConfig,
    kernel::{BlockContext, CubeCount, CubeDim, CubeKernel, KernelResources},
    server::{Bindings, LaunchError, MemorySpace, ResourceLimitError},
    tma::TensorMapError,
};

/// Issues a dense MMA whose lhs descriptor starts 16 bytes past a swizzle boundary.
struct MisalignedDescriptor;

impl CubeKernel for MisalignedDescriptor {
    type Block = MmaBlock;

    fn cube_dim(&self) -> CubeDim {
        CubeDim::new_1d(WARPGROUP_SIZE)
    }

    fn shared_memory_size(&self) -> usize {
        4096
    }

    fn init_block(
        &self,
        ctx: &BlockContext,
        _resources: &KernelResources,
    ) -> Result<MmaBlock, ExecutionFault> {
        MmaBlock::start(ctx, 4096)
    }

    fn execute_unit(
        &self,
        unit: UnitPos,
        _ctx: &BlockContext,
        block: &MmaBlock,
        _resources: &KernelResources,
    ) -> Result<(), ExecutionFault> {
        let acc = Accumulator::zeroed(4);
        let mma = Mma::dense(
            MmaShape::dense(16),
            MatrixDescriptor::build(16, 0, 256, SwizzleMode::B32),
            MatrixDescriptor::build(2048, 0, 256, SwizzleMode::B32),
        )
        .transpose_b();

        let mut warpgroup = block.warpgroup().unit(unit)?;
        warpgroup.group_arrive();
        warpgroup.mma(&acc, mma)?;
        warpgroup.commit_batch()?;
        warpgroup.wait_batch(0)?;
        warpgroup.fence();
        acc.read().map(|_| ())
    }

    fn finish_block(&self, _ctx: &BlockContext, block: MmaBlock) -> Result<(), ExecutionFault> {
        block.finish()
    }
}

#[test_log::test]
fn misaligned_descriptor_is_reported_on_sync() {
    let client = client();

    client
        .launch(MisalignedDescriptor, CubeCount::single(), Bindings::new())
        .unwrap();

    let err = client.sync().unwrap_err();
    assert_eq!(
        err.fault(),
        Some(&ExecutionFault::MisalignedAddress {
            what: "matrix descriptor start address",
            address: 16,
            alignment: 128,
        })
    );
    // Faults are drained by the synchronization that reported them.
    client.sync().unwrap();
}

#[test]
fn undersized_output_is_an_illegal_global_access() {
    let client = client();
    let (lhs, rhs) = operands(DENSE_M * DENSE_K, DENSE_K * DENSE_N);
    let lhs = client.create_from_slice(&lhs);
    let rhs = client.create_from_slice(&rhs);
    let out = client.empty(64);

    launch_dense(&client, &lhs, &rhs, &out).unwrap();

    let err = client.read_one(out.binding()).unwrap_err();
    assert!(matches!(
        err.fault(),
        Some(ExecutionFault::IllegalAddress {
            space: MemorySpace::Global,
            ..
        })
    ));
}

#[test]
fn malformed_metadata_is_a_protocol_violation() {
    let client = client();
    let (mut lhs, rhs) = operands(SPARSE_M * SPARSE_TOTAL_K, SPARSE_TOTAL_K * SPARSE_N);
    prune_2_4(&mut lhs);
    let compressed = compress_2_4(&lhs, SPARSE_M, SPARSE_TOTAL_K).unwrap();

    let values = client.create_from_slice(&compressed.values);
    // Every group selects element 0 twice.
    let metadata = client.create_from_slice(&vec![0u32; compressed.metadata.len()]);
    let rhs = client.create_from_slice(&rhs);
    let out = client.empty(SPARSE_M * SPARSE_N * 2);

    launch_sparse(&client, &values, &metadata, &rhs, &out).unwrap();

    let err = client.sync().unwrap_err();
    assert!(matches!(
        err.fault(),
        Some(ExecutionFault::ProtocolViolation { .. })
    ));
}

#[test]
fn oversized_shared_memory_is_rejected_at_launch() {
    let client = ComputeClient::simulated(SimulationConfig {
        max_shared_memory: 1024,
        ..Default::default()
    });
    let (lhs, rhs) = operands(DENSE_M * DENSE_K, DENSE_K * DENSE_N);

    let err = matmul_dense(&client, &lhs, &rhs).unwrap_err();

    assert!(matches!(
        err,
        MatmulError::Launch(LaunchError::TooManyResources(
            ResourceLimitError::SharedMemory {
                requested: 2560,
                max: 1024,
                ..
            }
        ))
    ));
}

#[test]
fn too_few_units_are_rejected_at_launch() {
    let client = ComputeClient::simulated(SimulationConfig {
        max_units_per_cube: 64,
        ..Default::default()
    });
    let (lhs, rhs) = operands(SPARSE_M * SPARSE_TOTAL_K, SPARSE_TOTAL_K * SPARSE_N);
    let lhs = lhs
        .iter()
        .enumerate()
        .map(|(index, value)| match index % 2 {
            0 => *value,
            _ => f16::ZERO,
        })
        .collect::<Vec<_>>();

    let err = matmul_sparse(&client, &lhs, &rhs).unwrap_err();

    assert!(matches!(
        err,
        MatmulError::Launch(LaunchError::TooManyResources(ResourceLimitError::Units {
            requested: 128,
            max: 64,
            ..
        }))
    ));
}

#[test]
fn tensor_map_past_its_buffer_is_rejected_at_launch() {
    let client = client();
    let lhs = client.empty(16);
    let rhs = client.empty(DENSE_K * DENSE_N * 2);
    let out = client.empty(DENSE_M * DENSE_N * 2);

    let err = launch_dense(&client, &lhs, &rhs, &out).unwrap_err();

    assert!(matches!(
        err,
        LaunchError::InvalidTensorMap {
            index: 0,
            source: TensorMapError::ExceedsBuffer {
                required: 2048,
                available: 16
            }
        }
    ));
}

#[test]
fn host_inputs_are_checked_before_upload() {
    let client = client();
    let (lhs, rhs) = operands(DENSE_M * DENSE_K, DENSE_K * DENSE_N);

    assert!(matches!(
        matmul_dense(&client, &lhs[1..], &rhs),
        Err(MatmulError::InvalidOperand {
            operand: "lhs",
            expected: 1024,
            actual: 1023
        })
    ));

    let dense = vec![f16::ONE; SPARSE_M * SPARSE_TOTAL_K];
    let rhs = vec![f16::ONE; SPARSE_TOTAL_K * SPARSE_N];
    assert!(matches!(
        matmul_sparse(&client, &dense, &rhs),
        Err(MatmulError::Sparsity(SparsityError::TooDense {
            row: 0,
            group: 0,
            nonzeros: 4
        }))
    ));
}
