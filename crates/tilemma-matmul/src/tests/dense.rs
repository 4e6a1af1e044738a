use super::test_utils::{client, operands, to_f32};
use crate::{
    kernels::{
        dense::{DENSE_K, DENSE_M, DENSE_N, DenseMatmul, lhs_tensor_map, rhs_tensor_map},
        halves_from_bytes,
    },
    launch_dense, matmul_dense,
    verification::{assert_equals_approx, matmul_cpu_reference, matmul_half_reference},
};
use core::time::Duration;
use half::f16;
use pretty_assertions::assert_eq;
use tilemma_runtime::{
    client::ComputeClient,
    config::simulation::SimulationConfig,
    kernel::CubeCount,
    server::Bindings,
    tma::{TensorMapBinding, TensorMapElem, TensorMapMeta},
};

#[test_log::test]
fn dense_matches_sequential_half_accumulation() {
    let client = client();
    let (lhs, rhs) = operands(DENSE_M * DENSE_K, DENSE_K * DENSE_N);

    let out = matmul_dense(&client, &lhs, &rhs).unwrap();

    let expected = matmul_half_reference(&lhs, &rhs, DENSE_M, DENSE_N, DENSE_K);
    assert_eq!(out, expected);
}

#[test]
fn dense_is_within_half_rounding_of_the_full_precision_product() {
    let client = client();
    let (lhs, rhs) = operands(DENSE_M * DENSE_K, DENSE_K * DENSE_N);

    let out = matmul_dense(&client, &lhs, &rhs).unwrap();

    let expected = matmul_cpu_reference(&to_f32(&lhs), &to_f32(&rhs), DENSE_M, DENSE_N, DENSE_K);
    assert_equals_approx(&out, &expected, 0.05).unwrap();
}

#[test]
fn identity_rhs_returns_the_lhs() {
    let client = client();
    let (lhs, _) = operands(DENSE_M * DENSE_K, 0);
    let identity = (0..DENSE_K * DENSE_N)
        .map(|index| match index / DENSE_N == index % DENSE_N {
            true => f16::ONE,
            false => f16::ZERO,
        })
        .collect::<Vec<_>>();

    let out = matmul_dense(&client, &lhs, &identity).unwrap();

    assert_eq!(out, lhs);
}

#[test]
fn running_twice_is_bit_identical() {
    let client = client();
    let (lhs, rhs) = operands(DENSE_M * DENSE_K, DENSE_K * DENSE_N);
    let lhs = client.create_from_slice(&lhs);
    let rhs = client.create_from_slice(&rhs);
    let first = client.empty(DENSE_M * DENSE_N * 2);
    let second = client.empty(DENSE_M * DENSE_N * 2);

    launch_dense(&client, &lhs, &rhs, &first).unwrap();
    launch_dense(&client, &lhs, &rhs, &second).unwrap();

    let outputs = client.read(vec![first.binding(), second.binding()]).unwrap();
    assert_eq!(outputs[0], outputs[1]);
}

#[test_log::test]
fn waiters_are_held_until_delayed_copies_land() {
    let client = ComputeClient::simulated(
        SimulationConfig::default().with_copy_latency(Duration::from_millis(20)),
    );
    let (lhs, rhs) = operands(DENSE_M * DENSE_K, DENSE_K * DENSE_N);

    let out = matmul_dense(&client, &lhs, &rhs).unwrap();

    assert_eq!(out, matmul_half_reference(&lhs, &rhs, DENSE_M, DENSE_N, DENSE_K));
}

#[test]
fn swizzle_mismatch_corrupts_silently() {
    let client = client();
    let (lhs, rhs) = operands(DENSE_M * DENSE_K, DENSE_K * DENSE_N);
    let lhs_handle = client.create_from_slice(&lhs);
    let rhs_handle = client.create_from_slice(&rhs);
    let out = client.empty(DENSE_M * DENSE_N * 2);

    // Same box without swizzle, while the kernel's descriptor still expects 32B.
    let unswizzled = TensorMapBinding::new(
        lhs_handle.clone().binding(),
        TensorMapMeta::tiled_contiguous(
            vec![DENSE_M, DENSE_K],
            vec![DENSE_M as u32, DENSE_K as u32],
            TensorMapElem::F16,
        ),
    );
    assert_eq!(unswizzled.map.box_bytes(), lhs_tensor_map(&lhs_handle).map.box_bytes());

    client
        .launch(
            DenseMatmul::new(),
            CubeCount::single(),
            Bindings::new()
                .with_tensor_maps(vec![unswizzled, rhs_tensor_map(&rhs_handle)])
                .with_buffer(out.clone().binding()),
        )
        .unwrap();

    let out = halves_from_bytes(&client.read_one(out.binding()).unwrap());
    let expected = matmul_cpu_reference(&to_f32(&lhs), &to_f32(&rhs), DENSE_M, DENSE_N, DENSE_K);

    assert!(assert_equals_approx(&out, &expected, 0.05).is_err());
    // Rows 0..4 don't cross a swizzled chunk boundary.
    assert_equals_approx(&out[..4 * DENSE_N], &expected[..4 * DENSE_N], 0.05).unwrap();
}

#[test]
fn read_back_decodes_unaligned_bytes() {
    let values = [f16::from_f32(1.5), f16::from_f32(-2.0), f16::MAX];
    let mut bytes = vec![0u8];
    bytes.extend(values.iter().flat_map(|value| value.to_le_bytes()));

    assert_eq!(halves_from_bytes(&bytes[1..]), values.to_vec());
}
