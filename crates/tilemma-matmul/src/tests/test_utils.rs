use half::f16;
use tilemma_runtime::{client::ComputeClient, config::simulation::SimulationConfig};

/// Client over a fresh simulated device with default parameters.
pub(crate) fn client() -> ComputeClient {
    ComputeClient::simulated(SimulationConfig::default())
}

pub(crate) fn to_f32(values: &[f16]) -> Vec<f32> {
    values.iter().map(|value| value.to_f32()).collect()
}

/// Two different operands from the same deterministic sequence.
pub(crate) fn operands(lhs_len: usize, rhs_len: usize) -> (Vec<f16>, Vec<f16>) {
    (
        tilemma_common::rand::half_sequence(1234, lhs_len),
        tilemma_common::rand::half_sequence(5678, rhs_len),
    )
}
