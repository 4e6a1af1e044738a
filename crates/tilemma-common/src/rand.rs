pub use rand::{Rng, SeedableRng, rngs::StdRng};

use half::f16;

/// Returns a random number generator seeded with the given value.
#[inline(always)]
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Generates `num_elements` values in `[-1, 1)` from a linear congruential generator.
///
/// This is a naive generator with a fixed recurrence, only meant to produce the same
/// operands on every run and every platform.
pub fn lcg_sequence(seed: u64, num_elements: usize) -> Vec<f32> {
    fn lcg(state: &mut u64) -> f32 {
        const A: u64 = 1664525;
        const C: u64 = 1013904223;
        const M: f64 = (1u64 << 32) as f64;

        *state = (A.wrapping_mul(*state).wrapping_add(C)) % (1u64 << 32);
        (*state as f64 / M * 2.0 - 1.0) as f32
    }

    let mut state = seed;

    (0..num_elements).map(|_| lcg(&mut state)).collect()
}

/// Same sequence as [lcg_sequence], rounded to half precision.
pub fn half_sequence(seed: u64, num_elements: usize) -> Vec<f16> {
    lcg_sequence(seed, num_elements)
        .into_iter()
        .map(f16::from_f32)
        .collect()
}

/// Random half precision values in `[-1, 1)` drawn from a seeded [StdRng].
pub fn random_halves(rng: &mut StdRng, num_elements: usize) -> Vec<f16> {
    (0..num_elements)
        .map(|_| f16::from_f32(rng.random_range(-1.0f32..1.0)))
        .collect()
}
