use crate::error::VerificationError;
use half::f16;

/// Solves `out = lhs * rhs` for row-major `m x k` and `k x n` operands in f32.
///
/// This is a naive CPU implementation, very slow on large payloads, not designed to be used
/// for other purposes than testing.
pub fn matmul_cpu_reference(lhs: &[f32], rhs: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
    let mut out = vec![0.; m * n];

    for i in 0..m {
        for j in 0..n {
            for k_ in 0..k {
                out[i * n + j] += lhs[i * k + k_] * rhs[k_ * n + j];
            }
        }
    }

    out
}

/// Solves `out = lhs * rhs` with half precision products accumulated sequentially along K in
/// half precision, the arithmetic of the tensor core.
pub fn matmul_half_reference(lhs: &[f16], rhs: &[f16], m: usize, n: usize, k: usize) -> Vec<f16> {
    let mut out = vec![f16::ZERO; m * n];

    for i in 0..m {
        for j in 0..n {
            let mut acc = f16::ZERO;
            for k_ in 0..k {
                acc = acc + lhs[i * k + k_] * rhs[k_ * n + j];
            }
            out[i * n + j] = acc;
        }
    }

    out
}

/// Compares `actual` to `expected` element by element.
pub fn assert_equals_approx(
    actual: &[f16],
    expected: &[f32],
    epsilon: f32,
) -> Result<(), VerificationError> {
    if actual.len() != expected.len() {
        return Err(VerificationError::LengthMismatch {
            expected: expected.len(),
            actual: actual.len(),
        });
    }

    for (index, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        let a = a.to_f32();
        let difference = (a - e).abs();
        if difference.is_nan() || difference >= epsilon {
            return Err(VerificationError::NumericalMismatch {
                index,
                actual: a,
                expected: *e,
                epsilon,
            });
        }
    }

    Ok(())
}
