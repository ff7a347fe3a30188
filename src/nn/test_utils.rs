//! Test utilities for gradient checking.

use ndarray::ArrayD;

/// Finite difference gradient checker.
///
/// Computes the numerical gradient of `f` at `x` element by element using
/// central differences: f'(x) ≈ (f(x + h) - f(x - h)) / (2h)
pub fn finite_difference<F>(f: F, x: &ArrayD<f32>, epsilon: f32) -> ArrayD<f32>
where
    F: Fn(&ArrayD<f32>) -> f32,
{
    let mut grad = ArrayD::zeros(x.raw_dim());
    let mut probe = x.clone();

    for idx in ndarray::indices(x.raw_dim()) {
        let original = probe[&idx];
        probe[&idx] = original + epsilon;
        let f_plus = f(&probe);
        probe[&idx] = original - epsilon;
        let f_minus = f(&probe);
        probe[&idx] = original;

        grad[&idx] = (f_plus - f_minus) / (2.0 * epsilon);
    }

    grad
}
