//! Hypothetical-attribution projection for categorical inputs.
//!
//! A one-hot position that flips from one character to another both gains a
//! character and loses one, so gradient-times-input misattributes credit.
//! The projection asks, for every character independently: if this position
//! became that character, what would the contribution be relative to the
//! reference?

use crate::error::{AtribuirError, Result};
use ndarray::{Array2, Array3, Axis, Zip};

/// Project raw multipliers into per-character hypothetical attributions.
///
/// All three tensors share the shape (n, alphabet, length): the multipliers
/// produced by [`crate::DeepLiftShap::attribute`], the one-hot examples they
/// were computed for, and the paired references. For each character `c`, the
/// output's row `c` along the alphabet axis holds the contribution of every
/// position becoming `c`: the elementwise difference between the all-`c`
/// one-hot input and the reference, times the multipliers, summed over the
/// alphabet axis.
///
/// Pure function; fails only on shape disagreement.
pub fn hypothetical_attributions(
    multipliers: &Array3<f32>,
    x: &Array3<f32>,
    references: &Array3<f32>,
) -> Result<Array3<f32>> {
    if x.dim() != multipliers.dim() {
        return Err(AtribuirError::shape("x vs multipliers", multipliers.shape(), x.shape()));
    }
    if references.dim() != multipliers.dim() {
        return Err(AtribuirError::shape(
            "references vs multipliers",
            multipliers.shape(),
            references.shape(),
        ));
    }

    let (n, alphabet, length) = multipliers.dim();
    let mut projected = Array3::<f32>::zeros((n, alphabet, length));

    for c in 0..alphabet {
        // Σ_a (hypothetical[a] - reference[a]) * multiplier[a], with the
        // hypothetical input one-hot at c.
        let mut contribution = Array2::<f32>::zeros((n, length));
        for a in 0..alphabet {
            let indicator = if a == c { 1.0 } else { 0.0 };
            let m = multipliers.index_axis(Axis(1), a);
            let r = references.index_axis(Axis(1), a);
            Zip::from(&mut contribution).and(&m).and(&r).for_each(|acc, &m, &r| {
                *acc += (indicator - r) * m;
            });
        }
        projected.index_axis_mut(Axis(1), c).assign(&contribution);
    }

    Ok(projected)
}
