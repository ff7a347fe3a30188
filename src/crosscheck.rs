//! Cross-validation against an external black-box attributor.
//!
//! The vectorized engine trades generality for speed, so it is worth
//! checking its output against an independent DeepLIFT/SHAP implementation
//! on the same model. That implementation stays behind a trait; this module
//! only drives it one example at a time and applies the same hypothetical
//! projection conventions as [`crate::deep_lift_shap`].

use crate::driver::{AttributionConfig, AttributionOutput};
use crate::error::{AtribuirError, Result};
use crate::shuffle::ReferenceSource;
use ndarray::{Array3, Array4, ArrayD, Axis};

/// An external attribution implementation treated as a black box.
pub trait BlackBoxAttributor {
    /// Attribute one example (1, alphabet, length) against its references
    /// (n_refs, alphabet, length), returning hypothetical attributions of
    /// shape (1, alphabet, length) already averaged over the references.
    fn attribute(
        &self,
        example: &Array3<f32>,
        references: &Array3<f32>,
        args: Option<&[ArrayD<f32>]>,
    ) -> Result<Array3<f32>>;
}

/// Drive a black-box attributor over a set of sequences.
///
/// Examples are processed one at a time with their full reference set, so
/// this path is slower than the batched driver and exists purely for
/// sanity-checking its output. References are collected and returned
/// correctly when requested.
pub fn black_box_deep_lift_shap(
    attributor: &dyn BlackBoxAttributor,
    x: &Array3<f32>,
    args: Option<&[ArrayD<f32>]>,
    references: ReferenceSource<'_>,
    config: &AttributionConfig,
) -> Result<AttributionOutput> {
    let (n_examples, alphabet, length) = x.dim();
    let n_shuffles = match &references {
        ReferenceSource::Tensor(tensor) => {
            let (rn, shuffles, ra, rl) = tensor.dim();
            if rn != n_examples || ra != alphabet || rl != length {
                return Err(AtribuirError::shape(
                    "precomputed references",
                    &[n_examples, shuffles, alphabet, length],
                    tensor.shape(),
                ));
            }
            shuffles
        }
        ReferenceSource::Generator(_) => config.n_shuffles,
    };

    let mut attributions = Array3::<f32>::zeros((n_examples, alphabet, length));
    let mut used_references = config
        .return_references
        .then(|| Array4::<f32>::zeros((n_examples, n_shuffles, alphabet, length)));

    for i in 0..n_examples {
        let example = x.index_axis(Axis(0), i).insert_axis(Axis(0)).to_owned();
        let example_args: Option<Vec<ArrayD<f32>>> =
            args.map(|args| args.iter().map(|a| a.select(Axis(0), &[i])).collect());

        let example_refs = match &references {
            ReferenceSource::Tensor(tensor) => tensor.index_axis(Axis(0), i).to_owned(),
            ReferenceSource::Generator(generator) => generator
                .generate(&example, n_shuffles, config.random_state)?
                .index_axis(Axis(0), 0)
                .to_owned(),
        };

        let attr = attributor.attribute(&example, &example_refs, example_args.as_deref())?;
        if attr.dim() != (1, alphabet, length) {
            return Err(AtribuirError::shape(
                "black-box attribution",
                &[1, alphabet, length],
                attr.shape(),
            ));
        }

        let mut row = attributions.index_axis_mut(Axis(0), i);
        row.assign(&attr.index_axis(Axis(0), 0));
        if !config.hypothetical {
            row *= &x.index_axis(Axis(0), i);
        }
        if let Some(collected) = used_references.as_mut() {
            collected.index_axis_mut(Axis(0), i).assign(&example_refs);
        }
    }

    Ok(AttributionOutput { attributions, references: used_references })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shuffle::DinucleotideShuffle;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    /// Returns the mean (example - reference) difference, which satisfies
    /// conservation for an identity model and is enough to exercise the
    /// driver plumbing.
    struct MeanDiff;

    impl BlackBoxAttributor for MeanDiff {
        fn attribute(
            &self,
            example: &Array3<f32>,
            references: &Array3<f32>,
            _args: Option<&[ArrayD<f32>]>,
        ) -> Result<Array3<f32>> {
            let n_refs = references.dim().0 as f32;
            let mut out = example.clone();
            for r in references.axis_iter(Axis(0)) {
                out -= &(&r.insert_axis(Axis(0)) / n_refs);
            }
            Ok(out)
        }
    }

    fn one_hot(tokens: &[usize]) -> Array3<f32> {
        let mut x = Array3::<f32>::zeros((1, 4, tokens.len()));
        for (pos, &t) in tokens.iter().enumerate() {
            x[[0, t, pos]] = 1.0;
        }
        x
    }

    #[test]
    fn test_black_box_shapes_and_references() {
        let x = one_hot(&[0, 1, 2, 3, 0, 1, 1, 2]);
        let config = AttributionConfig::default()
            .with_n_shuffles(3)
            .with_random_state(17)
            .with_return_references()
            .with_hypothetical();

        let out = black_box_deep_lift_shap(
            &MeanDiff,
            &x,
            None,
            ReferenceSource::Generator(&DinucleotideShuffle),
            &config,
        )
        .unwrap();

        assert_eq!(out.attributions.dim(), (1, 4, 8));
        let refs = out.references.unwrap();
        assert_eq!(refs.dim(), (1, 3, 4, 8));
        // Collected references must be real one-hot rows, not zeros.
        let total: f32 = refs.sum();
        assert_abs_diff_eq!(total, 3.0 * 8.0, epsilon = 1e-6);
    }

    #[test]
    fn test_observed_collapse_matches_hypothetical() {
        let x = one_hot(&[2, 0, 3, 1, 2, 2]);
        let base = AttributionConfig::default().with_n_shuffles(2).with_random_state(4);

        let hyp = black_box_deep_lift_shap(
            &MeanDiff,
            &x,
            None,
            ReferenceSource::Generator(&DinucleotideShuffle),
            &base.clone().with_hypothetical(),
        )
        .unwrap();
        let obs = black_box_deep_lift_shap(
            &MeanDiff,
            &x,
            None,
            ReferenceSource::Generator(&DinucleotideShuffle),
            &base,
        )
        .unwrap();

        let collapsed = &hyp.attributions * &x;
        for (&a, &b) in collapsed.iter().zip(obs.attributions.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_precomputed_tensor_shape_checked() {
        let x = one_hot(&[0, 1, 2, 3]);
        let bad = ndarray::Array4::<f32>::zeros((2, 2, 4, 4));
        let config = AttributionConfig::default();
        assert!(black_box_deep_lift_shap(&MeanDiff, &x, None, ReferenceSource::Tensor(&bad), &config)
            .is_err());
    }
}
