//! End-to-end attribution tests over a convolutional sequence model.

use approx::assert_abs_diff_eq;
use atribuir::nn::{Activation, Conv1d, Dense, Flatten, Sequential};
use atribuir::{
    deep_lift_shap, AttributionConfig, DeepLiftShap, DinucleotideShuffle, EngineConfig,
    Model, ReferenceSource,
};
use ndarray::{arr1, Array, Array3, Axis};

const ALPHABET: usize = 4;
const LENGTH: usize = 10;

fn one_hot(rows: &[&[usize]]) -> Array3<f32> {
    let mut x = Array3::<f32>::zeros((rows.len(), ALPHABET, rows[0].len()));
    for (e, tokens) in rows.iter().enumerate() {
        for (pos, &t) in tokens.iter().enumerate() {
            x[[e, t, pos]] = 1.0;
        }
    }
    x
}

/// Conv -> ReLU -> Flatten -> Dense scoring model with fixed pseudo-random
/// weights.
fn conv_model() -> Sequential {
    let kernel = 5;
    let out_channels = 6;
    let conv_w = Array::from_shape_vec(
        (out_channels, ALPHABET, kernel),
        (0..out_channels * ALPHABET * kernel)
            .map(|v| (((v * 31) % 23) as f32 - 11.0) * 0.07)
            .collect(),
    )
    .unwrap();
    let conv_b = arr1(&[0.05, -0.02, 0.1, 0.0, -0.08, 0.03]);

    let features = out_channels * LENGTH;
    let dense_w = Array::from_shape_vec(
        (1, features),
        (0..features).map(|v| (((v * 17) % 13) as f32 - 6.0) * 0.09).collect(),
    )
    .unwrap();

    Sequential::new(vec![
        Box::new(Conv1d::new(conv_w, conv_b, 2).unwrap()),
        Box::new(Activation::ReLU),
        Box::new(Flatten),
        Box::new(Dense::new(dense_w, arr1(&[0.2])).unwrap()),
    ])
    .unwrap()
}

fn sequences() -> Array3<f32> {
    one_hot(&[
        &[0, 1, 2, 3, 0, 1, 0, 2, 3, 1],
        &[3, 2, 2, 0, 1, 1, 0, 3, 2, 0],
        &[1, 0, 3, 2, 1, 0, 2, 3, 0, 1],
    ])
}

fn score(model: &Sequential, x: &Array3<f32>) -> Vec<f32> {
    let y = model.forward(&x.clone().into_dyn(), None).unwrap();
    (0..x.dim().0).map(|i| y[[i, 0]]).collect()
}

#[test]
fn conservation_holds_through_conv_and_relu() {
    let model = conv_model();
    let engine = DeepLiftShap::new(&model, EngineConfig::default()).unwrap();

    let x = sequences();
    let refs = DinucleotideShuffle.generate_pairs(&x, 101);

    let grads = engine.attribute(&x, &refs, None).unwrap();
    let out_x = score(&model, &x);
    let out_b = score(&model, &refs);

    for i in 0..x.dim().0 {
        let attribution_sum: f32 = ((&x.index_axis(Axis(0), i).to_owned()
            - &refs.index_axis(Axis(0), i))
            * &grads.index_axis(Axis(0), i))
            .sum();
        assert_abs_diff_eq!(attribution_sum, out_x[i] - out_b[i], epsilon = 1e-3);
    }
}

#[test]
fn driver_end_to_end_shapes_and_cleanup() {
    let model = conv_model();
    let x = sequences();

    let config = AttributionConfig::default()
        .with_n_shuffles(6)
        .with_batch_size(4)
        .with_random_state(77)
        .with_return_references();
    let out = deep_lift_shap(
        &model,
        &x,
        None,
        ReferenceSource::Generator(&DinucleotideShuffle),
        &config,
    )
    .unwrap();

    assert_eq!(out.attributions.dim(), (3, ALPHABET, LENGTH));
    assert_eq!(out.references.unwrap().dim(), (3, 6, ALPHABET, LENGTH));
    assert!(model.hooks().is_empty());
}

#[test]
fn observed_attributions_are_zero_off_sequence() {
    // Without `hypothetical`, attribution mass can only sit on the observed
    // characters.
    let model = conv_model();
    let x = sequences();

    let config = AttributionConfig::default().with_n_shuffles(4).with_random_state(5);
    let out = deep_lift_shap(
        &model,
        &x,
        None,
        ReferenceSource::Generator(&DinucleotideShuffle),
        &config,
    )
    .unwrap();

    for (attr, onehot) in out.attributions.iter().zip(x.iter()) {
        if *onehot == 0.0 {
            assert_eq!(*attr, 0.0);
        }
    }
}

#[test]
fn batch_size_does_not_change_results() {
    let model = conv_model();
    let x = sequences();
    let base = AttributionConfig::default().with_n_shuffles(5).with_random_state(19);

    let mut previous: Option<Array3<f32>> = None;
    for batch_size in [1, 2, 7, 64] {
        let out = deep_lift_shap(
            &model,
            &x,
            None,
            ReferenceSource::Generator(&DinucleotideShuffle),
            &base.clone().with_batch_size(batch_size),
        )
        .unwrap();
        if let Some(prev) = &previous {
            for (&a, &b) in prev.iter().zip(out.attributions.iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-6);
            }
        }
        previous = Some(out.attributions);
    }
}

/// Helper extension used by the conservation test: one seeded reference per
/// example, as a flat (n, alphabet, length) tensor.
trait GeneratePairs {
    fn generate_pairs(&self, x: &Array3<f32>, seed: u64) -> Array3<f32>;
}

impl GeneratePairs for DinucleotideShuffle {
    fn generate_pairs(&self, x: &Array3<f32>, seed: u64) -> Array3<f32> {
        use atribuir::ReferenceGenerator;
        self.generate(x, 1, Some(seed))
            .unwrap()
            .index_axis(Axis(1), 0)
            .to_owned()
    }
}
