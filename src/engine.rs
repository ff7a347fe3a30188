//! Rescale-rule gradient engine: a vectorized DeepLIFT/SHAP implementation.
//!
//! The engine runs one combined forward/backward pass over the concatenated
//! (inputs, baselines) batch and rewrites the gradient at each configured
//! pointwise nonlinearity with the rescale rule: the gradient through the
//! layer becomes Δout/Δin, the ratio of the output difference to the input
//! difference between the paired input and baseline rows. Linear layers keep
//! their native gradients, where the chain rule is already exact, so for a
//! purely linear model the result reduces to the plain gradient.
//!
//! Every call validates the conservation property afterwards: the summed
//! attribution per example must match the output difference from its
//! baseline. Violations are reported as warnings, never errors.
//!
//! Hooks are registered against the shared model, but all captured state
//! lives in a per-call arena, so the model is returned to its original,
//! hook-free state on every exit path. The engine is strictly sequential; a
//! second attribution on the same model must not start before the first
//! returns.

use crate::error::{AtribuirError, Result};
use crate::nn::{Activation, HookHandle, LayerId, LayerKind, Model};
use ndarray::{concatenate, Array3, ArrayD, Axis, Ix2, Ix3, Slice, Zip};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, warn};

/// Engine tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Nonlinearities that receive the rescale-rule rewrite. Activations
    /// outside this set keep their native gradients.
    pub rescale: Vec<Activation>,
    /// Threshold under which |Δin| counts as zero and the native gradient is
    /// kept, guarding the Δout/Δin division against blow-up.
    pub eps: f32,
    /// Convergence deltas above this raise a warning.
    pub warning_threshold: f32,
    /// Report every example's convergence delta, not only offenders.
    pub verbose: bool,
}

impl EngineConfig {
    /// Set the rescaled activation set.
    pub fn with_rescale(mut self, rescale: Vec<Activation>) -> Self {
        self.rescale = rescale;
        self
    }

    /// Set the near-zero denominator guard.
    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    /// Set the convergence warning threshold.
    pub fn with_warning_threshold(mut self, threshold: f32) -> Self {
        self.warning_threshold = threshold;
        self
    }

    /// Report all convergence deltas.
    pub fn with_verbose(mut self) -> Self {
        self.verbose = true;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rescale: vec![Activation::ReLU],
            eps: 1e-6,
            warning_threshold: 1e-3,
            verbose: false,
        }
    }
}

/// Rescale eligibility, resolved once per layer at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerRole {
    /// Gets the rescale-rule gradient rewrite.
    Rescale,
    /// Keeps its native gradient.
    PassThrough,
}

/// Forward snapshots for one intercepted layer, taken over the combined
/// (inputs, baselines) batch and consumed exactly once by the backward
/// rewrite.
#[derive(Default)]
struct Capture {
    input: Option<ArrayD<f32>>,
    output: Option<ArrayD<f32>>,
}

type CaptureTable = Rc<RefCell<BTreeMap<LayerId, Capture>>>;

/// Removes every registered hook when dropped, so the model is left clean on
/// success and on error alike.
struct HookGuard<'m> {
    model: &'m dyn Model,
    handles: Vec<HookHandle>,
}

impl<'m> HookGuard<'m> {
    fn new(model: &'m dyn Model) -> Self {
        Self { model, handles: Vec::new() }
    }

    fn push(&mut self, handle: HookHandle) {
        self.handles.push(handle);
    }
}

impl Drop for HookGuard<'_> {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            self.model.hooks().remove(handle);
        }
    }
}

/// Vectorized DeepLIFT/SHAP over a borrowed model.
///
/// Unlike single-baseline formulations, `attribute` accepts one baseline per
/// input row, so many (example, reference) pairs run in one batch.
pub struct DeepLiftShap<'m> {
    model: &'m dyn Model,
    config: EngineConfig,
    roles: Vec<LayerRole>,
}

impl<'m> DeepLiftShap<'m> {
    /// Classify the model's layers and build an engine over it.
    ///
    /// Fails immediately with [`AtribuirError::UnsupportedLayer`] if the
    /// model contains any pooling layer; the rescale rule is not defined for
    /// non-linear pooling.
    pub fn new(model: &'m dyn Model, config: EngineConfig) -> Result<Self> {
        if model.layers().is_empty() {
            return Err(AtribuirError::EmptyModel);
        }
        let roles = model
            .layers()
            .iter()
            .map(|layer| match layer.kind() {
                LayerKind::Pooling => {
                    Err(AtribuirError::UnsupportedLayer { layer: layer.name().to_string() })
                }
                LayerKind::Activation(act) if config.rescale.contains(&act) => {
                    Ok(LayerRole::Rescale)
                }
                _ => Ok(LayerRole::PassThrough),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { model, config, roles })
    }

    /// Attribute the first output column of the model to the input
    /// characters, relative to the paired baselines.
    ///
    /// `inputs` and `baselines` are (n, alphabet, length) tensors of equal
    /// shape; row `i` of `baselines` is the reference for row `i` of
    /// `inputs`. Returns the raw multipliers, to be passed through
    /// [`crate::hypothetical_attributions`] for categorical inputs.
    pub fn attribute(
        &self,
        inputs: &Array3<f32>,
        baselines: &Array3<f32>,
        args: Option<&[ArrayD<f32>]>,
    ) -> Result<Array3<f32>> {
        if inputs.dim() != baselines.dim() {
            return Err(AtribuirError::shape(
                "inputs vs baselines",
                inputs.shape(),
                baselines.shape(),
            ));
        }
        let n = inputs.dim().0;

        let captures: CaptureTable = Rc::default();
        let mut guard = HookGuard::new(self.model);
        self.register_hooks(&captures, &mut guard);

        // One combined pass over [inputs; baselines], seeded with d(sum of
        // the inputs-half score column).
        let combined = concatenate(Axis(0), &[inputs.view(), baselines.view()])?.into_dyn();
        let doubled_args = match args {
            Some(args) => Some(
                args.iter()
                    .map(|a| Ok(concatenate(Axis(0), &[a.view(), a.view()])?))
                    .collect::<Result<Vec<_>>>()?,
            ),
            None => None,
        };

        let seed = move |output: &ArrayD<f32>| {
            let mut seed = ArrayD::zeros(output.raw_dim());
            if output.ndim() == 2 && output.shape()[1] > 0 {
                for i in 0..n {
                    seed[[i, 0]] = 1.0;
                }
            }
            seed
        };

        let (output, gradients) =
            self.model
                .forward_backward(&combined, doubled_args.as_deref(), &seed)?;

        let output = output
            .into_dimensionality::<Ix2>()
            .map_err(|_| AtribuirError::Internal {
                message: "model output must be a (batch, outputs) tensor".into(),
            })?;
        let gradients = gradients
            .into_dimensionality::<Ix3>()
            .map_err(|_| AtribuirError::Internal {
                message: "input gradient lost its (batch, alphabet, length) shape".into(),
            })?;
        let gradients = gradients.slice_axis(Axis(0), Slice::from(0..n)).to_owned();

        self.check_convergence(inputs, baselines, &output, &gradients);
        drop(guard);

        Ok(gradients)
    }

    /// Install capture and rewrite hooks on every eligible layer. A layer
    /// that already carries a backward rewriter from another consumer is
    /// left alone.
    fn register_hooks(&self, captures: &CaptureTable, guard: &mut HookGuard<'_>) {
        let hooks = self.model.hooks();
        for (layer, role) in self.roles.iter().enumerate() {
            if *role != LayerRole::Rescale || hooks.has_backward(layer) {
                continue;
            }

            let table = Rc::clone(captures);
            guard.push(hooks.register_forward_pre(
                layer,
                Box::new(move |l, input| {
                    table.borrow_mut().entry(l).or_default().input = Some(input.clone());
                }),
            ));

            let table = Rc::clone(captures);
            guard.push(hooks.register_forward(
                layer,
                Box::new(move |l, _, output| {
                    table.borrow_mut().entry(l).or_default().output = Some(output.clone());
                }),
            ));

            let table = Rc::clone(captures);
            let eps = self.config.eps;
            guard.push(hooks.register_backward(
                layer,
                Box::new(move |l, native, grad_output| {
                    rescale_rewrite(&table, l, native, grad_output, eps)
                }),
            ));
        }
    }

    /// Verify the conservation property and surface violations as warnings.
    fn check_convergence(
        &self,
        inputs: &Array3<f32>,
        baselines: &Array3<f32>,
        output: &ndarray::Array2<f32>,
        gradients: &Array3<f32>,
    ) {
        let n = inputs.dim().0;
        if output.ncols() == 0 || output.nrows() < 2 * n {
            return;
        }

        let weighted = (inputs - baselines) * gradients;
        let mut offenders = Vec::new();
        for i in 0..n {
            let output_diff = output[[i, 0]] - output[[n + i, 0]];
            let input_diff = weighted.index_axis(Axis(0), i).sum();
            let delta = (output_diff - input_diff).abs();

            if self.config.verbose {
                debug!(example = i, delta, "convergence delta");
            }
            if delta > self.config.warning_threshold {
                offenders.push((i, delta));
            }
        }

        if !offenders.is_empty() {
            warn!(
                threshold = self.config.warning_threshold,
                deltas = ?offenders,
                "convergence deltas too high; attributions may violate conservation"
            );
        }
    }
}

/// The rescale rule, applied at one intercepted layer during backward.
///
/// With Δin and Δout the input-half minus baseline-half differences of the
/// captured forward tensors, the rewritten input gradient is
/// `grad_output * Δout/Δin` wherever |Δin| ≥ eps, and the native gradient
/// wherever the denominator is too close to zero.
fn rescale_rewrite(
    captures: &CaptureTable,
    layer: LayerId,
    native: &ArrayD<f32>,
    grad_output: &ArrayD<f32>,
    eps: f32,
) -> Option<ArrayD<f32>> {
    let mut table = captures.borrow_mut();
    let capture = table.get_mut(&layer)?;
    let input = capture.input.take()?;
    let output = capture.output.take()?;

    let rows = input.shape()[0];
    if rows % 2 != 0 || native.shape() != input.shape() || output.shape() != input.shape() {
        return None;
    }
    let n = rows / 2;

    let delta_in =
        &input.slice_axis(Axis(0), Slice::from(0..n)) - &input.slice_axis(Axis(0), Slice::from(n..rows));
    let delta_out =
        &output.slice_axis(Axis(0), Slice::from(0..n)) - &output.slice_axis(Axis(0), Slice::from(n..rows));

    let mut rewritten = native.clone();
    for row in 0..rows {
        let d_in = delta_in.index_axis(Axis(0), row % n);
        let d_out = delta_out.index_axis(Axis(0), row % n);
        let g_out = grad_output.index_axis(Axis(0), row);
        let mut target = rewritten.index_axis_mut(Axis(0), row);
        Zip::from(&mut target)
            .and(&d_in)
            .and(&d_out)
            .and(&g_out)
            .for_each(|t, &di, &dout, &g| {
                if di.abs() >= eps {
                    *t = g * dout / di;
                }
            });
    }
    Some(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Conv1d, Dense, Flatten, MaxPool1d, Sequential};
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2, arr3, Array};

    fn linear_model(weights: &[f32]) -> Sequential {
        let w = Array::from_shape_vec((1, weights.len()), weights.to_vec()).unwrap();
        Sequential::new(vec![
            Box::new(Flatten),
            Box::new(Dense::new(w, arr1(&[0.0])).unwrap()),
        ])
        .unwrap()
    }

    #[test]
    fn test_linear_scenario_exact_attribution() {
        // Dense weights [2,-1,0,0], x=[1,0,0,0], ref=[0,1,0,0]: the gradient
        // is constant so the multipliers are the weights themselves.
        let model = linear_model(&[2.0, -1.0, 0.0, 0.0]);
        let engine = DeepLiftShap::new(&model, EngineConfig::default()).unwrap();

        let x = arr3(&[[[1.0], [0.0], [0.0], [0.0]]]);
        let baseline = arr3(&[[[0.0], [1.0], [0.0], [0.0]]]);
        let grads = engine.attribute(&x, &baseline, None).unwrap();

        assert_eq!(grads.dim(), (1, 4, 1));
        assert_abs_diff_eq!(grads[[0, 0, 0]], 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(grads[[0, 1, 0]], -1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(grads[[0, 2, 0]], 0.0, epsilon = 1e-6);

        // Conservation is exact for a linear model.
        let attribution_sum: f32 = ((&x - &baseline) * &grads).sum();
        assert_abs_diff_eq!(attribution_sum, 2.0 + 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let model = linear_model(&[1.0, 1.0, 1.0, 1.0]);
        let engine = DeepLiftShap::new(&model, EngineConfig::default()).unwrap();

        let x = Array::zeros((1, 4, 1));
        let baseline = Array::zeros((1, 4, 2));
        assert!(matches!(
            engine.attribute(&x, &baseline, None),
            Err(AtribuirError::ShapeMismatch { .. })
        ));
        assert!(model.hooks().is_empty());
    }

    #[test]
    fn test_maxpool_rejected_at_construction() {
        let w = Array::from_shape_vec((1, 4, 3), vec![0.1; 12]).unwrap();
        let model = Sequential::new(vec![
            Box::new(Conv1d::new(w, arr1(&[0.0]), 1).unwrap()),
            Box::new(MaxPool1d::new(2).unwrap()),
            Box::new(Flatten),
        ])
        .unwrap();

        match DeepLiftShap::new(&model, EngineConfig::default()) {
            Err(AtribuirError::UnsupportedLayer { layer }) => assert_eq!(layer, "MaxPool1d"),
            _ => panic!("pooling layer must be rejected at construction"),
        }
    }

    fn relu_model() -> Sequential {
        Sequential::new(vec![
            Box::new(Flatten),
            Box::new(Dense::new(arr2(&[[1.0, -2.0, 0.5, 1.5], [-1.0, 1.0, 2.0, -0.5]]), arr1(&[0.2, -0.3])).unwrap()),
            Box::new(Activation::ReLU),
            Box::new(Dense::new(arr2(&[[2.0, -1.5]]), arr1(&[0.4])).unwrap()),
        ])
        .unwrap()
    }

    fn score(model: &Sequential, x: &Array3<f32>) -> f32 {
        let y = model.forward(&x.clone().into_dyn(), None).unwrap();
        y[[0, 0]]
    }

    #[test]
    fn test_relu_model_satisfies_conservation() {
        let model = relu_model();
        let engine = DeepLiftShap::new(&model, EngineConfig::default()).unwrap();

        let x = arr3(&[[[1.0], [0.0], [0.0], [0.0]]]);
        let baseline = arr3(&[[[0.0], [0.0], [1.0], [0.0]]]);
        let grads = engine.attribute(&x, &baseline, None).unwrap();

        let attribution_sum: f32 = ((&x - &baseline) * &grads).sum();
        let output_diff = score(&model, &x) - score(&model, &baseline);
        assert_abs_diff_eq!(attribution_sum, output_diff, epsilon = 1e-4);
    }

    #[test]
    fn test_hooks_removed_after_success() {
        let model = relu_model();
        let engine = DeepLiftShap::new(&model, EngineConfig::default()).unwrap();

        let x = arr3(&[[[1.0], [0.0], [0.0], [0.0]]]);
        let baseline = arr3(&[[[0.0], [1.0], [0.0], [0.0]]]);
        engine.attribute(&x, &baseline, None).unwrap();
        assert!(model.hooks().is_empty());
    }

    #[test]
    fn test_hooks_removed_after_forward_failure() {
        // Dense expects 8 features but flattened input has 4, so the forward
        // pass fails after hooks were registered.
        let model = Sequential::new(vec![
            Box::new(Activation::ReLU),
            Box::new(Flatten),
            Box::new(Dense::new(Array::zeros((1, 8)), arr1(&[0.0])).unwrap()),
        ])
        .unwrap();
        let engine = DeepLiftShap::new(&model, EngineConfig::default()).unwrap();

        let x = arr3(&[[[1.0], [0.0], [0.0], [0.0]]]);
        let baseline = arr3(&[[[0.0], [1.0], [0.0], [0.0]]]);
        assert!(engine.attribute(&x, &baseline, None).is_err());
        assert!(model.hooks().is_empty());
    }

    #[test]
    fn test_identical_input_and_baseline_yields_native_gradients() {
        // Δin is zero everywhere, so the eps guard must keep every native
        // gradient and produce no NaNs.
        let model = relu_model();
        let engine = DeepLiftShap::new(&model, EngineConfig::default()).unwrap();

        let x = arr3(&[[[1.0], [0.0], [0.0], [0.0]]]);
        let grads = engine.attribute(&x, &x.clone(), None).unwrap();
        assert!(grads.iter().all(|g| g.is_finite()));
    }

    #[test]
    fn test_preexisting_backward_hook_blocks_interception() {
        let model = relu_model();
        // Another consumer already rewrites layer 2's gradient.
        let handle = model.hooks().register_backward(2, Box::new(|_, _, _| None));

        let engine = DeepLiftShap::new(&model, EngineConfig::default()).unwrap();
        let x = arr3(&[[[1.0], [0.0], [0.0], [0.0]]]);
        let baseline = arr3(&[[[0.0], [1.0], [0.0], [0.0]]]);
        engine.attribute(&x, &baseline, None).unwrap();

        // The foreign hook must survive, and nothing else may linger.
        assert!(model.hooks().has_backward(2));
        assert_eq!(model.hooks().len(), 1);
        model.hooks().remove(handle);
    }

    #[test]
    fn test_sigmoid_outside_rescale_set_keeps_native_gradient() {
        let model = Sequential::new(vec![
            Box::new(Flatten),
            Box::new(Dense::new(arr2(&[[1.0, -1.0, 0.5, 0.0]]), arr1(&[0.0])).unwrap()),
            Box::new(Activation::Sigmoid),
        ])
        .unwrap();
        let engine = DeepLiftShap::new(&model, EngineConfig::default()).unwrap();

        let x = arr3(&[[[1.0], [0.0], [0.0], [0.0]]]);
        let baseline = arr3(&[[[0.0], [1.0], [0.0], [0.0]]]);
        engine.attribute(&x, &baseline, None).unwrap();
        // Sigmoid is not in the default rescale set, so no hooks were placed.
        assert!(model.hooks().is_empty());
    }
}
