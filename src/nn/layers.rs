//! Concrete layers: dense, 1-d convolution, pointwise activations, flatten
//! and max pooling.
//!
//! Shapes follow the sequence-model convention: rank-3 tensors are
//! (batch, channels, length) and rank-2 tensors are (batch, features).

use crate::error::{AtribuirError, Result};
use crate::nn::{LayerKind, Module};
use ndarray::{Array1, Array2, Array3, ArrayD, Ix2, Ix3, IxDyn};
use serde::{Deserialize, Serialize};

fn as_rank2<'a>(
    x: &'a ArrayD<f32>,
    context: &str,
    features: usize,
) -> Result<ndarray::ArrayView2<'a, f32>> {
    let view = x
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| AtribuirError::shape(context, &[0, features], x.shape()))?;
    if view.ncols() != features {
        return Err(AtribuirError::shape(context, &[view.nrows(), features], x.shape()));
    }
    Ok(view)
}

fn as_rank3<'a>(
    x: &'a ArrayD<f32>,
    context: &str,
    channels: usize,
) -> Result<ndarray::ArrayView3<'a, f32>> {
    let view = x
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|_| AtribuirError::shape(context, &[0, channels, 0], x.shape()))?;
    if view.dim().1 != channels {
        return Err(AtribuirError::shape(context, &[view.dim().0, channels, view.dim().2], x.shape()));
    }
    Ok(view)
}

/// Fully-connected layer: `y = x · Wᵀ + b`.
#[derive(Debug, Clone)]
pub struct Dense {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl Dense {
    /// Create a dense layer from a (out_features, in_features) weight matrix
    /// and a per-output bias.
    pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if bias.len() != weight.nrows() {
            return Err(AtribuirError::shape("dense bias", &[weight.nrows()], &[bias.len()]));
        }
        Ok(Self { weight, bias })
    }

    /// Input feature count.
    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    /// Output feature count.
    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }
}

impl Module for Dense {
    fn name(&self) -> &'static str {
        "Dense"
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Linear
    }

    fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x2 = as_rank2(x, "dense input", self.in_features())?;
        let y = x2.dot(&self.weight.t()) + &self.bias;
        Ok(y.into_dyn())
    }

    fn backward(&self, _input: &ArrayD<f32>, grad_output: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        // ∂L/∂x = ∂L/∂y · W
        let g2 = as_rank2(grad_output, "dense gradient", self.out_features())?;
        Ok(g2.dot(&self.weight).into_dyn())
    }
}

/// 1-d cross-correlation with symmetric zero padding and per-channel bias.
#[derive(Debug, Clone)]
pub struct Conv1d {
    weight: Array3<f32>,
    bias: Array1<f32>,
    padding: usize,
}

impl Conv1d {
    /// Create a convolution from a (out_channels, in_channels, kernel)
    /// weight tensor, a per-output-channel bias and a zero-padding width
    /// applied to both ends of the sequence.
    pub fn new(weight: Array3<f32>, bias: Array1<f32>, padding: usize) -> Result<Self> {
        if bias.len() != weight.dim().0 {
            return Err(AtribuirError::shape("conv1d bias", &[weight.dim().0], &[bias.len()]));
        }
        if weight.dim().2 == 0 {
            return Err(AtribuirError::Config {
                field: "kernel".into(),
                message: "convolution kernel must be non-empty".into(),
            });
        }
        Ok(Self { weight, bias, padding })
    }

    /// Output length for an input of length `l`.
    fn out_len(&self, l: usize) -> Result<usize> {
        let k = self.weight.dim().2;
        (l + 2 * self.padding + 1)
            .checked_sub(k)
            .ok_or_else(|| AtribuirError::shape("conv1d input length", &[k], &[l]))
    }
}

impl Module for Conv1d {
    fn name(&self) -> &'static str {
        "Conv1d"
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Linear
    }

    fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let (out_c, in_c, k) = self.weight.dim();
        let x3 = as_rank3(x, "conv1d input", in_c)?;
        let (batch, _, l) = x3.dim();
        let l_out = self.out_len(l)?;
        let p = self.padding as isize;

        let mut y = Array3::<f32>::zeros((batch, out_c, l_out));
        for b in 0..batch {
            for o in 0..out_c {
                for t in 0..l_out {
                    // y[b,o,t] = bias[o] + Σ_{i,j} w[o,i,j] * x_pad[b,i,t+j]
                    let mut acc = self.bias[o];
                    for i in 0..in_c {
                        for j in 0..k {
                            let src = t as isize + j as isize - p;
                            if src >= 0 && (src as usize) < l {
                                acc += self.weight[[o, i, j]] * x3[[b, i, src as usize]];
                            }
                        }
                    }
                    y[[b, o, t]] = acc;
                }
            }
        }
        Ok(y.into_dyn())
    }

    fn backward(&self, input: &ArrayD<f32>, grad_output: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let (out_c, in_c, k) = self.weight.dim();
        let x3 = as_rank3(input, "conv1d input", in_c)?;
        let g3 = as_rank3(grad_output, "conv1d gradient", out_c)?;
        let (batch, _, l) = x3.dim();
        let l_out = self.out_len(l)?;
        if g3.dim() != (batch, out_c, l_out) {
            return Err(AtribuirError::shape(
                "conv1d gradient",
                &[batch, out_c, l_out],
                grad_output.shape(),
            ));
        }
        let p = self.padding as isize;

        // ∂L/∂x[b,i,s] = Σ_{o,t,j : t+j-p == s} ∂L/∂y[b,o,t] * w[o,i,j]
        let mut dx = Array3::<f32>::zeros((batch, in_c, l));
        for b in 0..batch {
            for o in 0..out_c {
                for t in 0..l_out {
                    let g = g3[[b, o, t]];
                    for i in 0..in_c {
                        for j in 0..k {
                            let src = t as isize + j as isize - p;
                            if src >= 0 && (src as usize) < l {
                                dx[[b, i, src as usize]] += g * self.weight[[o, i, j]];
                            }
                        }
                    }
                }
            }
        }
        Ok(dx.into_dyn())
    }
}

/// Pointwise nonlinearity. The enum itself is the layer, so the engine can
/// match on the variant when resolving rescale eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    /// Rectified linear unit.
    ReLU,
    /// Logistic sigmoid.
    Sigmoid,
    /// Hyperbolic tangent.
    Tanh,
}

impl Activation {
    fn apply(self, x: f32) -> f32 {
        match self {
            Self::ReLU => x.max(0.0),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Tanh => x.tanh(),
        }
    }

    /// Derivative with respect to the pre-activation input.
    fn grad(self, x: f32) -> f32 {
        match self {
            Self::ReLU => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Sigmoid => {
                let s = 1.0 / (1.0 + (-x).exp());
                s * (1.0 - s)
            }
            Self::Tanh => {
                let t = x.tanh();
                1.0 - t * t
            }
        }
    }
}

impl Module for Activation {
    fn name(&self) -> &'static str {
        match self {
            Self::ReLU => "ReLU",
            Self::Sigmoid => "Sigmoid",
            Self::Tanh => "Tanh",
        }
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Activation(*self)
    }

    fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        Ok(x.mapv(|v| self.apply(v)))
    }

    fn backward(&self, input: &ArrayD<f32>, grad_output: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        if input.shape() != grad_output.shape() {
            return Err(AtribuirError::shape("activation gradient", input.shape(), grad_output.shape()));
        }
        // ∂L/∂x = ∂L/∂y * f'(x)
        Ok(input.mapv(|v| self.grad(v)) * grad_output)
    }
}

/// Collapse all non-batch axes into one feature axis.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flatten;

impl Module for Flatten {
    fn name(&self) -> &'static str {
        "Flatten"
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Reshape
    }

    fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        if x.ndim() < 2 {
            return Err(AtribuirError::shape("flatten input", &[0, 0], x.shape()));
        }
        let batch = x.shape()[0];
        let features: usize = x.shape()[1..].iter().product();
        let flat: Vec<f32> = x.iter().copied().collect();
        Ok(ArrayD::from_shape_vec(IxDyn(&[batch, features]), flat)?)
    }

    fn backward(&self, input: &ArrayD<f32>, grad_output: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        if grad_output.len() != input.len() {
            return Err(AtribuirError::shape("flatten gradient", input.shape(), grad_output.shape()));
        }
        let flat: Vec<f32> = grad_output.iter().copied().collect();
        Ok(ArrayD::from_shape_vec(input.raw_dim(), flat)?)
    }
}

/// Non-overlapping max pooling over the length axis (kernel == stride).
///
/// Usable for plain inference, but rejected by [`crate::DeepLiftShap`] at
/// construction: the rescale rule is not defined for non-linear pooling.
#[derive(Debug, Clone, Copy)]
pub struct MaxPool1d {
    kernel: usize,
}

impl MaxPool1d {
    /// Create a pooling layer with the given window width.
    pub fn new(kernel: usize) -> Result<Self> {
        if kernel == 0 {
            return Err(AtribuirError::Config {
                field: "kernel".into(),
                message: "pooling kernel must be at least 1".into(),
            });
        }
        Ok(Self { kernel })
    }
}

impl Module for MaxPool1d {
    fn name(&self) -> &'static str {
        "MaxPool1d"
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Pooling
    }

    fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x3 = x
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|_| AtribuirError::shape("maxpool input", &[0, 0, 0], x.shape()))?;
        let (batch, channels, l) = x3.dim();
        let l_out = l / self.kernel;
        let mut y = Array3::<f32>::zeros((batch, channels, l_out));
        for b in 0..batch {
            for c in 0..channels {
                for t in 0..l_out {
                    let window = x3.slice(ndarray::s![b, c, t * self.kernel..(t + 1) * self.kernel]);
                    y[[b, c, t]] = window.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                }
            }
        }
        Ok(y.into_dyn())
    }

    fn backward(&self, input: &ArrayD<f32>, grad_output: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x3 = input
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|_| AtribuirError::shape("maxpool input", &[0, 0, 0], input.shape()))?;
        let (batch, channels, l) = x3.dim();
        let l_out = l / self.kernel;
        let g3 = grad_output
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|_| AtribuirError::shape("maxpool gradient", &[batch, channels, l_out], grad_output.shape()))?;

        // Gradient flows only to the first maximum of each window.
        let mut dx = Array3::<f32>::zeros((batch, channels, l));
        for b in 0..batch {
            for c in 0..channels {
                for t in 0..l_out {
                    let start = t * self.kernel;
                    let mut best = start;
                    for s in start..start + self.kernel {
                        if x3[[b, c, s]] > x3[[b, c, best]] {
                            best = s;
                        }
                    }
                    dx[[b, c, best]] += g3[[b, c, t]];
                }
            }
        }
        Ok(dx.into_dyn())
    }
}
