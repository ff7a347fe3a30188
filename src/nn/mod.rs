//! Minimal neural-network surface consumed by the attribution engine.
//!
//! The engine treats the model as an opaque differentiable function that can
//! enumerate its layers and expose interception points for forward-input,
//! forward-output and backward-gradient events. Only the operations the
//! rescale rule is defined for are provided: dense and convolution layers
//! with pointwise nonlinearities, plus the reshape glue between them.
//! Max pooling exists as a layer type so the engine can reject it by
//! construction.

mod hooks;
mod layers;
mod sequential;

#[cfg(test)]
pub(crate) mod test_utils;

pub use hooks::{BackwardHook, ForwardHook, ForwardPreHook, HookHandle, HookRegistry};
pub use layers::{Activation, Conv1d, Dense, Flatten, MaxPool1d};
pub use sequential::{Model, Sequential};

use crate::error::Result;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// Index of a layer within its model, used as the layer identity for hooks
/// and capture tables.
pub type LayerId = usize;

/// Compute target, passed through to the model opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Device {
    /// Host CPU.
    #[default]
    Cpu,
    /// CUDA device by ordinal. Not supported by the bundled CPU model.
    Cuda(usize),
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

/// Structural classification of a layer, resolved once when the engine is
/// constructed instead of by per-event type introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// Dense or convolution layer; the chain rule is already exact here.
    Linear,
    /// Pointwise nonlinearity; candidate for the rescale-rule rewrite.
    Activation(Activation),
    /// Pure reshaping with no arithmetic.
    Reshape,
    /// Non-linear pooling; the rescale rule is undefined for these.
    Pooling,
}

/// A single differentiable layer.
///
/// `backward` computes the native chain-rule gradient with respect to the
/// layer input, given the input captured at forward time. Parameter
/// gradients are never needed for attribution.
pub trait Module {
    /// Human-readable layer name for diagnostics.
    fn name(&self) -> &'static str;

    /// Structural classification used for rescale eligibility.
    fn kind(&self) -> LayerKind;

    /// Forward evaluation.
    fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>>;

    /// Gradient of the loss with respect to the layer input.
    ///
    /// `input` must be the tensor that produced `grad_output`'s forward
    /// value; layers are stateless and recover everything they need from it.
    fn backward(&self, input: &ArrayD<f32>, grad_output: &ArrayD<f32>) -> Result<ArrayD<f32>>;
}
