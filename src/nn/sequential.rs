//! The model contract consumed by the attribution engine, and a sequential
//! layer stack implementing it.

use crate::error::{AtribuirError, Result};
use crate::nn::{Device, HookRegistry, Module};
use ndarray::ArrayD;

/// An opaque differentiable model.
///
/// The engine only needs three capabilities: enumerating layers, installing
/// interception hooks, and one combined forward+backward evaluation. A model
/// is borrowed for the duration of one attribution call; the caller must
/// leave the hook registry empty again on every exit path.
pub trait Model {
    /// The ordered layers of the model.
    fn layers(&self) -> &[Box<dyn Module>];

    /// Interception points for forward/backward events.
    fn hooks(&self) -> &HookRegistry;

    /// Move the model to a compute device. The bundled CPU model only
    /// accepts [`Device::Cpu`].
    fn prepare(&self, device: Device) -> Result<()>;

    /// Plain forward evaluation of a batch. `args` carries any extra
    /// positional inputs the model consumes alongside the sequence batch.
    fn forward(&self, x: &ArrayD<f32>, args: Option<&[ArrayD<f32>]>) -> Result<ArrayD<f32>>;

    /// One combined forward and backward pass.
    ///
    /// The forward sweep fires forward-pre and forward hooks at every layer.
    /// `seed` maps the final output to the gradient seeded at the output
    /// (typically d of the summed score column). The backward sweep then
    /// walks layers in reverse, computing each layer's native input gradient
    /// and letting a registered backward hook replace it. Returns the model
    /// output and the gradient with respect to `x`.
    fn forward_backward(
        &self,
        x: &ArrayD<f32>,
        args: Option<&[ArrayD<f32>]>,
        seed: &dyn Fn(&ArrayD<f32>) -> ArrayD<f32>,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>)>;
}

/// A model that applies its layers in order.
///
/// Extra forward `args` are accepted for interface compatibility but ignored;
/// a sequential stack consumes only the sequence batch.
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
    hooks: HookRegistry,
}

impl Sequential {
    /// Build a model from an ordered layer list.
    pub fn new(layers: Vec<Box<dyn Module>>) -> Result<Self> {
        if layers.is_empty() {
            return Err(AtribuirError::EmptyModel);
        }
        Ok(Self { layers, hooks: HookRegistry::new() })
    }
}

impl Model for Sequential {
    fn layers(&self) -> &[Box<dyn Module>] {
        &self.layers
    }

    fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    fn prepare(&self, device: Device) -> Result<()> {
        match device {
            Device::Cpu => Ok(()),
            other => Err(AtribuirError::UnsupportedDevice { device: other.to_string() }),
        }
    }

    fn forward(&self, x: &ArrayD<f32>, _args: Option<&[ArrayD<f32>]>) -> Result<ArrayD<f32>> {
        let mut current = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            self.hooks.fire_forward_pre(i, &current);
            let output = layer.forward(&current)?;
            self.hooks.fire_forward(i, &current, &output);
            current = output;
        }
        Ok(current)
    }

    fn forward_backward(
        &self,
        x: &ArrayD<f32>,
        _args: Option<&[ArrayD<f32>]>,
        seed: &dyn Fn(&ArrayD<f32>) -> ArrayD<f32>,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>)> {
        // Forward sweep, keeping each layer's input for the reverse sweep.
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut current = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            self.hooks.fire_forward_pre(i, &current);
            let output = layer.forward(&current)?;
            self.hooks.fire_forward(i, &current, &output);
            inputs.push(current);
            current = output;
        }
        let output = current;

        let mut grad = seed(&output);
        if grad.shape() != output.shape() {
            return Err(AtribuirError::shape("backward seed", output.shape(), grad.shape()));
        }

        for (i, layer) in self.layers.iter().enumerate().rev() {
            let native = layer.backward(&inputs[i], &grad)?;
            grad = self.hooks.fire_backward(i, &native, &grad).unwrap_or(native);
        }

        Ok((output, grad))
    }
}
