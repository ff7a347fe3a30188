//! Hook registry: per-layer interception of forward and backward events.
//!
//! Consumers register observers against a layer index and get back a
//! [`HookHandle`] they must use to remove the registration. The registry is
//! interior-mutable so hooks can be attached to a shared `&Model`, and is
//! intentionally not thread-safe: a hook set describes exactly one
//! attribution call in flight.

use crate::nn::LayerId;
use ndarray::ArrayD;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

/// Observes a layer's input before the layer runs.
pub type ForwardPreHook = Box<dyn Fn(LayerId, &ArrayD<f32>)>;

/// Observes a layer's input and output after the layer runs.
pub type ForwardHook = Box<dyn Fn(LayerId, &ArrayD<f32>, &ArrayD<f32>)>;

/// Rewrites a layer's input gradient. Receives the native gradient and the
/// incoming output gradient; returning `Some` replaces the native gradient.
pub type BackwardHook = Box<dyn Fn(LayerId, &ArrayD<f32>, &ArrayD<f32>) -> Option<ArrayD<f32>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HookKind {
    ForwardPre,
    Forward,
    Backward,
}

/// Opaque release token returned by registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookHandle {
    kind: HookKind,
    id: u64,
}

/// Interception slots for one model.
#[derive(Default)]
pub struct HookRegistry {
    next_id: Cell<u64>,
    forward_pre: RefCell<BTreeMap<u64, (LayerId, ForwardPreHook)>>,
    forward: RefCell<BTreeMap<u64, (LayerId, ForwardHook)>>,
    backward: RefCell<BTreeMap<u64, (LayerId, BackwardHook)>>,
}

impl HookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// Register a forward-pre observer on `layer`.
    pub fn register_forward_pre(&self, layer: LayerId, hook: ForwardPreHook) -> HookHandle {
        let id = self.next();
        self.forward_pre.borrow_mut().insert(id, (layer, hook));
        HookHandle { kind: HookKind::ForwardPre, id }
    }

    /// Register a forward observer on `layer`.
    pub fn register_forward(&self, layer: LayerId, hook: ForwardHook) -> HookHandle {
        let id = self.next();
        self.forward.borrow_mut().insert(id, (layer, hook));
        HookHandle { kind: HookKind::Forward, id }
    }

    /// Register a backward rewriter on `layer`.
    pub fn register_backward(&self, layer: LayerId, hook: BackwardHook) -> HookHandle {
        let id = self.next();
        self.backward.borrow_mut().insert(id, (layer, hook));
        HookHandle { kind: HookKind::Backward, id }
    }

    /// Remove a registration. Unknown handles are ignored so teardown is
    /// idempotent.
    pub fn remove(&self, handle: HookHandle) {
        match handle.kind {
            HookKind::ForwardPre => {
                self.forward_pre.borrow_mut().remove(&handle.id);
            }
            HookKind::Forward => {
                self.forward.borrow_mut().remove(&handle.id);
            }
            HookKind::Backward => {
                self.backward.borrow_mut().remove(&handle.id);
            }
        }
    }

    /// Whether `layer` already has a backward rewriter registered.
    pub fn has_backward(&self, layer: LayerId) -> bool {
        self.backward.borrow().values().any(|(l, _)| *l == layer)
    }

    /// Whether the registry holds no registrations at all.
    pub fn is_empty(&self) -> bool {
        self.forward_pre.borrow().is_empty()
            && self.forward.borrow().is_empty()
            && self.backward.borrow().is_empty()
    }

    /// Total number of live registrations.
    pub fn len(&self) -> usize {
        self.forward_pre.borrow().len() + self.forward.borrow().len() + self.backward.borrow().len()
    }

    pub(crate) fn fire_forward_pre(&self, layer: LayerId, input: &ArrayD<f32>) {
        for (l, hook) in self.forward_pre.borrow().values() {
            if *l == layer {
                hook(layer, input);
            }
        }
    }

    pub(crate) fn fire_forward(&self, layer: LayerId, input: &ArrayD<f32>, output: &ArrayD<f32>) {
        for (l, hook) in self.forward.borrow().values() {
            if *l == layer {
                hook(layer, input, output);
            }
        }
    }

    /// Run backward rewriters for `layer` in registration order. Each hook
    /// sees the latest gradient; `None` means the current one stands.
    pub(crate) fn fire_backward(
        &self,
        layer: LayerId,
        native: &ArrayD<f32>,
        grad_output: &ArrayD<f32>,
    ) -> Option<ArrayD<f32>> {
        let mut current: Option<ArrayD<f32>> = None;
        for (l, hook) in self.backward.borrow().values() {
            if *l == layer {
                let grad_in = current.as_ref().unwrap_or(native);
                if let Some(rewritten) = hook(layer, grad_in, grad_output) {
                    current = Some(rewritten);
                }
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;
    use std::rc::Rc;

    fn dummy() -> ArrayD<f32> {
        ArrayD::zeros(ndarray::IxDyn(&[1, 1]))
    }

    #[test]
    fn test_register_and_remove() {
        let registry = HookRegistry::new();
        assert!(registry.is_empty());

        let h = registry.register_forward_pre(0, Box::new(|_, _| {}));
        assert_eq!(registry.len(), 1);

        registry.remove(h);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = HookRegistry::new();
        let h = registry.register_backward(2, Box::new(|_, _, _| None));
        registry.remove(h);
        registry.remove(h);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_has_backward_is_per_layer() {
        let registry = HookRegistry::new();
        registry.register_backward(3, Box::new(|_, _, _| None));
        assert!(registry.has_backward(3));
        assert!(!registry.has_backward(0));
    }

    #[test]
    fn test_fire_forward_pre_targets_one_layer() {
        let registry = HookRegistry::new();
        let seen = Rc::new(std::cell::Cell::new(0usize));

        let seen_ = Rc::clone(&seen);
        registry.register_forward_pre(1, Box::new(move |_, _| seen_.set(seen_.get() + 1)));

        registry.fire_forward_pre(0, &dummy());
        assert_eq!(seen.get(), 0);
        registry.fire_forward_pre(1, &dummy());
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn test_fire_backward_none_keeps_native() {
        let registry = HookRegistry::new();
        registry.register_backward(0, Box::new(|_, _, _| None));
        assert!(registry.fire_backward(0, &dummy(), &dummy()).is_none());
    }

    #[test]
    fn test_fire_backward_replacement_chains() {
        let registry = HookRegistry::new();
        registry.register_backward(0, Box::new(|_, g, _| Some(g + 1.0)));
        registry.register_backward(0, Box::new(|_, g, _| Some(g * 2.0)));

        let rewritten = registry.fire_backward(0, &dummy(), &dummy()).unwrap();
        // (0 + 1) * 2, in registration order
        assert_eq!(rewritten[[0, 0]], 2.0);
    }
}
