//! Linear-layer executors
//!
//! Blocks never call their linear layers directly; they go through a
//! [`LinearExec`] so the same block code runs plain, fake-quantized from a
//! [`WrapperRegistry`], or under capture hooks.

use super::{ForwardHooks, Linear};
use crate::autograd::Tensor;
use crate::quant::WrapperRegistry;
use crate::Result;
use std::ops::ControlFlow;

/// Runs a named linear layer of a block
pub trait LinearExec {
    fn linear(&mut self, name: &str, layer: &Linear, x: &Tensor) -> Result<Tensor>;
}

/// Full-precision execution with the model's own weights
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainExec;

impl LinearExec for PlainExec {
    fn linear(&mut self, _name: &str, layer: &Linear, x: &Tensor) -> Result<Tensor> {
        layer.forward(x)
    }
}

/// Fake-quantized execution for wrapped layers, plain for the rest
#[derive(Clone, Copy, Debug)]
pub struct QuantExec<'a> {
    registry: &'a WrapperRegistry,
}

impl<'a> QuantExec<'a> {
    pub fn new(registry: &'a WrapperRegistry) -> Self {
        Self { registry }
    }
}

impl LinearExec for QuantExec<'_> {
    fn linear(&mut self, name: &str, layer: &Linear, x: &Tensor) -> Result<Tensor> {
        if self.registry.contains(name) {
            self.registry.forward(name, x)
        } else {
            layer.forward(x)
        }
    }
}

/// Plain execution that reports every layer input to capture hooks
///
/// A hook asking to stop only raises a flag: the current block finishes its
/// forward and the model checks [`HookedExec::stop_requested`] afterwards.
pub struct HookedExec<'h> {
    hooks: &'h mut dyn ForwardHooks,
    stop: bool,
}

impl<'h> HookedExec<'h> {
    pub fn new(hooks: &'h mut dyn ForwardHooks) -> Self {
        Self { hooks, stop: false }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop
    }

    pub fn hooks(&mut self) -> &mut dyn ForwardHooks {
        &mut *self.hooks
    }
}

impl LinearExec for HookedExec<'_> {
    fn linear(&mut self, name: &str, layer: &Linear, x: &Tensor) -> Result<Tensor> {
        if !self.stop {
            let rows = x.len() / layer.in_features().max(1);
            let input = x.to_array2(rows, layer.in_features())?;
            if let ControlFlow::Break(()) = self.hooks.before_linear(name, &input)? {
                self.stop = true;
            }
        }
        layer.forward(x)
    }
}
