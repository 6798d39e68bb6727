//! Model abstraction consumed by the quantization pipeline
//!
//! Architecture introspection stays with the model: it reports its ordered
//! block groups and linear layer names, hands out blocks by name and runs a
//! hooked forward for calibration capture.

mod block;
mod context;
mod device;
mod exec;
mod linear;
mod mlp;

pub use block::{Block, BlockSequence};
pub use context::{SampleContext, TokenSample};
pub use device::{Device, Precision};
pub use exec::{HookedExec, LinearExec, PlainExec, QuantExec};
pub use linear::Linear;
pub use mlp::{MlpBlock, SequentialModel, LM_HEAD};

use crate::Result;
use ndarray::Array2;
use std::ops::ControlFlow;

/// Interception points of a hooked forward
///
/// Returning `Break` asks the model to stop the forward early; it is a
/// control signal, not an error.
pub trait ForwardHooks {
    /// Called with the hidden state entering a block
    fn before_block(
        &mut self,
        _name: &str,
        _hidden: &Array2<f32>,
        _ctx: &SampleContext,
    ) -> Result<ControlFlow<()>> {
        Ok(ControlFlow::Continue(()))
    }

    /// Called with the `rows × in_features` input of a linear layer
    fn before_linear(&mut self, _name: &str, _input: &Array2<f32>) -> Result<ControlFlow<()>> {
        Ok(ControlFlow::Continue(()))
    }
}

/// Hooks that observe nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHooks;

impl ForwardHooks for NoHooks {}

/// A model that can be quantized block by block
pub trait QuantModel {
    /// Ordered groups of block names; usually a single group
    fn block_groups(&self) -> Vec<Vec<String>>;

    fn block(&self, name: &str) -> Option<&dyn Block>;

    fn block_mut(&mut self, name: &str) -> Option<&mut dyn Block>;

    /// Every quantizable linear layer, inside blocks or not
    fn linear_names(&self) -> Vec<String>;

    fn linear(&self, name: &str) -> Option<&Linear>;

    fn linear_mut(&mut self, name: &str) -> Option<&mut Linear>;

    fn device(&self) -> Device;

    fn to_device(&mut self, device: Device) -> Result<()>;

    /// Bytes available for cached activations on the current device
    fn memory_capacity(&self) -> Option<usize> {
        None
    }

    /// Return cached device memory after large passes
    fn release_device_cache(&mut self) {}

    /// Forward one sample, reporting intermediate inputs to `hooks`
    ///
    /// Returns `Break` when a hook stopped the pass early.
    fn forward_with_hooks(
        &self,
        sample: &TokenSample,
        hooks: &mut dyn ForwardHooks,
    ) -> Result<ControlFlow<(), Array2<f32>>>;

    /// Plain forward returning the model output
    fn forward(&self, sample: &TokenSample) -> Result<Array2<f32>> {
        match self.forward_with_hooks(sample, &mut NoHooks)? {
            ControlFlow::Continue(out) => Ok(out),
            ControlFlow::Break(()) => Err(crate::Error::Forward(
                "forward stopped without capture hooks".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests;
