//! Blocks and block sequences

use super::{LinearExec, Linear, Precision, QuantModel, SampleContext};
use crate::autograd::Tensor;
use crate::{Error, Result};
use ndarray::Array2;

/// One structural unit of the model whose output feeds the next block
pub trait Block {
    /// Fully-qualified block name, e.g. `model.layers.3`
    fn name(&self) -> &str;

    /// Fully-qualified names of the linear layers inside the block
    fn linear_names(&self) -> Vec<String>;

    fn linear(&self, name: &str) -> Option<&Linear>;

    fn linear_mut(&mut self, name: &str) -> Option<&mut Linear>;

    /// Forward a `seq_len × hidden` state stored row-major in `hidden`
    fn forward(
        &self,
        hidden: &Tensor,
        ctx: &SampleContext,
        exec: &mut dyn LinearExec,
    ) -> Result<Tensor>;
}

/// An ordered run of blocks forwarded as one unit
///
/// The empty sequence is the identity; it stands for a zero-length
/// attach-loss or observe segment.
#[derive(Clone, Default)]
pub struct BlockSequence<'m> {
    blocks: Vec<&'m dyn Block>,
}

impl<'m> BlockSequence<'m> {
    pub fn new(blocks: Vec<&'m dyn Block>) -> Self {
        Self { blocks }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Look the named blocks up in the model
    pub fn from_model<M: QuantModel + ?Sized>(model: &'m M, names: &[String]) -> Result<Self> {
        let blocks = names
            .iter()
            .map(|n| model.block(n).ok_or_else(|| Error::BlockNotFound(n.clone())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { blocks })
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.blocks.iter().map(|b| b.name().to_string()).collect()
    }

    /// Linear layer names of every block, in block order
    pub fn linear_names(&self) -> Vec<String> {
        self.blocks.iter().flat_map(|b| b.linear_names()).collect()
    }

    pub fn linear(&self, name: &str) -> Option<&'m Linear> {
        self.blocks.iter().copied().find_map(|b| b.linear(name))
    }

    pub fn forward(
        &self,
        hidden: &Tensor,
        ctx: &SampleContext,
        exec: &mut dyn LinearExec,
    ) -> Result<Tensor> {
        let mut out = hidden.clone();
        for block in &self.blocks {
            out = block.forward(&out, ctx, exec)?;
        }
        Ok(out)
    }

    /// Forward a single cached sample without gradient tracking
    pub fn forward_sample(
        &self,
        input: &Array2<f32>,
        ctx: &SampleContext,
        exec: &mut dyn LinearExec,
    ) -> Result<Array2<f32>> {
        if self.is_empty() {
            return Ok(input.clone());
        }
        let rows = input.nrows();
        let out = self.forward(&Tensor::from_array2(input, false), ctx, exec)?;
        if rows == 0 {
            return Ok(Array2::zeros((0, input.ncols())));
        }
        out.to_array2(rows, out.len() / rows)
    }

    /// Forward a whole activation stream, rounding outputs to `precision`
    pub fn forward_stream(
        &self,
        inputs: &[Array2<f32>],
        contexts: &[SampleContext],
        precision: Precision,
        exec: &mut dyn LinearExec,
    ) -> Result<Vec<Array2<f32>>> {
        if inputs.len() != contexts.len() {
            return Err(Error::ShapeMismatch {
                expected: vec![contexts.len()],
                got: vec![inputs.len()],
            });
        }
        inputs
            .iter()
            .zip(contexts)
            .map(|(input, ctx)| {
                let mut out = self.forward_sample(input, ctx, exec)?;
                precision.round_in_place(&mut out);
                Ok(out)
            })
            .collect()
    }
}

impl std::fmt::Debug for BlockSequence<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
