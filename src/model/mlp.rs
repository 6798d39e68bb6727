//! Reference decoder made of residual MLP blocks
//!
//! Small enough for tests and benchmarks, shaped like a real decoder:
//! token embedding, a stack of `model.layers.{i}` blocks and an `lm_head`
//! projection that sits outside the blocks.

use super::{
    Block, Device, ForwardHooks, HookedExec, Linear, LinearExec, QuantModel, SampleContext,
    TokenSample,
};
use crate::autograd::{add, gelu, mul, Tensor};
use crate::{Error, Result};
use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng};
use std::ops::ControlFlow;

/// Name of the output projection
pub const LM_HEAD: &str = "lm_head";

fn init_linear(rng: &mut impl Rng, in_features: usize, out_features: usize) -> Linear {
    let bound = 1.0 / (in_features.max(1) as f32).sqrt();
    let weight = Array2::from_shape_simple_fn((out_features, in_features), || {
        (rng.random::<f32>() * 2.0 - 1.0) * bound
    });
    let bias = Array1::from_shape_simple_fn(out_features, || {
        (rng.random::<f32>() * 2.0 - 1.0) * bound * 0.1
    });
    Linear::new(weight, Some(bias))
}

/// `h + mask ⊙ down(gelu(up(h)))`
#[derive(Clone, Debug)]
pub struct MlpBlock {
    name: String,
    up_name: String,
    down_name: String,
    hidden_size: usize,
    up: Linear,
    down: Linear,
}

impl MlpBlock {
    pub fn new(name: &str, up: Linear, down: Linear) -> Result<Self> {
        if up.out_features() != down.in_features() || up.in_features() != down.out_features() {
            return Err(Error::ShapeMismatch {
                expected: vec![up.in_features(), up.out_features()],
                got: vec![down.out_features(), down.in_features()],
            });
        }
        Ok(Self {
            name: name.to_string(),
            up_name: format!("{name}.mlp.up_proj"),
            down_name: format!("{name}.mlp.down_proj"),
            hidden_size: up.in_features(),
            up,
            down,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn mask_tensor(&self, ctx: &SampleContext, rows: usize) -> Result<Option<Tensor>> {
        let Some(mask) = ctx.attention_mask.as_ref() else {
            return Ok(None);
        };
        if mask.len() != rows {
            return Err(Error::ShapeMismatch {
                expected: vec![rows],
                got: vec![mask.len()],
            });
        }
        let expanded: Array1<f32> = mask
            .iter()
            .flat_map(|&m| std::iter::repeat(m).take(self.hidden_size))
            .collect();
        Ok(Some(Tensor::new(expanded, false)))
    }
}

impl Block for MlpBlock {
    fn name(&self) -> &str {
        &self.name
    }

    fn linear_names(&self) -> Vec<String> {
        vec![self.up_name.clone(), self.down_name.clone()]
    }

    fn linear(&self, name: &str) -> Option<&Linear> {
        if name == self.up_name {
            Some(&self.up)
        } else if name == self.down_name {
            Some(&self.down)
        } else {
            None
        }
    }

    fn linear_mut(&mut self, name: &str) -> Option<&mut Linear> {
        if name == self.up_name {
            Some(&mut self.up)
        } else if name == self.down_name {
            Some(&mut self.down)
        } else {
            None
        }
    }

    fn forward(
        &self,
        hidden: &Tensor,
        ctx: &SampleContext,
        exec: &mut dyn LinearExec,
    ) -> Result<Tensor> {
        if hidden.len() % self.hidden_size != 0 {
            return Err(Error::ShapeMismatch {
                expected: vec![self.hidden_size],
                got: vec![hidden.len()],
            });
        }
        let rows = hidden.len() / self.hidden_size;
        let up = exec.linear(&self.up_name, &self.up, hidden)?;
        let down = exec.linear(&self.down_name, &self.down, &gelu(&up))?;
        let update = match self.mask_tensor(ctx, rows)? {
            Some(mask) => mul(&down, &mask),
            None => down,
        };
        Ok(add(hidden, &update))
    }
}

/// Embedding, MLP blocks and an output head
#[derive(Clone, Debug)]
pub struct SequentialModel {
    embedding: Array2<f32>,
    blocks: Vec<MlpBlock>,
    lm_head: Linear,
    device: Device,
    accelerator_capacity: Option<usize>,
}

impl SequentialModel {
    /// Randomly initialised model with a reproducible seed
    pub fn new(
        vocab_size: usize,
        hidden_size: usize,
        intermediate_size: usize,
        num_blocks: usize,
        seed: u64,
    ) -> Result<Self> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let embedding =
            Array2::from_shape_simple_fn((vocab_size, hidden_size), || rng.random::<f32>() - 0.5);
        let blocks = (0..num_blocks)
            .map(|i| {
                let up = init_linear(&mut rng, hidden_size, intermediate_size);
                let down = init_linear(&mut rng, intermediate_size, hidden_size);
                MlpBlock::new(&format!("model.layers.{i}"), up, down)
            })
            .collect::<Result<Vec<_>>>()?;
        let lm_head = init_linear(&mut rng, hidden_size, vocab_size);
        Ok(Self {
            embedding,
            blocks,
            lm_head,
            device: Device::Cpu,
            accelerator_capacity: None,
        })
    }

    /// Place the model on an accelerator with a bounded activation budget
    pub fn with_accelerator(mut self, capacity_bytes: usize) -> Self {
        self.device = Device::Accelerator(0);
        self.accelerator_capacity = Some(capacity_bytes);
        self
    }

    pub fn hidden_size(&self) -> usize {
        self.embedding.ncols()
    }

    pub fn vocab_size(&self) -> usize {
        self.embedding.nrows()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn embed(&self, input_ids: &[u32]) -> Result<Array2<f32>> {
        let mut hidden = Array2::zeros((input_ids.len(), self.hidden_size()));
        for (row, &id) in input_ids.iter().enumerate() {
            let id = id as usize;
            if id >= self.vocab_size() {
                return Err(Error::Forward(format!(
                    "token id {id} outside vocabulary of {}",
                    self.vocab_size()
                )));
            }
            hidden.row_mut(row).assign(&self.embedding.row(id));
        }
        Ok(hidden)
    }
}

impl QuantModel for SequentialModel {
    fn block_groups(&self) -> Vec<Vec<String>> {
        vec![self.blocks.iter().map(|b| b.name.clone()).collect()]
    }

    fn block(&self, name: &str) -> Option<&dyn Block> {
        self.blocks
            .iter()
            .find(|b| b.name == name)
            .map(|b| b as &dyn Block)
    }

    fn block_mut(&mut self, name: &str) -> Option<&mut dyn Block> {
        self.blocks
            .iter_mut()
            .find(|b| b.name == name)
            .map(|b| b as &mut dyn Block)
    }

    fn linear_names(&self) -> Vec<String> {
        self.blocks
            .iter()
            .flat_map(|b| b.linear_names())
            .chain(std::iter::once(LM_HEAD.to_string()))
            .collect()
    }

    fn linear(&self, name: &str) -> Option<&Linear> {
        if name == LM_HEAD {
            return Some(&self.lm_head);
        }
        self.blocks.iter().find_map(|b| b.linear(name))
    }

    fn linear_mut(&mut self, name: &str) -> Option<&mut Linear> {
        if name == LM_HEAD {
            return Some(&mut self.lm_head);
        }
        self.blocks.iter_mut().find_map(|b| b.linear_mut(name))
    }

    fn device(&self) -> Device {
        self.device
    }

    fn to_device(&mut self, device: Device) -> Result<()> {
        self.device = device;
        Ok(())
    }

    fn memory_capacity(&self) -> Option<usize> {
        match self.device {
            Device::Cpu => None,
            Device::Accelerator(_) => self.accelerator_capacity,
        }
    }

    fn forward_with_hooks(
        &self,
        sample: &TokenSample,
        hooks: &mut dyn ForwardHooks,
    ) -> Result<ControlFlow<(), Array2<f32>>> {
        let mut hidden = self.embed(&sample.input_ids)?;
        let rows = hidden.nrows();
        let ctx = SampleContext::for_sample(sample);
        let mut exec = HookedExec::new(hooks);

        for block in &self.blocks {
            if exec.hooks().before_block(&block.name, &hidden, &ctx)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
            let out = block.forward(&Tensor::from_array2(&hidden, false), &ctx, &mut exec)?;
            hidden = out.to_array2(rows, self.hidden_size())?;
            if exec.stop_requested() {
                return Ok(ControlFlow::Break(()));
            }
        }

        let logits = exec.linear(LM_HEAD, &self.lm_head, &Tensor::from_array2(&hidden, false))?;
        if exec.stop_requested() {
            return Ok(ControlFlow::Break(()));
        }
        Ok(ControlFlow::Continue(
            logits.to_array2(rows, self.vocab_size())?,
        ))
    }
}
