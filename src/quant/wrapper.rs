//! Learnable quantization state of linear layers
//!
//! A [`WeightWrapper`] owns a frozen copy of one layer's weight together with
//! its quantization config. The learnable tensors (rounding values and
//! per-group min/max scales) live in the [`WrapperRegistry`] in three flat
//! parameter groups so optimizers can step them as plain tensor slices.

use super::{fake_quantize, quantize_dequantize, GroupLayout, QuantConfig};
use crate::autograd::{linear, Tensor};
use crate::model::Linear;
use crate::{Error, Result};
use ndarray::Array1;
use std::collections::HashMap;

/// Frozen weight of a layer under tuning
#[derive(Clone, Debug)]
pub struct WeightWrapper {
    name: String,
    weight: Array1<f32>,
    bias: Option<Tensor>,
    in_features: usize,
    out_features: usize,
    layout: GroupLayout,
    config: QuantConfig,
}

impl WeightWrapper {
    /// Wrap a linear layer; rejects invalid bit widths
    pub fn new(name: &str, layer: &Linear, config: QuantConfig) -> Result<Self> {
        config.validate()?;
        let (out_features, in_features) = layer.weight.dim();
        Ok(Self {
            name: name.to_string(),
            weight: layer.weight.iter().copied().collect(),
            bias: layer.bias.as_ref().map(|b| Tensor::new(b.clone(), false)),
            in_features,
            out_features,
            layout: GroupLayout::new(out_features, in_features, config.group_size),
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QuantConfig {
        &self.config
    }

    pub fn layout(&self) -> GroupLayout {
        self.layout
    }
}

/// Best-known learnable values of every wrapped layer
#[derive(Clone, Debug, PartialEq)]
pub struct WrapperSnapshot {
    pub layers: Vec<LayerSnapshot>,
}

/// Learnable values of one layer
#[derive(Clone, Debug, PartialEq)]
pub struct LayerSnapshot {
    pub name: String,
    pub rounding: Array1<f32>,
    pub min_scale: Array1<f32>,
    pub max_scale: Array1<f32>,
}

/// Final representation of a tuned layer
#[derive(Clone, Debug)]
pub struct QuantizedLinear {
    pub name: String,
    /// Quantize-dequantized weight (out_features × in_features, row-major)
    pub weight: Array1<f32>,
    pub scales: Vec<f32>,
    pub zero_points: Vec<i32>,
    pub config: QuantConfig,
    pub layout: GroupLayout,
}

/// Registry of wrapped layers keyed by layer name
///
/// Wrapping never touches the model; the wrapped forward is reached through
/// [`WrapperRegistry::forward`] and the model weight only changes when the
/// folded result of [`WrapperRegistry::unwrap`] is written back.
#[derive(Debug, Default)]
pub struct WrapperRegistry {
    wrappers: Vec<WeightWrapper>,
    index: HashMap<String, usize>,
    rounding: Vec<Tensor>,
    min_scales: Vec<Tensor>,
    max_scales: Vec<Tensor>,
    minmax_tuning: bool,
}

impl WrapperRegistry {
    /// Create an empty registry
    ///
    /// # Arguments
    /// * `minmax_tuning` - Whether min/max scales are learnable
    pub fn new(minmax_tuning: bool) -> Self {
        Self {
            minmax_tuning,
            ..Self::default()
        }
    }

    /// Wrap a layer with zero rounding values and unit scales
    pub fn wrap(&mut self, name: &str, layer: &Linear, config: QuantConfig) -> Result<()> {
        if self.index.contains_key(name) {
            return Err(Error::InvalidParameter(format!("layer {name} wrapped twice")));
        }
        let wrapper = WeightWrapper::new(name, layer, config)?;
        let groups = wrapper.layout.num_groups();
        self.rounding.push(Tensor::zeros(wrapper.weight.len(), true));
        self.min_scales.push(Tensor::ones(groups, self.minmax_tuning));
        self.max_scales.push(Tensor::ones(groups, self.minmax_tuning));
        self.index.insert(name.to_string(), self.wrappers.len());
        self.wrappers.push(wrapper);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.wrappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wrappers.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Names of wrapped layers in wrapping order
    pub fn names(&self) -> Vec<String> {
        self.wrappers.iter().map(|w| w.name.clone()).collect()
    }

    pub fn wrappers(&self) -> &[WeightWrapper] {
        &self.wrappers
    }

    /// Number of tensors the optimizer will update
    pub fn num_trainable(&self) -> usize {
        if self.minmax_tuning {
            self.rounding.len() * 3
        } else {
            self.rounding.len()
        }
    }

    /// Whether min/max scales are learnable
    pub fn minmax_tuning(&self) -> bool {
        self.minmax_tuning
    }

    /// Fake-quantized forward of a wrapped layer
    pub fn forward(&self, name: &str, x: &Tensor) -> Result<Tensor> {
        let &i = self
            .index
            .get(name)
            .ok_or_else(|| Error::LayerNotFound(name.to_string()))?;
        let wrapper = &self.wrappers[i];
        let weight = fake_quantize(
            &wrapper.weight,
            &self.rounding[i],
            &self.min_scales[i],
            &self.max_scales[i],
            wrapper.layout,
            &wrapper.config,
        )?;
        linear(
            x,
            &weight,
            wrapper.bias.as_ref(),
            wrapper.in_features,
            wrapper.out_features,
        )
    }

    /// Clamp min/max scales into `[0, 1]`
    pub fn clamp_scales(&mut self) {
        for t in self.min_scales.iter_mut().chain(self.max_scales.iter_mut()) {
            t.data_mut().mapv_inplace(|x| x.clamp(0.0, 1.0));
        }
    }

    /// Rounding values, the first optimizer parameter group
    pub fn rounding_params(&mut self) -> &mut [Tensor] {
        &mut self.rounding
    }

    /// Min and max scales, optimized with their own learning rate
    pub fn scale_params(&mut self) -> (&mut [Tensor], &mut [Tensor]) {
        (&mut self.min_scales, &mut self.max_scales)
    }

    /// Drop all accumulated gradients
    pub fn zero_grad(&self) {
        for t in self
            .rounding
            .iter()
            .chain(&self.min_scales)
            .chain(&self.max_scales)
        {
            t.zero_grad();
        }
    }

    /// Copy of the current values, scales clamped into `[0, 1]`
    pub fn snapshot(&self) -> WrapperSnapshot {
        let clamp = |t: &Tensor| t.data().mapv(|x| x.clamp(0.0, 1.0));
        WrapperSnapshot {
            layers: self
                .wrappers
                .iter()
                .enumerate()
                .map(|(i, w)| LayerSnapshot {
                    name: w.name.clone(),
                    rounding: self.rounding[i].data().clone(),
                    min_scale: clamp(&self.min_scales[i]),
                    max_scale: clamp(&self.max_scales[i]),
                })
                .collect(),
        }
    }

    /// Overwrite the learnable values with a snapshot
    pub fn load_snapshot(&mut self, snapshot: &WrapperSnapshot) -> Result<()> {
        for layer in &snapshot.layers {
            let &i = self
                .index
                .get(&layer.name)
                .ok_or_else(|| Error::LayerNotFound(layer.name.clone()))?;
            if layer.rounding.len() != self.rounding[i].len()
                || layer.min_scale.len() != self.min_scales[i].len()
                || layer.max_scale.len() != self.max_scales[i].len()
            {
                return Err(Error::ShapeMismatch {
                    expected: vec![self.rounding[i].len(), self.min_scales[i].len()],
                    got: vec![layer.rounding.len(), layer.min_scale.len()],
                });
            }
            *self.rounding[i].data_mut() = layer.rounding.clone();
            *self.min_scales[i].data_mut() = layer.min_scale.clone();
            *self.max_scales[i].data_mut() = layer.max_scale.clone();
        }
        Ok(())
    }

    /// Fold the current (or given) values into final quantized weights
    ///
    /// Consumes the registry; the learnable tensors are discarded.
    pub fn unwrap(mut self, best: Option<&WrapperSnapshot>) -> Result<Vec<QuantizedLinear>> {
        if let Some(snapshot) = best {
            self.load_snapshot(snapshot)?;
        }
        self.clamp_scales();
        self.wrappers
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let qdq = quantize_dequantize(
                    &w.weight,
                    self.rounding[i].data(),
                    self.min_scales[i].data(),
                    self.max_scales[i].data(),
                    &w.layout,
                    &w.config,
                )?;
                Ok(QuantizedLinear {
                    name: w.name.clone(),
                    weight: qdq.values,
                    scales: qdq.scales,
                    zero_points: qdq.zero_points,
                    config: w.config.clone(),
                    layout: w.layout,
                })
            })
            .collect()
    }
}
