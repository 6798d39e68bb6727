//! Per-layer quantization metadata
//!
//! Built from the defaults and per-layer overrides before tuning, filled with
//! scales/zero points as layers are folded, and finalized once at the end of
//! the run: layers that never received a scale are marked as float.

use super::{GroupSize, QuantConfig, QuantizedLinear, ScaleDtype, MAX_QUANT_BITS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Quantization metadata of one layer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerQuantInfo {
    pub data_type: String,
    pub bits: u32,
    /// `None` once the layer is marked as float
    pub group_size: Option<GroupSize>,
    /// `None` once the layer is marked as float
    pub sym: Option<bool>,
    pub scale_dtype: ScaleDtype,
    pub act_bits: u32,
    pub act_group_size: Option<GroupSize>,
    pub act_sym: Option<bool>,
    pub act_dynamic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zp: Option<Vec<i32>>,
}

impl LayerQuantInfo {
    pub fn from_config(config: &QuantConfig) -> Self {
        Self {
            data_type: config.data_type.clone(),
            bits: config.bits,
            group_size: Some(config.group_size),
            sym: Some(config.sym),
            scale_dtype: config.scale_dtype,
            act_bits: config.act_bits,
            act_group_size: Some(config.act_group_size),
            act_sym: Some(config.act_sym),
            act_dynamic: config.act_dynamic,
            scale: None,
            zp: None,
        }
    }

    /// Settings used to wrap the layer
    pub fn quant_config(&self) -> QuantConfig {
        let group_size = self.group_size.unwrap_or(GroupSize::PerChannel);
        QuantConfig {
            bits: self.bits,
            group_size,
            sym: self.sym.unwrap_or(false),
            data_type: self.data_type.clone(),
            scale_dtype: self.scale_dtype,
            act_bits: self.act_bits,
            act_group_size: self.act_group_size.unwrap_or(group_size),
            act_sym: self.act_sym.unwrap_or(false),
            act_dynamic: self.act_dynamic,
        }
    }

    /// Whether the layer takes part in tuning
    pub fn is_quantized(&self) -> bool {
        self.bits <= MAX_QUANT_BITS
    }

    /// Whether the layer was folded with a scale
    pub fn has_scale(&self) -> bool {
        self.scale.is_some()
    }
}

/// Ordered mapping from fully-qualified layer name to its metadata
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerConfigMap {
    layers: BTreeMap<String, LayerQuantInfo>,
}

impl LayerConfigMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, info: LayerQuantInfo) {
        self.layers.insert(name.into(), info);
    }

    pub fn get(&self, name: &str) -> Option<&LayerQuantInfo> {
        self.layers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.layers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &LayerQuantInfo)> {
        self.layers.iter()
    }

    /// Whether a layer is configured for tuning
    pub fn is_quantized(&self, name: &str) -> bool {
        self.layers.get(name).is_some_and(LayerQuantInfo::is_quantized)
    }

    /// Store the scale and zero point of a folded layer
    pub fn record(&mut self, layer: &QuantizedLinear) {
        let info = self
            .layers
            .entry(layer.name.clone())
            .or_insert_with(|| LayerQuantInfo::from_config(&layer.config));
        info.scale = Some(layer.scales.clone());
        info.zp = Some(layer.zero_points.clone());
    }

    /// Mark every layer without a scale as float
    ///
    /// # Arguments
    /// * `float_tag` - data type tag of float layers (`float` or `bfloat`)
    pub fn finalize(&mut self, float_tag: &str) {
        for info in self.layers.values_mut() {
            if info.has_scale() {
                continue;
            }
            info.data_type = float_tag.to_string();
            info.bits = 32;
            info.group_size = None;
            info.sym = None;
        }
    }

    /// `(quantized, unquantized)` layer names
    pub fn partition(&self) -> (Vec<String>, Vec<String>) {
        let (q, u): (Vec<_>, Vec<_>) = self.layers.iter().partition(|(_, info)| info.is_quantized());
        (
            q.into_iter().map(|(n, _)| n.clone()).collect(),
            u.into_iter().map(|(n, _)| n.clone()).collect(),
        )
    }
}
