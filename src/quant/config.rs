//! Per-tensor quantization settings

use super::GroupSize;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Highest bit width that is still treated as quantized
pub const MAX_QUANT_BITS: u32 = 8;

/// Precision used to store quantization scales
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDtype {
    #[default]
    #[serde(alias = "float16", alias = "half")]
    Fp16,
    #[serde(alias = "bfloat16")]
    Bf16,
    #[serde(alias = "float32", alias = "float")]
    Fp32,
}

impl ScaleDtype {
    /// Round a scale to this precision
    pub fn round(self, value: f32) -> f32 {
        match self {
            ScaleDtype::Fp16 => half::f16::from_f32(value).to_f32(),
            ScaleDtype::Bf16 => half::bf16::from_f32(value).to_f32(),
            ScaleDtype::Fp32 => value,
        }
    }
}

/// Quantization settings of one weight tensor
///
/// Immutable once tuning of that tensor starts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantConfig {
    /// Weight bit width (`> 8` means the tensor stays in float)
    pub bits: u32,
    /// Weight group size
    pub group_size: GroupSize,
    /// Symmetric weight quantization
    pub sym: bool,
    /// Weight data type tag (`int`)
    pub data_type: String,
    /// Precision of the stored scales
    pub scale_dtype: ScaleDtype,
    /// Activation bit width
    pub act_bits: u32,
    /// Activation group size
    pub act_group_size: GroupSize,
    /// Symmetric activation quantization
    pub act_sym: bool,
    /// Dynamic activation quantization
    pub act_dynamic: bool,
}

impl QuantConfig {
    /// Weight-only config with activations left in float
    pub fn new(bits: u32, group_size: GroupSize, sym: bool) -> Self {
        Self {
            bits,
            group_size,
            sym,
            data_type: "int".to_string(),
            scale_dtype: ScaleDtype::Fp16,
            act_bits: 32,
            act_group_size: group_size,
            act_sym: sym,
            act_dynamic: true,
        }
    }

    /// Config of a layer that is kept in float
    pub fn unquantized() -> Self {
        Self::new(32, GroupSize::PerChannel, false)
    }

    /// Reject non-positive bit widths
    pub fn validate(&self) -> Result<()> {
        if self.bits == 0 {
            return Err(Error::InvalidParameter("bits must be positive".into()));
        }
        if self.act_bits == 0 {
            return Err(Error::InvalidParameter("act_bits must be positive".into()));
        }
        Ok(())
    }

    /// Whether the weight takes part in tuning
    pub fn is_quantized(&self) -> bool {
        self.bits <= MAX_QUANT_BITS
    }

    /// Largest integer level, `2^bits - 1`
    pub fn maxq(&self) -> f32 {
        ((1u64 << self.bits.min(32)) - 1) as f32
    }
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self::new(4, GroupSize::default(), false)
    }
}
