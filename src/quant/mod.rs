//! Weight quantization
//!
//! - Group granularity and the per-tensor [`QuantConfig`]
//! - Differentiable fake quantization with learnable rounding values and
//!   min/max range factors (Straight-Through Estimator backward)
//! - Weight wrappers and the registry that holds their learnable state
//! - The per-layer quantization metadata map

mod config;
mod fake_quantize;
mod granularity;
mod layer_config;
mod wrapper;

pub use config::{QuantConfig, ScaleDtype, MAX_QUANT_BITS};
pub use fake_quantize::{
    fake_quantize, group_range, quantize_dequantize, quantize_rtn, GroupRange, QdqResult,
};
pub use granularity::{GroupLayout, GroupSize};
pub use layer_config::{LayerConfigMap, LayerQuantInfo};
pub use wrapper::{
    LayerSnapshot, QuantizedLinear, WeightWrapper, WrapperRegistry, WrapperSnapshot,
};
