//! Export of quantized models
//!
//! The built-in `qdq` format stores the quantize-dequantized weights as
//! safetensors and the per-layer metadata (scales, zero points, bit widths)
//! with the tuning keys as JSON or YAML. Other formats plug in through the
//! [`Exporter`] trait.

mod export;
mod format;
mod load;
mod model;
mod save;

#[cfg(test)]
mod tests;

pub use export::{Exporter, QdqExporter};
pub use format::{ExportConfig, MetadataFormat, CONFIG_STEM, QDQ_FORMAT, WEIGHTS_FILE};
pub use load::{apply_weights, load_quantization_config, load_weights, WeightFile};
pub use model::{ExportMetadata, QuantizationFile};
pub use save::{save_quantization_config, save_weights};
