//! Exporter interface and the built-in `qdq` exporter

use super::format::{ExportConfig, QDQ_FORMAT, WEIGHTS_FILE};
use super::model::{ExportMetadata, QuantizationFile};
use super::save::{save_quantization_config, save_weights};
use crate::model::QuantModel;
use crate::quant::LayerConfigMap;
use crate::Result;
use std::path::{Path, PathBuf};
use tracing::info;

/// Writes a quantized model to disk in one named format
pub trait Exporter {
    /// Format name, e.g. `qdq`
    fn format(&self) -> &str;

    /// Write the artifact into `output_dir`; returns the files written
    fn export(
        &self,
        model: &dyn QuantModel,
        layer_config: &LayerConfigMap,
        metadata: &ExportMetadata,
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>>;
}

/// Fold-in weights as safetensors next to the layer config map
#[derive(Debug, Clone, Default)]
pub struct QdqExporter {
    config: ExportConfig,
}

impl QdqExporter {
    pub fn new(config: ExportConfig) -> Self {
        Self { config }
    }
}

impl Exporter for QdqExporter {
    fn format(&self) -> &str {
        QDQ_FORMAT
    }

    fn export(
        &self,
        model: &dyn QuantModel,
        layer_config: &LayerConfigMap,
        metadata: &ExportMetadata,
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(output_dir)?;
        let weights = output_dir.join(WEIGHTS_FILE);
        save_weights(model, &weights, metadata)?;

        let config = output_dir.join(self.config.config_file_name());
        let file = QuantizationFile::new(metadata.clone(), layer_config.clone());
        save_quantization_config(&file, &config, self.config.pretty)?;

        info!("saved quantized model to {}", output_dir.display());
        Ok(vec![weights, config])
    }
}
