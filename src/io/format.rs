//! Export format definitions

use serde::{Deserialize, Serialize};

/// Name of the built-in export format: fold-in weights plus layer metadata
pub const QDQ_FORMAT: &str = "qdq";

/// File holding the fold-in weights
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Stem of the file holding the layer config map
pub const CONFIG_STEM: &str = "quantization_config";

/// Text formats of the quantization metadata file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataFormat {
    #[default]
    Json,
    Yaml,
}

impl MetadataFormat {
    /// Get file extension for this format
    pub fn extension(&self) -> &str {
        match self {
            MetadataFormat::Json => "json",
            MetadataFormat::Yaml => "yaml",
        }
    }

    /// Detect format from file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "json" => Some(MetadataFormat::Json),
            "yaml" | "yml" => Some(MetadataFormat::Yaml),
            _ => None,
        }
    }
}

/// Configuration of the built-in exporter
#[derive(Debug, Clone, PartialEq)]
pub struct ExportConfig {
    pub metadata_format: MetadataFormat,

    /// Pretty-print JSON metadata
    pub pretty: bool,
}

impl ExportConfig {
    pub fn new(metadata_format: MetadataFormat) -> Self {
        Self {
            metadata_format,
            pretty: true,
        }
    }

    pub fn with_pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    /// File name of the metadata file, e.g. `quantization_config.json`
    pub fn config_file_name(&self) -> String {
        format!("{CONFIG_STEM}.{}", self.metadata_format.extension())
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self::new(MetadataFormat::Json)
    }
}
