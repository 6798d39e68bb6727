//! Serializable description of an exported quantized model

use crate::quant::LayerConfigMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Provenance of an exported artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,

    /// Export format name, e.g. `qdq`
    pub export_format: String,

    pub created_at: DateTime<Utc>,

    /// Version of this crate that wrote the artifact
    pub library_version: String,

    /// Tuning keys the model was quantized with
    #[serde(default)]
    pub serialization: BTreeMap<String, serde_json::Value>,
}

impl ExportMetadata {
    pub fn new(export_format: impl Into<String>) -> Self {
        Self {
            model_name: None,
            export_format: export_format.into(),
            created_at: Utc::now(),
            library_version: env!("CARGO_PKG_VERSION").to_string(),
            serialization: BTreeMap::new(),
        }
    }

    pub fn with_model_name(mut self, name: Option<String>) -> Self {
        self.model_name = name;
        self
    }

    pub fn with_serialization(mut self, dict: BTreeMap<String, serde_json::Value>) -> Self {
        self.serialization = dict;
        self
    }

    /// String entries stored in the safetensors header
    pub fn header(&self) -> HashMap<String, String> {
        let mut header = HashMap::new();
        if let Some(name) = &self.model_name {
            header.insert("name".to_string(), name.clone());
        }
        header.insert("format".to_string(), self.export_format.clone());
        header.insert("created_at".to_string(), self.created_at.to_rfc3339());
        header.insert("version".to_string(), self.library_version.clone());
        header
    }
}

/// Contents of the quantization metadata file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationFile {
    pub metadata: ExportMetadata,
    pub layer_config: LayerConfigMap,
}

impl QuantizationFile {
    pub fn new(metadata: ExportMetadata, layer_config: LayerConfigMap) -> Self {
        Self {
            metadata,
            layer_config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_entries() {
        let meta = ExportMetadata::new("qdq").with_model_name(Some("toy".to_string()));
        let header = meta.header();
        assert_eq!(header["name"], "toy");
        assert_eq!(header["format"], "qdq");
        assert!(header["created_at"].parse::<DateTime<Utc>>().is_ok());
        assert_eq!(header["version"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_unnamed_header_has_no_name() {
        let header = ExportMetadata::new("qdq").header();
        assert!(!header.contains_key("name"));
    }
}
