//! Integration tests for the export module

use super::*;
use crate::model::{QuantModel, SequentialModel};
use crate::quant::{GroupSize, LayerConfigMap, QuantConfig, WrapperRegistry};
use approx::assert_abs_diff_eq;
use tempfile::TempDir;

/// Round-to-nearest fold of every block layer, written back into the model
fn rtn_model() -> (SequentialModel, LayerConfigMap) {
    let mut model = SequentialModel::new(9, 8, 8, 2, 21).unwrap();
    let mut registry = WrapperRegistry::new(true);
    for name in model.linear_names() {
        if name.starts_with("model.layers.") {
            let config = QuantConfig::new(4, GroupSize::Size(4), false);
            registry.wrap(&name, model.linear(&name).unwrap(), config).unwrap();
        }
    }
    let mut layer_config = LayerConfigMap::new();
    for layer in registry.unwrap(None).unwrap() {
        model
            .linear_mut(&layer.name)
            .unwrap()
            .set_weight_flat(&layer.weight)
            .unwrap();
        layer_config.record(&layer);
    }
    layer_config.finalize("float");
    (model, layer_config)
}

#[test]
fn test_qdq_export_json_workflow() {
    let (model, layer_config) = rtn_model();
    let dir = TempDir::new().unwrap();
    let metadata = ExportMetadata::new(QDQ_FORMAT)
        .with_model_name(Some("toy".to_string()))
        .with_serialization(crate::config::AutoRoundConfig::default().serialization_dict());

    let exporter = QdqExporter::default();
    assert_eq!(exporter.format(), "qdq");
    let files = exporter
        .export(&model, &layer_config, &metadata, &dir.path().join("out"))
        .unwrap();
    assert_eq!(files.len(), 2);
    assert!(files[0].ends_with(WEIGHTS_FILE));
    assert!(files[1].ends_with("quantization_config.json"));

    let loaded = load_quantization_config(&files[1]).unwrap();
    assert_eq!(loaded.layer_config, layer_config);
    assert_eq!(loaded.metadata.model_name.as_deref(), Some("toy"));
    assert_eq!(loaded.metadata.serialization["bits"], serde_json::json!(4));

    let info = loaded.layer_config.get("model.layers.0.mlp.up_proj").unwrap();
    // 8 rows with two groups of 4 columns each
    assert_eq!(info.scale.as_ref().unwrap().len(), 16);

    let mut fresh = SequentialModel::new(9, 8, 8, 2, 5).unwrap();
    apply_weights(&mut fresh, &load_weights(&files[0]).unwrap()).unwrap();
    for name in model.linear_names() {
        let expected = &model.linear(&name).unwrap().weight;
        let got = &fresh.linear(&name).unwrap().weight;
        for (a, b) in expected.iter().zip(got.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 0.0);
        }
    }
}

#[test]
fn test_qdq_export_yaml_workflow() {
    let (model, layer_config) = rtn_model();
    let dir = TempDir::new().unwrap();
    let exporter = QdqExporter::new(ExportConfig::new(MetadataFormat::Yaml));
    let files = exporter
        .export(&model, &layer_config, &ExportMetadata::new(QDQ_FORMAT), dir.path())
        .unwrap();
    assert!(files[1].ends_with("quantization_config.yaml"));

    let loaded = load_quantization_config(&files[1]).unwrap();
    let head = loaded.layer_config.get(crate::model::LM_HEAD);
    // the head was never configured, so it is not part of the map
    assert!(head.is_none());
    assert_eq!(loaded.layer_config.len(), 4);
}
