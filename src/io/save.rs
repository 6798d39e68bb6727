//! Writing fold-in weights and quantization metadata

use super::format::MetadataFormat;
use super::model::{ExportMetadata, QuantizationFile};
use crate::model::QuantModel;
use crate::{Error, Result};
use safetensors::tensor::{Dtype, TensorView};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Save every linear layer of `model` as safetensors
///
/// Weights are stored as `<layer>.weight` (`out × in`) and biases as
/// `<layer>.bias`; the header carries [`ExportMetadata::header`].
pub fn save_weights<M: QuantModel + ?Sized>(
    model: &M,
    path: impl AsRef<Path>,
    metadata: &ExportMetadata,
) -> Result<()> {
    let mut tensor_data: Vec<(String, Vec<u8>, Vec<usize>)> = Vec::new();
    for name in model.linear_names() {
        let layer = model
            .linear(&name)
            .ok_or_else(|| Error::LayerNotFound(name.clone()))?;
        let weight: Vec<f32> = layer.weight.iter().copied().collect();
        tensor_data.push((
            format!("{name}.weight"),
            bytemuck::cast_slice(&weight).to_vec(),
            vec![layer.out_features(), layer.in_features()],
        ));
        if let Some(bias) = &layer.bias {
            let bias: Vec<f32> = bias.iter().copied().collect();
            tensor_data.push((
                format!("{name}.bias"),
                bytemuck::cast_slice(&bias).to_vec(),
                vec![bias.len()],
            ));
        }
    }

    let views = tensor_data
        .iter()
        .map(|(name, bytes, shape)| {
            TensorView::new(Dtype::F32, shape.clone(), bytes)
                .map(|view| (name.as_str(), view))
                .map_err(|e| Error::Serialization(format!("invalid tensor {name}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let bytes = safetensors::serialize(views, &Some(metadata.header()))
        .map_err(|e| Error::Serialization(format!("SafeTensors serialization failed: {e}")))?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Save the layer config map and tuning keys; the format follows the file
/// extension
pub fn save_quantization_config(
    file: &QuantizationFile,
    path: impl AsRef<Path>,
    pretty: bool,
) -> Result<()> {
    let path = path.as_ref();
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Serialization("File has no extension".to_string()))?;
    let format = MetadataFormat::from_extension(ext)
        .ok_or_else(|| Error::Serialization(format!("Unsupported file extension: {ext}")))?;

    let data = match format {
        MetadataFormat::Json if pretty => serde_json::to_string_pretty(file)
            .map_err(|e| Error::Serialization(format!("JSON serialization failed: {e}")))?,
        MetadataFormat::Json => serde_json::to_string(file)
            .map_err(|e| Error::Serialization(format!("JSON serialization failed: {e}")))?,
        MetadataFormat::Yaml => serde_yaml::to_string(file)
            .map_err(|e| Error::Serialization(format!("YAML serialization failed: {e}")))?,
    };
    let mut out = File::create(path)?;
    out.write_all(data.as_bytes())?;
    Ok(())
}
