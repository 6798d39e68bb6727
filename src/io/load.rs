//! Reading exported artifacts back

use super::format::MetadataFormat;
use super::model::QuantizationFile;
use crate::model::QuantModel;
use crate::{Error, Result};
use ndarray::{ArrayD, Ix1, Ix2, IxDyn};
use safetensors::tensor::Dtype;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Tensors and header of a safetensors weight file
#[derive(Debug, Clone, Default)]
pub struct WeightFile {
    pub header: HashMap<String, String>,
    pub tensors: BTreeMap<String, ArrayD<f32>>,
}

/// Load an `f32` safetensors file
pub fn load_weights(path: impl AsRef<Path>) -> Result<WeightFile> {
    let data = std::fs::read(path.as_ref())
        .map_err(|e| Error::Serialization(format!("Failed to read file: {e}")))?;

    let (_, st_metadata) = safetensors::SafeTensors::read_metadata(&data)
        .map_err(|e| Error::Serialization(format!("SafeTensors parsing failed: {e}")))?;
    let header = st_metadata.metadata().clone().unwrap_or_default();

    let safetensors = safetensors::SafeTensors::deserialize(&data)
        .map_err(|e| Error::Serialization(format!("SafeTensors parsing failed: {e}")))?;

    let mut tensors = BTreeMap::new();
    for (name, view) in safetensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(Error::Serialization(format!(
                "tensor {name} has dtype {:?}, expected F32",
                view.dtype()
            )));
        }
        let values: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());
        let array = ArrayD::from_shape_vec(IxDyn(view.shape()), values)?;
        tensors.insert(name, array);
    }
    Ok(WeightFile { header, tensors })
}

/// Load a quantization metadata file; the format follows the extension
pub fn load_quantization_config(path: impl AsRef<Path>) -> Result<QuantizationFile> {
    let path = path.as_ref();
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Serialization("File has no extension".to_string()))?;
    let format = MetadataFormat::from_extension(ext)
        .ok_or_else(|| Error::Serialization(format!("Unsupported file extension: {ext}")))?;

    let mut content = String::new();
    File::open(path)?.read_to_string(&mut content)?;

    match format {
        MetadataFormat::Json => serde_json::from_str(&content)
            .map_err(|e| Error::Serialization(format!("JSON deserialization failed: {e}"))),
        MetadataFormat::Yaml => serde_yaml::from_str(&content)
            .map_err(|e| Error::Serialization(format!("YAML deserialization failed: {e}"))),
    }
}

/// Copy the stored weights and biases into the matching linear layers
///
/// Returns the number of layers updated. Stored tensors without a matching
/// layer are ignored; a shape disagreement is an error.
pub fn apply_weights<M: QuantModel + ?Sized>(model: &mut M, weights: &WeightFile) -> Result<usize> {
    let mut updated = 0;
    for name in model.linear_names() {
        let Some(weight) = weights.tensors.get(&format!("{name}.weight")) else {
            continue;
        };
        let weight = weight.clone().into_dimensionality::<Ix2>()?;
        let bias = weights
            .tensors
            .get(&format!("{name}.bias"))
            .map(|b| b.clone().into_dimensionality::<Ix1>())
            .transpose()?;

        let layer = model
            .linear_mut(&name)
            .ok_or_else(|| Error::LayerNotFound(name.clone()))?;
        if weight.dim() != layer.weight.dim() {
            let (rows, cols) = layer.weight.dim();
            return Err(Error::ShapeMismatch {
                expected: vec![rows, cols],
                got: weight.shape().to_vec(),
            });
        }
        layer.weight = weight;
        if bias.is_some() {
            layer.bias = bias;
        }
        updated += 1;
    }
    Ok(updated)
}
