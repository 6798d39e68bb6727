//! Model inputs and per-sample side tensors

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One tokenized calibration sample
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenSample {
    pub input_ids: Vec<u32>,
    /// 1 for real tokens, 0 for padding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attention_mask: Option<Vec<u8>>,
}

impl TokenSample {
    pub fn new(input_ids: Vec<u32>) -> Self {
        Self {
            input_ids,
            attention_mask: None,
        }
    }

    pub fn with_attention_mask(mut self, mask: Vec<u8>) -> Self {
        self.attention_mask = Some(mask);
        self
    }

    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Side inputs a block receives next to the hidden state
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SampleContext {
    /// One value per position
    pub attention_mask: Option<Array1<f32>>,
    pub position_ids: Option<Vec<usize>>,
    /// Any other framework-specific tensors
    pub extras: BTreeMap<String, Array1<f32>>,
}

impl SampleContext {
    /// Context of a sample entering the first block
    pub fn for_sample(sample: &TokenSample) -> Self {
        Self {
            attention_mask: sample
                .attention_mask
                .as_ref()
                .map(|m| m.iter().map(|&v| f32::from(v)).collect()),
            position_ids: Some((0..sample.len()).collect()),
            extras: BTreeMap::new(),
        }
    }
}
