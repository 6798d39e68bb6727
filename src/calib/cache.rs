//! Captured activations

use crate::model::SampleContext;
use crate::{Error, Result};
use ndarray::Array2;
use std::collections::BTreeMap;

/// Inputs captured for one block or layer, one entry per calibration sample
///
/// Block captures carry a [`SampleContext`] per sample; layer captures only
/// hold the `rows × in_features` input.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CachedActivations {
    name: String,
    hidden: Vec<Array2<f32>>,
    contexts: Vec<SampleContext>,
}

impl CachedActivations {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Build from already computed per-sample tensors
    pub fn from_parts(
        name: &str,
        hidden: Vec<Array2<f32>>,
        contexts: Vec<SampleContext>,
    ) -> Result<Self> {
        if !contexts.is_empty() && contexts.len() != hidden.len() {
            return Err(Error::ShapeMismatch {
                expected: vec![hidden.len()],
                got: vec![contexts.len()],
            });
        }
        Ok(Self {
            name: name.to_string(),
            hidden,
            contexts,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn push(&mut self, hidden: Array2<f32>, ctx: Option<SampleContext>) {
        self.hidden.push(hidden);
        if let Some(ctx) = ctx {
            self.contexts.push(ctx);
        }
    }

    pub fn len(&self) -> usize {
        self.hidden.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hidden.is_empty()
    }

    pub fn hidden(&self) -> &[Array2<f32>] {
        &self.hidden
    }

    pub fn contexts(&self) -> &[SampleContext] {
        &self.contexts
    }

    /// Contexts padded with defaults when the capture had none
    pub fn contexts_or_default(&self) -> Vec<SampleContext> {
        if self.contexts.len() == self.hidden.len() {
            self.contexts.clone()
        } else {
            vec![SampleContext::default(); self.hidden.len()]
        }
    }

    pub fn into_parts(self) -> (Vec<Array2<f32>>, Vec<SampleContext>) {
        (self.hidden, self.contexts)
    }

    /// Bytes held by the hidden states
    pub fn bytes(&self) -> usize {
        self.hidden
            .iter()
            .map(|h| h.len() * std::mem::size_of::<f32>())
            .sum()
    }
}

/// Activations captured in one pass, keyed by block or layer name
#[derive(Clone, Debug, Default)]
pub struct CalibrationCache {
    entries: BTreeMap<String, CachedActivations>,
    num_samples: usize,
}

impl CalibrationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn commit(&mut self, staged: Vec<(String, Array2<f32>, Option<SampleContext>)>) {
        for (name, hidden, ctx) in staged {
            self.entries
                .entry(name.clone())
                .or_insert_with(|| CachedActivations::new(&name))
                .push(hidden, ctx);
        }
        self.num_samples += 1;
    }

    /// Number of samples that went through the model
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn get(&self, name: &str) -> Option<&CachedActivations> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Hand the activations of `name` over to the caller
    pub fn take(&mut self, name: &str) -> Result<CachedActivations> {
        self.entries
            .remove(name)
            .ok_or_else(|| Error::NoCalibrationData(format!("no inputs cached for {name}")))
    }

    /// Drop the activations of `name`; returns the bytes freed
    pub fn release(&mut self, name: &str) -> usize {
        self.entries.remove(name).map_or(0, |a| a.bytes())
    }

    pub fn bytes(&self) -> usize {
        self.entries.values().map(CachedActivations::bytes).sum()
    }
}
