//! Calibration data and activation capture
//!
//! Calibration samples come either pre-tokenized or from a named dataset
//! resolved by a [`DatasetLoader`]. Capture records the inputs entering the
//! requested blocks and layers, per sample and in calibration order.

mod cache;
mod capture;

pub use cache::{CachedActivations, CalibrationCache};
pub use capture::{capture_inputs, capture_with_fallback, CaptureSettings, CaptureTargets};

use crate::model::TokenSample;
use crate::{Error, Result};

/// Where calibration samples come from
#[derive(Clone, Debug, PartialEq)]
pub enum CalibrationData {
    /// Built-in dataset identifier, e.g. `NeelNanda/pile-10k`
    Named(String),
    /// Pre-tokenized samples
    Samples(Vec<TokenSample>),
}

impl Default for CalibrationData {
    fn default() -> Self {
        CalibrationData::Named("NeelNanda/pile-10k".to_string())
    }
}

/// Tokenizes named datasets into calibration samples
pub trait DatasetLoader {
    fn load(&self, dataset: &str, seqlen: usize, nsamples: usize, seed: u64)
        -> Result<Vec<TokenSample>>;
}

impl CalibrationData {
    /// Materialize the samples, loading named datasets through `loader`
    pub fn resolve(
        &self,
        loader: Option<&dyn DatasetLoader>,
        seqlen: usize,
        nsamples: usize,
        seed: u64,
    ) -> Result<Vec<TokenSample>> {
        match self {
            CalibrationData::Samples(samples) => Ok(samples.clone()),
            CalibrationData::Named(name) => {
                let name: String = name.chars().filter(|c| !c.is_whitespace()).collect();
                let loader = loader.ok_or_else(|| {
                    Error::ConfigError(format!("dataset {name} needs a dataset loader"))
                })?;
                loader.load(&name, seqlen, nsamples, seed)
            }
        }
    }
}
