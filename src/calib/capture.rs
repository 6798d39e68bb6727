//! Calibration capture
//!
//! The model is only borrowed while capturing: the interceptor is a plain
//! [`ForwardHooks`] value handed to `forward_with_hooks`, so nothing on the
//! model is patched and nothing needs restoring afterwards.

use super::CalibrationCache;
use crate::model::{Device, ForwardHooks, Precision, QuantModel, SampleContext, TokenSample};
use crate::{Error, Result};
use ndarray::Array2;
use std::collections::HashSet;
use std::ops::ControlFlow;
use tracing::{debug, info, warn};

/// What to capture and when to stop
#[derive(Clone, Debug, Default)]
pub struct CaptureTargets {
    pub block_names: Vec<String>,
    pub layer_names: Vec<String>,
    /// Stop each forward right after this target's input is recorded
    pub last_cache_name: Option<String>,
}

impl CaptureTargets {
    pub fn new(block_names: Vec<String>, layer_names: Vec<String>) -> Self {
        Self {
            block_names,
            layer_names,
            last_cache_name: None,
        }
    }

    pub fn with_last_cache_name(mut self, name: Option<String>) -> Self {
        self.last_cache_name = name;
        self
    }

    /// Explicit stop point, else the only target when there is exactly one
    pub fn resolved_last_cache_name(&self) -> Option<String> {
        if self.last_cache_name.is_some() {
            return self.last_cache_name.clone();
        }
        match (self.block_names.as_slice(), self.layer_names.as_slice()) {
            ([only], []) | ([], [only]) => Some(only.clone()),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.block_names.is_empty() && self.layer_names.is_empty()
    }
}

/// Sample selection and storage settings of a capture pass
#[derive(Clone, Copy, Debug)]
pub struct CaptureSettings {
    /// Samples shorter than this are skipped
    pub seqlen: usize,
    /// Stop after this many valid samples
    pub nsamples: usize,
    /// Precision cached activations are rounded to
    pub precision: Precision,
}

type Staged = Vec<(String, Array2<f32>, Option<SampleContext>)>;

/// Interceptor recording the inputs of the targets for one sample
struct ActivationCapture<'t> {
    blocks: HashSet<&'t str>,
    layers: HashSet<&'t str>,
    last: Option<&'t str>,
    precision: Precision,
    device: Device,
    /// Bytes still free on the device
    available: Option<usize>,
    staged: Staged,
    seen: HashSet<String>,
}

impl<'t> ActivationCapture<'t> {
    fn new(
        targets: &'t CaptureTargets,
        last: Option<&'t str>,
        precision: Precision,
        device: Device,
        available: Option<usize>,
    ) -> Self {
        Self {
            blocks: targets.block_names.iter().map(String::as_str).collect(),
            layers: targets.layer_names.iter().map(String::as_str).collect(),
            last,
            precision,
            device,
            available,
            staged: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn stage(
        &mut self,
        name: &str,
        input: &Array2<f32>,
        ctx: Option<&SampleContext>,
    ) -> Result<ControlFlow<()>> {
        if self.seen.insert(name.to_string()) {
            let requested = input.len() * std::mem::size_of::<f32>();
            if let Some(available) = self.available {
                if requested > available {
                    return Err(Error::OutOfMemory {
                        device: self.device.to_string(),
                        requested,
                        available,
                    });
                }
                self.available = Some(available - requested);
            }
            let mut hidden = input.clone();
            self.precision.round_in_place(&mut hidden);
            self.staged.push((name.to_string(), hidden, ctx.cloned()));
        }
        Ok(if self.last == Some(name) {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        })
    }
}

impl ForwardHooks for ActivationCapture<'_> {
    fn before_block(
        &mut self,
        name: &str,
        hidden: &Array2<f32>,
        ctx: &SampleContext,
    ) -> Result<ControlFlow<()>> {
        if self.blocks.contains(name) {
            self.stage(name, hidden, Some(ctx))
        } else {
            Ok(ControlFlow::Continue(()))
        }
    }

    fn before_linear(&mut self, name: &str, input: &Array2<f32>) -> Result<ControlFlow<()>> {
        if self.layers.contains(name) {
            self.stage(name, input, None)
        } else {
            Ok(ControlFlow::Continue(()))
        }
    }
}

/// Run the calibration samples through the model and record target inputs
///
/// Samples shorter than `seqlen` are skipped. A forward that stops early at
/// the last target counts as a success; any other per-sample error is logged
/// and the sample dropped, except device memory failures which propagate.
pub fn capture_inputs<M: QuantModel + ?Sized>(
    model: &M,
    samples: &[TokenSample],
    targets: &CaptureTargets,
    settings: &CaptureSettings,
) -> Result<CalibrationCache> {
    let last = targets.resolved_last_cache_name();
    let mut cache = CalibrationCache::new();
    let capacity = model.memory_capacity();

    for (idx, sample) in samples.iter().enumerate() {
        if cache.num_samples() >= settings.nsamples {
            break;
        }
        if sample.len() < settings.seqlen {
            debug!(sample = idx, len = sample.len(), "skipping short calibration sample");
            continue;
        }
        let available = capacity.map(|c| c.saturating_sub(cache.bytes()));
        let mut hooks = ActivationCapture::new(
            targets,
            last.as_deref(),
            settings.precision,
            model.device(),
            available,
        );
        match model.forward_with_hooks(sample, &mut hooks) {
            Ok(_) => cache.commit(hooks.staged),
            Err(e) if e.is_out_of_memory() => return Err(e),
            Err(e) => warn!(sample = idx, error = %e, "calibration forward failed, sample skipped"),
        }
    }

    if cache.num_samples() == 0 {
        return Err(Error::NoCalibrationData(format!(
            "no data has been cached, please provide more data with sequence length >= {} \
             or decrease the sequence length",
            settings.seqlen
        )));
    }
    if cache.num_samples() < settings.nsamples {
        warn!(
            "insufficient number of samples: required {}, but only {} samples are available",
            settings.nsamples,
            cache.num_samples()
        );
    }
    Ok(cache)
}

/// [`capture_inputs`] on the model's device, retried once on CPU after a
/// device memory failure
pub fn capture_with_fallback<M: QuantModel + ?Sized>(
    model: &mut M,
    samples: &[TokenSample],
    targets: &CaptureTargets,
    settings: &CaptureSettings,
) -> Result<CalibrationCache> {
    match capture_inputs(&*model, samples, targets, settings) {
        Ok(cache) => {
            model.release_device_cache();
            Ok(cache)
        }
        Err(e) if e.is_out_of_memory() && model.device() != Device::Cpu => {
            info!(error = %e, "switch to cpu to cache inputs");
            model.release_device_cache();
            model.to_device(Device::Cpu)?;
            capture_inputs(&*model, samples, targets, settings)
        }
        Err(e) => Err(e),
    }
}
