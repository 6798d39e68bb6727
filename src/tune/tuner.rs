//! The per-unit tuning loop
//!
//! Every iteration draws `batch_size * gradient_accumulate_steps` samples,
//! back-propagates each `batch_size` slice through the fake-quantized unit and
//! takes one optimizer step. The best-loss values are snapshotted as copies;
//! stagnation for `dynamic_max_gap` iterations ends the loop early.

use super::{BatchSampler, SamplerKind, TuningResult, WindowOutcome};
use crate::autograd::{backward, mean, mse_loss, Tensor};
use crate::model::{BlockSequence, Linear, PlainExec, Precision, QuantExec, SampleContext};
use crate::optim::{rounding_optimizer, LrSchedule, OptimizerKind};
use crate::quant::{LayerConfigMap, QuantConfig, WrapperRegistry, WrapperSnapshot};
use crate::{Error, Result};
use ndarray::Array2;
use tracing::{debug, info};

/// Knobs of one tuning run
#[derive(Clone, Debug, PartialEq)]
pub struct TuneSettings {
    pub iters: usize,
    /// Samples per backward pass
    pub batch_size: usize,
    pub gradient_accumulate_steps: usize,
    /// Learning rate of the rounding values
    pub lr: f32,
    /// Learning rate of the min/max scales
    pub minmax_lr: f32,
    pub enable_minmax_tuning: bool,
    /// `None` keeps the learning rate constant
    pub lr_schedule: Option<LrSchedule>,
    pub sampler: SamplerKind,
    pub seed: u64,
    /// Fold the last iteration instead of the best one
    pub not_use_best_mse: bool,
    /// Stop after this many iterations without improvement; `<= 0` disables
    pub dynamic_max_gap: i64,
    pub optimizer: OptimizerKind,
    /// Dynamic loss scaling for the adaptive optimizer
    pub loss_scaling: bool,
    /// Precision that stream outputs are rounded to
    pub precision: Precision,
}

impl Default for TuneSettings {
    fn default() -> Self {
        Self {
            iters: 200,
            batch_size: 8,
            gradient_accumulate_steps: 1,
            lr: 1.0 / 200.0,
            minmax_lr: 1.0 / 200.0,
            enable_minmax_tuning: true,
            lr_schedule: None,
            sampler: SamplerKind::Rand,
            seed: 42,
            not_use_best_mse: false,
            dynamic_max_gap: -1,
            optimizer: OptimizerKind::SignSgd,
            loss_scaling: false,
            precision: Precision::F32,
        }
    }
}

impl TuneSettings {
    /// Samples drawn per iteration
    pub fn pick_samples(&self) -> usize {
        self.batch_size * self.gradient_accumulate_steps
    }

    /// Single-sample slices accumulated over `batch_size` steps, used for
    /// layers outside blocks
    pub fn for_layer(&self) -> Self {
        Self {
            batch_size: 1,
            gradient_accumulate_steps: self.batch_size,
            ..self.clone()
        }
    }

    /// Same settings with the sampler seed mixed with `salt`
    pub fn reseeded(&self, salt: u64) -> Self {
        Self {
            seed: self.seed.wrapping_add(salt.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            ..self.clone()
        }
    }
}

/// State of a finished loop
struct LoopOutcome {
    init_loss: f32,
    best_loss: f32,
    final_loss: f32,
    best_iter: usize,
    iterations_run: usize,
    early_stopped_at: Option<usize>,
    loss_history: Vec<f32>,
    observe_history: Vec<f32>,
    best: Option<WrapperSnapshot>,
}

/// Run the optimization loop over `nsamples` cached samples
///
/// `batch_loss` returns the differentiable training loss of a slice of sample
/// indices together with its observe MSE.
fn run_loop<F>(
    registry: &mut WrapperRegistry,
    settings: &TuneSettings,
    nsamples: usize,
    mut batch_loss: F,
) -> Result<LoopOutcome>
where
    F: FnMut(&WrapperRegistry, &[usize]) -> Result<(Tensor, f32)>,
{
    let mut sampler = BatchSampler::new(
        settings.sampler,
        nsamples,
        settings.pick_samples(),
        settings.seed,
    );
    let mut optimizer = rounding_optimizer(
        settings.optimizer,
        settings.lr,
        settings.minmax_lr,
        settings.loss_scaling,
    );
    let mut schedule = settings.lr_schedule.map(|s| s.factor_scheduler(settings.iters));
    let chunk = settings.batch_size.max(1);
    let gap = usize::try_from(settings.dynamic_max_gap).unwrap_or(0);

    let mut best_loss = f32::MAX;
    let mut last_best_iter = 0;
    let mut best = None;
    let mut outcome = LoopOutcome {
        init_loss: 0.0,
        best_loss: 0.0,
        final_loss: 0.0,
        best_iter: 0,
        iterations_run: 0,
        early_stopped_at: None,
        loss_history: Vec::with_capacity(settings.iters),
        observe_history: Vec::with_capacity(settings.iters),
        best: None,
    };

    for i in 0..settings.iters {
        if let Some(s) = schedule.as_ref() {
            optimizer.set_lr_factor(s.get_lr());
        }
        let indices = sampler.next_indices();
        let slices = indices.len().div_ceil(chunk).max(1) as f32;
        let mut total_loss = 0.0;
        let mut total_observe = 0.0;
        for slice in indices.chunks(chunk) {
            let (loss, observe) = batch_loss(registry, slice)?;
            total_loss += loss.item() / slices;
            total_observe += observe / slices;
            backward(&optimizer.scale_loss(&loss), None);
        }
        outcome.loss_history.push(total_loss);
        outcome.observe_history.push(total_observe);
        outcome.iterations_run = i + 1;
        if i == 0 {
            outcome.init_loss = total_loss;
        }

        if total_loss < best_loss {
            best_loss = total_loss;
            if !settings.not_use_best_mse {
                best = Some(registry.snapshot());
                last_best_iter = i;
            }
        }
        if settings.not_use_best_mse && i + 1 == settings.iters {
            best = Some(registry.snapshot());
        }
        if !settings.not_use_best_mse && gap > 0 && i - last_best_iter >= gap {
            debug!(iter = i, last_best_iter, "no improvement, stopping early");
            outcome.early_stopped_at = Some(i);
            break;
        }

        let stepped = optimizer.apply_step(registry);
        if let Some(s) = schedule.as_mut() {
            s.step();
        }
        debug!(
            iter = i,
            loss = total_loss,
            observe_mse = total_observe,
            stepped,
            "tuning iteration"
        );
    }

    outcome.best_loss = best_loss;
    if settings.not_use_best_mse {
        outcome.final_loss = outcome.loss_history.last().copied().unwrap_or(0.0);
        outcome.best_iter = settings.iters;
    } else {
        outcome.final_loss = best_loss;
        outcome.best_iter = last_best_iter;
    }
    outcome.best = best;
    Ok(outcome)
}

fn check_stream_lengths(
    fp_inputs: &[Array2<f32>],
    q_inputs: Option<&[Array2<f32>]>,
    contexts: &[SampleContext],
) -> Result<()> {
    if fp_inputs.is_empty() {
        return Err(Error::NoCalibrationData("no cached inputs to tune on".to_string()));
    }
    let q_len = q_inputs.map_or(fp_inputs.len(), <[_]>::len);
    if contexts.len() != fp_inputs.len() || q_len != fp_inputs.len() {
        return Err(Error::ShapeMismatch {
            expected: vec![fp_inputs.len()],
            got: vec![q_len, contexts.len()],
        });
    }
    Ok(())
}

/// The three block segments of one window
#[derive(Clone, Debug, Default)]
pub struct WindowSegments<'m> {
    pub fine_tune: BlockSequence<'m>,
    pub attach: BlockSequence<'m>,
    pub observe: BlockSequence<'m>,
}

impl WindowSegments<'_> {
    fn describe(&self) -> String {
        self.fine_tune.names().join(",")
    }
}

/// Tune the fine-tune segment of a window against the attach-loss output
///
/// Reference outputs come from the full-precision inputs; the quantized
/// forward starts from `q_inputs` when given. The model is not modified: the
/// folded layers are returned in the result for the caller to write back.
pub fn tune_window(
    segments: &WindowSegments<'_>,
    fp_inputs: &[Array2<f32>],
    q_inputs: Option<&[Array2<f32>]>,
    contexts: &[SampleContext],
    layer_config: &LayerConfigMap,
    settings: &TuneSettings,
) -> Result<WindowOutcome> {
    check_stream_lengths(fp_inputs, q_inputs, contexts)?;
    let precision = settings.precision;
    let fp_ft = segments
        .fine_tune
        .forward_stream(fp_inputs, contexts, precision, &mut PlainExec)?;
    let fp_al = segments
        .attach
        .forward_stream(&fp_ft, contexts, precision, &mut PlainExec)?;
    let fp_ob = segments
        .observe
        .forward_stream(&fp_al, contexts, precision, &mut PlainExec)?;
    let train_inputs = q_inputs.unwrap_or(fp_inputs);

    let mut registry = WrapperRegistry::new(settings.enable_minmax_tuning);
    let mut quantized_layers = Vec::new();
    let mut unquantized_layers = Vec::new();
    for name in segments.fine_tune.linear_names() {
        match (layer_config.get(&name), segments.fine_tune.linear(&name)) {
            (Some(info), Some(layer)) if info.is_quantized() => {
                registry.wrap(&name, layer, info.quant_config())?;
                quantized_layers.push(name);
            }
            _ => unquantized_layers.push(name),
        }
    }

    let num_layers = quantized_layers.len() + unquantized_layers.len();
    if registry.num_trainable() == 0 {
        info!(
            "quantized {}/{} layers in the block",
            quantized_layers.len(),
            num_layers
        );
        return Ok(WindowOutcome {
            fp_outputs: fp_ft,
            tuning: None,
            quantized_layers,
            unquantized_layers,
        });
    }

    let outcome = run_loop(&mut registry, settings, fp_inputs.len(), |reg, indices| {
        let mut losses = Vec::with_capacity(indices.len());
        let mut observe = 0.0;
        for &i in indices {
            let ctx = &contexts[i];
            let mut exec = QuantExec::new(reg);
            let x = Tensor::from_array2(&train_inputs[i], false);
            let q_ft = segments.fine_tune.forward(&x, ctx, &mut exec)?;
            let q_al = segments.attach.forward(&q_ft, ctx, &mut exec)?;
            losses.push(mse_loss(&q_al, &Tensor::from_array2(&fp_al[i], false))?);
            let q_ob = segments.observe.forward(&q_al.detach(), ctx, &mut exec)?;
            observe += mse_loss(&q_ob, &Tensor::from_array2(&fp_ob[i], false))?.item();
        }
        Ok((mean(&losses)?, observe / indices.len().max(1) as f32))
    })?;

    info!(
        "quantized {}/{} layers in the block, loss iter 0: {:.6} -> iter {}: {:.6}, observe block mse: {:.6}",
        quantized_layers.len(),
        num_layers,
        outcome.init_loss,
        outcome.best_iter,
        outcome.final_loss,
        outcome.observe_history.last().copied().unwrap_or(0.0)
    );
    if !unquantized_layers.is_empty() {
        info!("{:?} have not been quantized", unquantized_layers);
    }

    let folded = registry.unwrap(outcome.best.as_ref())?;
    Ok(WindowOutcome {
        fp_outputs: fp_ft,
        tuning: Some(TuningResult {
            unit: segments.describe(),
            init_loss: outcome.init_loss,
            best_loss: outcome.best_loss,
            final_loss: outcome.final_loss,
            best_iter: outcome.best_iter,
            iterations_run: outcome.iterations_run,
            early_stopped_at: outcome.early_stopped_at,
            loss_history: outcome.loss_history,
            observe_history: outcome.observe_history,
            best: outcome.best,
            quantized_layers: quantized_layers.clone(),
            unquantized_layers: unquantized_layers.clone(),
            folded,
        }),
        quantized_layers,
        unquantized_layers,
    })
}

/// Tune a single linear layer against its own full-precision output
///
/// The reference output uses `inputs`; the quantized forward uses `q_inputs`
/// when given.
pub fn tune_layer(
    name: &str,
    layer: &Linear,
    config: QuantConfig,
    inputs: &[Array2<f32>],
    q_inputs: Option<&[Array2<f32>]>,
    settings: &TuneSettings,
) -> Result<TuningResult> {
    info!("quantizing layer {name}");
    let contexts = vec![SampleContext::default(); inputs.len()];
    check_stream_lengths(inputs, q_inputs, &contexts)?;
    let train_inputs = q_inputs.unwrap_or(inputs);

    let mut registry = WrapperRegistry::new(settings.enable_minmax_tuning);
    registry.wrap(name, layer, config)?;

    let targets = inputs
        .iter()
        .map(|x| Ok(layer.forward(&Tensor::from_array2(x, false))?.detach()))
        .collect::<Result<Vec<_>>>()?;

    let outcome = run_loop(&mut registry, settings, inputs.len(), |reg, indices| {
        let mut losses = Vec::with_capacity(indices.len());
        for &i in indices {
            let q_out = reg.forward(name, &Tensor::from_array2(&train_inputs[i], false))?;
            losses.push(mse_loss(&q_out, &targets[i])?);
        }
        let loss = mean(&losses)?;
        let observe = loss.item();
        Ok((loss, observe))
    })?;

    info!(
        "quantized {name},  loss iter 0: {:.6} -> iter {}: {:.6}",
        outcome.init_loss, outcome.best_iter, outcome.final_loss
    );
    let folded = registry.unwrap(outcome.best.as_ref())?;
    Ok(TuningResult {
        unit: name.to_string(),
        init_loss: outcome.init_loss,
        best_loss: outcome.best_loss,
        final_loss: outcome.final_loss,
        best_iter: outcome.best_iter,
        iterations_run: outcome.iterations_run,
        early_stopped_at: outcome.early_stopped_at,
        loss_history: outcome.loss_history,
        observe_history: outcome.observe_history,
        best: outcome.best,
        quantized_layers: vec![name.to_string()],
        unquantized_layers: Vec::new(),
        folded,
    })
}
