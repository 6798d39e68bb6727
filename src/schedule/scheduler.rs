//! Drives the window tuner over the block list
//!
//! Two activation streams are carried between windows: the reference stream
//! (calibration inputs propagated through already processed blocks) and,
//! with `enable_quanted_input`, the quantized stream produced by the folded
//! blocks. Streams are moved into the next window and dropped as soon as a
//! newer one supersedes them.

use super::callback::{eval_tag, EvalRecord, EvalTable, Evaluator};
use super::windows::{ablation_windows, cleanly_separated_windows, standard_windows, BlockWindow};
use crate::calib::CachedActivations;
use crate::model::{BlockSequence, PlainExec, QuantModel, SampleContext};
use crate::quant::{LayerConfigMap, QuantizedLinear};
use crate::tune::{tune_window, CurveStats, TuneSettings, TuningResult, WindowSegments};
use crate::{Error, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info};

/// How the block list is cut into windows
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchedulePolicy {
    /// Overlapping windows sliding by `block_step_size`
    Standard {
        nblocks: usize,
        block_step_size: usize,
        num_lookahead_blocks: usize,
        num_observe_blocks: usize,
    },
    /// Disjoint groups of `num_lookahead_blocks + 1` blocks
    CleanlySeparated { num_lookahead_blocks: usize },
    /// One fine-tune block with a swept attach-loss boundary; nothing is
    /// written back to the model
    Ablation {
        fine_tune_block_idx: usize,
        observe_block_idx: usize,
        attach_loss_block_indices: Vec<i64>,
    },
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        SchedulePolicy::Standard {
            nblocks: 1,
            block_step_size: 1,
            num_lookahead_blocks: 0,
            num_observe_blocks: 0,
        }
    }
}

impl SchedulePolicy {
    /// Windows over `total` blocks
    pub fn windows(&self, total: usize) -> Result<Vec<BlockWindow>> {
        match self {
            SchedulePolicy::Standard {
                nblocks,
                block_step_size,
                num_lookahead_blocks,
                num_observe_blocks,
            } => standard_windows(
                *nblocks,
                *block_step_size,
                *num_lookahead_blocks,
                *num_observe_blocks,
                total,
            ),
            SchedulePolicy::CleanlySeparated {
                num_lookahead_blocks,
            } => Ok(cleanly_separated_windows(*num_lookahead_blocks, total)),
            SchedulePolicy::Ablation {
                fine_tune_block_idx,
                observe_block_idx,
                attach_loss_block_indices,
            } => ablation_windows(
                *fine_tune_block_idx,
                *observe_block_idx,
                attach_loss_block_indices,
                total,
            ),
        }
    }
}

/// Outcome of one tuned window
#[derive(Clone, Debug)]
pub struct WindowReport {
    pub window: BlockWindow,
    pub fine_tune_blocks: Vec<String>,
    /// `None` when the fine-tune blocks had nothing to quantize
    pub tuning: Option<TuningResult>,
    pub quantized_layers: Vec<String>,
    pub unquantized_layers: Vec<String>,
}

/// One point of an attach-loss sweep
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AblationRow {
    pub fine_tune_block: String,
    pub attach_loss_block: String,
    pub observe_block: String,
    pub init_loss: Option<f32>,
    pub best_loss: Option<f32>,
    /// Learning curve of the observe segment
    pub stats: Option<CurveStats>,
    /// Metrics of the model with only the tuned block swapped in
    pub metrics: BTreeMap<String, f64>,
}

/// Everything a scheduler run produced
#[derive(Clone, Debug, Default)]
pub struct ScheduleReport {
    pub windows: Vec<WindowReport>,
    pub ablation: Vec<AblationRow>,
    pub evaluations: EvalTable,
}

impl ScheduleReport {
    /// Names of every layer that was folded into the model
    pub fn quantized_layers(&self) -> Vec<String> {
        self.windows
            .iter()
            .flat_map(|w| w.quantized_layers.iter().cloned())
            .collect()
    }
}

/// Runs one [`SchedulePolicy`] over a model's block list
pub struct BlockScheduler<'e> {
    policy: SchedulePolicy,
    tune: TuneSettings,
    enable_quanted_input: bool,
    evaluator: Option<&'e mut dyn Evaluator>,
    eval_tasks: Vec<String>,
}

impl<'e> BlockScheduler<'e> {
    pub fn new(policy: SchedulePolicy, tune: TuneSettings) -> Self {
        Self {
            policy,
            tune,
            enable_quanted_input: true,
            evaluator: None,
            eval_tasks: Vec::new(),
        }
    }

    /// Feed each window the output of the already quantized blocks
    pub fn with_quanted_input(mut self, enable: bool) -> Self {
        self.enable_quanted_input = enable;
        self
    }

    /// Evaluate the model after every window
    pub fn with_evaluator(mut self, evaluator: &'e mut dyn Evaluator, tasks: Vec<String>) -> Self {
        self.evaluator = Some(evaluator);
        self.eval_tasks = tasks;
        self
    }

    pub fn policy(&self) -> &SchedulePolicy {
        &self.policy
    }

    pub fn tune_settings(&self) -> &TuneSettings {
        &self.tune
    }

    /// Tune `block_names` starting from the cached inputs of the first block
    ///
    /// Folded layers are written into `model` and recorded in `layer_config`,
    /// except in ablation runs, which leave both untouched.
    pub fn run<M: QuantModel>(
        &mut self,
        model: &mut M,
        block_names: &[String],
        inputs: CachedActivations,
        layer_config: &mut LayerConfigMap,
    ) -> Result<ScheduleReport> {
        if block_names.is_empty() {
            return Ok(ScheduleReport::default());
        }
        let windows = self.policy.windows(block_names.len())?;
        let (hidden, contexts) = inputs.into_parts();
        match self.policy.clone() {
            SchedulePolicy::Standard {
                nblocks,
                block_step_size,
                ..
            } => self.run_standard(
                model,
                block_names,
                &windows,
                hidden,
                &contexts,
                layer_config,
                nblocks == block_step_size,
            ),
            SchedulePolicy::CleanlySeparated { .. } => {
                self.run_cleanly_separated(model, block_names, &windows, hidden, &contexts, layer_config)
            }
            SchedulePolicy::Ablation {
                fine_tune_block_idx,
                ..
            } => self.run_ablation(
                model,
                block_names,
                &windows,
                fine_tune_block_idx,
                hidden,
                &contexts,
                layer_config,
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_standard<M: QuantModel>(
        &mut self,
        model: &mut M,
        block_names: &[String],
        windows: &[BlockWindow],
        inputs: Vec<Array2<f32>>,
        contexts: &[SampleContext],
        layer_config: &mut LayerConfigMap,
        disjoint: bool,
    ) -> Result<ScheduleReport> {
        let step = match self.policy {
            SchedulePolicy::Standard {
                block_step_size, ..
            } => block_step_size,
            _ => 1,
        };
        let precision = self.tune.precision;
        let mut report = ScheduleReport::default();
        let mut last_fully_tuned: Option<usize> = None;
        let mut reference = inputs;
        let mut quantized: Option<Vec<Array2<f32>>> = None;

        for (index, window) in windows.iter().enumerate() {
            let start = window.fine_tune.start;
            if start > 0 && last_fully_tuned.map_or(true, |last| start - 1 > last) {
                let pending = start - last_fully_tuned.map_or(0, |last| last + 1);
                if pending != step {
                    return Err(Error::Schedule(format!(
                        "window at block {start} leaves {pending} untuned blocks behind, expected {step}"
                    )));
                }
                last_fully_tuned = Some(start - 1);
                let segment_start = start - step;
                let segment = BlockSequence::from_model(&*model, &block_names[segment_start..start])?;
                info!("last fine tuned multiblock {:?}", segment.names());
                if self.enable_quanted_input {
                    let input = match quantized.as_deref() {
                        Some(q) if segment_start > 0 => q,
                        _ => &reference,
                    };
                    quantized =
                        Some(segment.forward_stream(input, contexts, precision, &mut PlainExec)?);
                }
                reference = segment.forward_stream(&reference, contexts, precision, &mut PlainExec)?;
            }
            info!(
                "last fully fine tuned block {}",
                last_fully_tuned.map_or(-1, |i| i as i64)
            );

            let (entry, fp_outputs, q_outputs) = self.tune_and_fold(
                model,
                block_names,
                window,
                &reference,
                quantized.as_deref(),
                contexts,
                layer_config,
                index,
            )?;

            if disjoint {
                last_fully_tuned = window.fine_tune.end.checked_sub(1);
                reference = fp_outputs;
                quantized = q_outputs;
            }
            model.release_device_cache();

            if let Some(evaluator) = self.evaluator.as_deref_mut() {
                let tag = eval_tag(&window.fine_tune);
                info!("evaluating with {} after {}", evaluator.name(), tag);
                let metrics = evaluator.evaluate(&*model, &self.eval_tasks, &tag)?;
                report.evaluations.push(EvalRecord::new(&window.fine_tune, metrics));
            }
            report.windows.push(entry);
        }
        Ok(report)
    }

    fn run_cleanly_separated<M: QuantModel>(
        &mut self,
        model: &mut M,
        block_names: &[String],
        windows: &[BlockWindow],
        inputs: Vec<Array2<f32>>,
        contexts: &[SampleContext],
        layer_config: &mut LayerConfigMap,
    ) -> Result<ScheduleReport> {
        let mut report = ScheduleReport::default();
        let mut reference = inputs;
        let mut quantized: Option<Vec<Array2<f32>>> = None;
        for (index, window) in windows.iter().enumerate() {
            let (entry, fp_outputs, q_outputs) = self.tune_and_fold(
                model,
                block_names,
                window,
                &reference,
                quantized.as_deref(),
                contexts,
                layer_config,
                index,
            )?;
            reference = fp_outputs;
            quantized = q_outputs;
            model.release_device_cache();
            report.windows.push(entry);
        }
        Ok(report)
    }

    // TODO: settle with the product owner whether the ablation sweep stays a
    // production path; its window tuning repeats run_cleanly_separated.
    #[allow(clippy::too_many_arguments)]
    fn run_ablation<M: QuantModel>(
        &mut self,
        model: &mut M,
        block_names: &[String],
        windows: &[BlockWindow],
        fine_tune_block_idx: usize,
        inputs: Vec<Array2<f32>>,
        contexts: &[SampleContext],
        layer_config: &LayerConfigMap,
    ) -> Result<ScheduleReport> {
        info!("Quantizing blocks with lookahead ablation");
        let preceding = BlockSequence::from_model(&*model, &block_names[..fine_tune_block_idx])?;
        info!("preceding block {:?}", preceding.names());
        let preceding_outputs =
            preceding.forward_stream(&inputs, contexts, self.tune.precision, &mut PlainExec)?;
        drop(inputs);

        let mut report = ScheduleReport::default();
        for (index, window) in windows.iter().enumerate() {
            let names = WindowNames::resolve(block_names, window);
            names.log();
            let outcome = {
                let segments = window_segments(&*model, block_names, window)?;
                tune_window(
                    &segments,
                    &preceding_outputs,
                    None,
                    contexts,
                    layer_config,
                    &self.tune.reseeded(index as u64),
                )?
            };
            model.release_device_cache();

            let stats = CurveStats::from_history(outcome.observe_history());
            if let Some(s) = &stats {
                info!(
                    "observe block {} <- {} via {}: last mse {:.6}, min mse {:.6} at iter {}",
                    names.observe, names.fine_tune, names.attach, s.last_mse, s.min_mse, s.min_mse_iter
                );
            }
            let metrics = match (self.evaluator.as_deref_mut(), outcome.tuning.as_ref()) {
                (Some(evaluator), Some(tuning)) => {
                    let tag = format!("{}_{}", names.fine_tune, names.observe);
                    evaluate_swapped(model, &tuning.folded, evaluator, &self.eval_tasks, &tag)?
                }
                _ => BTreeMap::new(),
            };
            report.ablation.push(AblationRow {
                fine_tune_block: names.fine_tune,
                attach_loss_block: names.attach,
                observe_block: names.observe,
                init_loss: outcome.tuning.as_ref().map(|t| t.init_loss),
                best_loss: outcome.tuning.as_ref().map(|t| t.best_loss),
                stats,
                metrics,
            });
        }
        Ok(report)
    }

    /// Tune one window, write its folded layers back and compute the
    /// quantized output stream of its fine-tune blocks
    #[allow(clippy::too_many_arguments)]
    #[allow(clippy::type_complexity)]
    fn tune_and_fold<M: QuantModel>(
        &self,
        model: &mut M,
        block_names: &[String],
        window: &BlockWindow,
        reference: &[Array2<f32>],
        quantized: Option<&[Array2<f32>]>,
        contexts: &[SampleContext],
        layer_config: &mut LayerConfigMap,
        index: usize,
    ) -> Result<(WindowReport, Vec<Array2<f32>>, Option<Vec<Array2<f32>>>)> {
        WindowNames::resolve(block_names, window).log();
        let started = Instant::now();
        let outcome = {
            let segments = window_segments(&*model, block_names, window)?;
            tune_window(
                &segments,
                reference,
                quantized,
                contexts,
                layer_config,
                &self.tune.reseeded(index as u64),
            )?
        };

        let mut tuning = outcome.tuning;
        if let Some(t) = tuning.as_mut() {
            let folded = std::mem::take(&mut t.folded);
            write_back(model, &folded)?;
            for layer in &folded {
                layer_config.record(layer);
            }
        }

        let fine_tune_blocks = block_names[window.fine_tune.clone()].to_vec();
        let q_outputs = if self.enable_quanted_input {
            let folded_blocks = BlockSequence::from_model(&*model, &fine_tune_blocks)?;
            Some(folded_blocks.forward_stream(
                quantized.unwrap_or(reference),
                contexts,
                self.tune.precision,
                &mut PlainExec,
            )?)
        } else {
            None
        };
        debug!(
            blocks = ?fine_tune_blocks,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "window done"
        );

        let entry = WindowReport {
            window: window.clone(),
            fine_tune_blocks,
            tuning,
            quantized_layers: outcome.quantized_layers,
            unquantized_layers: outcome.unquantized_layers,
        };
        Ok((entry, outcome.fp_outputs, q_outputs))
    }
}

fn window_segments<'m, M: QuantModel>(
    model: &'m M,
    block_names: &[String],
    window: &BlockWindow,
) -> Result<WindowSegments<'m>> {
    Ok(WindowSegments {
        fine_tune: BlockSequence::from_model(model, &block_names[window.fine_tune.clone()])?,
        attach: BlockSequence::from_model(model, &block_names[window.attach.clone()])?,
        observe: BlockSequence::from_model(model, &block_names[window.observe.clone()])?,
    })
}

/// Last block name of each segment; empty segments borrow the name of the
/// segment before them
struct WindowNames {
    fine_tune: String,
    attach: String,
    observe: String,
    all_fine_tune: Vec<String>,
}

impl WindowNames {
    fn resolve(block_names: &[String], window: &BlockWindow) -> Self {
        let last = |range: &std::ops::Range<usize>| {
            block_names[range.clone()].last().cloned()
        };
        let fine_tune = last(&window.fine_tune).unwrap_or_default();
        let attach = last(&window.attach).unwrap_or_else(|| fine_tune.clone());
        let observe = last(&window.observe).unwrap_or_else(|| attach.clone());
        Self {
            fine_tune,
            attach,
            observe,
            all_fine_tune: block_names[window.fine_tune.clone()].to_vec(),
        }
    }

    fn log(&self) {
        info!("fine tune block {:?}", self.all_fine_tune);
        info!("attach loss block {}", self.attach);
        info!("observe block {}", self.observe);
    }
}

/// Replace model weights with folded values
pub(crate) fn write_back<M: QuantModel + ?Sized>(
    model: &mut M,
    folded: &[QuantizedLinear],
) -> Result<()> {
    for layer in folded {
        model
            .linear_mut(&layer.name)
            .ok_or_else(|| Error::LayerNotFound(layer.name.clone()))?
            .set_weight_flat(&layer.weight)?;
    }
    Ok(())
}

/// Evaluate with `folded` swapped into the model; the original weights are
/// restored whether or not evaluation succeeds
fn evaluate_swapped<M: QuantModel>(
    model: &mut M,
    folded: &[QuantizedLinear],
    evaluator: &mut dyn Evaluator,
    tasks: &[String],
    tag: &str,
) -> Result<BTreeMap<String, f64>> {
    let mut originals = Vec::with_capacity(folded.len());
    for layer in folded {
        if let Some(linear) = model.linear(&layer.name) {
            originals.push((layer.name.clone(), linear.weight.clone()));
        }
    }
    let result = write_back(model, folded).and_then(|()| evaluator.evaluate(&*model, tasks, tag));
    for (name, weight) in originals {
        if let Some(linear) = model.linear_mut(&name) {
            linear.weight = weight;
        }
    }
    result
}
