//! Top-level quantization driver
//!
//! [`AutoRound`] owns the model and the run configuration. `quantize`
//! builds the per-layer config map, captures calibration inputs, tunes
//! every block group through the [`BlockScheduler`], tunes the configured
//! layers outside blocks and finally marks everything that never received a
//! scale as float.
//!
//! # Example
//!
//! ```no_run
//! use autoround::config::AutoRoundConfig;
//! use autoround::model::{SequentialModel, TokenSample};
//! use autoround::AutoRound;
//!
//! let model = SequentialModel::new(32, 16, 32, 4, 0).unwrap();
//! let config = AutoRoundConfig {
//!     bits: 4,
//!     group_size: -1,
//!     iters: 50,
//!     seqlen: 8,
//!     nsamples: 16,
//!     ..AutoRoundConfig::default()
//! };
//! let samples = (0..16)
//!     .map(|i| TokenSample::new((0..8).map(|t| (i * 3 + t) % 32).collect()))
//!     .collect();
//!
//! let mut autoround = AutoRound::new(model, config).unwrap().with_samples(samples);
//! autoround.quantize().unwrap();
//! autoround.save_quantized("./quantized", "qdq").unwrap();
//! ```

mod evaluate;
mod report;


pub use report::QuantizeReport;

use crate::calib::{
    capture_with_fallback, CalibrationCache, CalibrationData, CaptureSettings, CaptureTargets,
    DatasetLoader,
};
use crate::config::{validate_config, AutoRoundConfig, LayerOverride};
use crate::io::{ExportMetadata, Exporter, QdqExporter, QDQ_FORMAT};
use crate::model::{Device, Precision, QuantModel, TokenSample};
use crate::quant::{LayerConfigMap, LayerQuantInfo, WrapperRegistry};
use crate::schedule::{write_back, BlockScheduler, Evaluator};
use crate::tune::{tune_layer, TuneSettings};
use crate::{Error, Result};
use evaluate::SnapshotEvaluator;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

/// Drives a complete quantization run over one model
pub struct AutoRound<M: QuantModel> {
    model: M,
    config: AutoRoundConfig,
    device: Device,
    precision: Precision,
    calibration: CalibrationData,
    loader: Option<Box<dyn DatasetLoader>>,
    evaluator: Option<Box<dyn Evaluator>>,
    layer_config: LayerConfigMap,
    report: QuantizeReport,
    quantized: bool,
}

impl<M: QuantModel> AutoRound<M> {
    /// Validate `config` and place the model on the tuning device
    ///
    /// The device and the mixed precision are resolved here, once per run.
    pub fn new(mut model: M, config: AutoRoundConfig) -> Result<Self> {
        validate_config(&config)?;
        if config.iters <= 0 {
            warn!("iters must be positive, reset it to {}", config.resolved_iters());
        }
        let device = config.device.unwrap_or_else(|| model.device());
        if model.device() != device {
            model.to_device(device)?;
        }
        let precision = Precision::for_amp(config.amp, device);
        info!("using {device} with {precision:?} activations");
        let calibration = CalibrationData::Named(config.dataset.clone());
        Ok(Self {
            model,
            config,
            device,
            precision,
            calibration,
            loader: None,
            evaluator: None,
            layer_config: LayerConfigMap::new(),
            report: QuantizeReport::default(),
            quantized: false,
        })
    }

    /// Calibrate on pre-tokenized samples instead of the named dataset
    pub fn with_samples(mut self, samples: Vec<TokenSample>) -> Self {
        self.calibration = CalibrationData::Samples(samples);
        self
    }

    /// Resolve the named calibration dataset through `loader`
    pub fn with_dataset_loader(mut self, loader: Box<dyn DatasetLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Harness called after each window when `eval_after_each_optimization`
    /// is set
    pub fn with_evaluator(mut self, evaluator: Box<dyn Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn config(&self) -> &AutoRoundConfig {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn layer_config(&self) -> &LayerConfigMap {
        &self.layer_config
    }

    pub fn report(&self) -> &QuantizeReport {
        &self.report
    }

    /// Default settings for every linear layer of the model
    ///
    /// Layers inside blocks take the run defaults overlaid with their
    /// override; layers outside blocks stay in float unless configured.
    pub fn set_layerwise_config(&mut self) -> Result<&LayerConfigMap> {
        let groups = self.block_groups();
        let in_blocks = self.block_layer_names(&groups)?;
        let mut map = LayerConfigMap::new();
        for name in self.model.linear_names() {
            let config = match self.config.layer_config.get(&name) {
                Some(over) => self.config.layer_quant_config(over)?,
                None if in_blocks.contains(&name) => self.config.quant_config()?,
                None => self.config.layer_quant_config(&LayerOverride::float())?,
            };
            map.insert(name, LayerQuantInfo::from_config(&config));
        }
        for name in self.config.layer_config.keys() {
            if !map.contains(name) {
                warn!("{name} is configured but was not found in the model");
            }
        }
        self.layer_config = map;
        Ok(&self.layer_config)
    }

    /// Quantize the model in place
    ///
    /// Returns the finalized layer config map. A model without blocks is
    /// left untouched.
    pub fn quantize(&mut self) -> Result<&LayerConfigMap> {
        if self.quantized {
            return Err(Error::InvalidParameter("model is already quantized".to_string()));
        }
        let started = Instant::now();
        let groups = self.block_groups();
        if groups.is_empty() {
            warn!("could not find blocks, exit with original model");
            return Ok(&self.layer_config);
        }
        self.set_layerwise_config()?;

        if self.config.round_to_nearest {
            self.quantize_rtn(&groups[0])?;
        } else {
            self.quantize_tuned(&groups)?;
        }

        self.layer_config.finalize(self.precision.float_tag());
        let elapsed = started.elapsed();
        info!("quantization tuning time {:.2}", elapsed.as_secs_f64());

        let (quantized, unquantized) = self.layer_config.partition();
        info!(
            "Summary: quantized {}/{} in the model, {:?} have not been quantized",
            quantized.len(),
            quantized.len() + unquantized.len(),
            unquantized
        );
        self.report.quantized_layers = quantized;
        self.report.unquantized_layers = unquantized;
        self.report.elapsed = elapsed;
        self.quantized = true;
        Ok(&self.layer_config)
    }

    /// Export with the built-in format; other formats need [`Self::export_with`]
    pub fn save_quantized(
        &self,
        output_dir: impl AsRef<Path>,
        format: &str,
    ) -> Result<Vec<PathBuf>> {
        if format != QDQ_FORMAT {
            return Err(Error::ConfigError(format!(
                "export format {format} is not built in, pass an Exporter to export_with"
            )));
        }
        self.export_with(&QdqExporter::default(), output_dir.as_ref())
    }

    /// Export through `exporter` with the tuning keys attached
    pub fn export_with(&self, exporter: &dyn Exporter, output_dir: &Path) -> Result<Vec<PathBuf>> {
        if !self.quantized {
            warn!("exporting a model that has not been quantized");
        }
        let mut serialization = self.config.serialization_dict();
        if let Some(bs) = self.report.train_batch_size {
            serialization.insert("train_bs".to_string(), serde_json::json!(bs));
        }
        let metadata = ExportMetadata::new(exporter.format())
            .with_model_name(self.config.model_name.clone())
            .with_serialization(serialization);
        exporter.export(&self.model, &self.layer_config, &metadata, output_dir)
    }

    fn block_groups(&self) -> Vec<Vec<String>> {
        self.model
            .block_groups()
            .into_iter()
            .filter(|g| !g.is_empty())
            .collect()
    }

    fn block_layer_names(&self, groups: &[Vec<String>]) -> Result<HashSet<String>> {
        let mut names = HashSet::new();
        for block_name in groups.iter().flatten() {
            let block = self
                .model
                .block(block_name)
                .ok_or_else(|| Error::BlockNotFound(block_name.clone()))?;
            names.extend(block.linear_names());
        }
        Ok(names)
    }

    /// Quantizable layers outside every block, in model order
    fn leftover_layers(&self, groups: &[Vec<String>]) -> Result<Vec<String>> {
        let in_blocks = self.block_layer_names(groups)?;
        Ok(self
            .model
            .linear_names()
            .into_iter()
            .filter(|n| !in_blocks.contains(n) && self.layer_config.is_quantized(n))
            .collect())
    }

    /// Fold every quantizable layer of the blocks with plain rounding
    fn quantize_rtn(&mut self, block_names: &[String]) -> Result<()> {
        for block_name in block_names {
            let (folded, num_layers) = {
                let block = self
                    .model
                    .block(block_name)
                    .ok_or_else(|| Error::BlockNotFound(block_name.clone()))?;
                let names = block.linear_names();
                let mut registry = WrapperRegistry::new(false);
                for name in &names {
                    let Some(info) = self.layer_config.get(name).filter(|i| i.is_quantized()) else {
                        continue;
                    };
                    let layer = block
                        .linear(name)
                        .ok_or_else(|| Error::LayerNotFound(name.clone()))?;
                    registry.wrap(name, layer, info.quant_config())?;
                }
                (registry.unwrap(None)?, names.len())
            };
            write_back(&mut self.model, &folded)?;
            for layer in &folded {
                self.layer_config.record(layer);
                self.report.rtn_layers.push(layer.name.clone());
            }
            info!(
                "{block_name}: quantized {}/{} layers in the block with RTN",
                folded.len(),
                num_layers
            );
        }
        Ok(())
    }

    fn quantize_tuned(&mut self, groups: &[Vec<String>]) -> Result<()> {
        let samples = self.calibration.resolve(
            self.loader.as_deref(),
            self.config.seqlen,
            self.config.nsamples,
            self.config.seed,
        )?;
        let leftover = self.leftover_layers(groups)?;
        let capture = CaptureSettings {
            seqlen: self.config.seqlen,
            nsamples: self.config.nsamples,
            precision: self.precision,
        };
        let targets = CaptureTargets::new(
            groups.iter().filter_map(|g| g.first().cloned()).collect(),
            leftover.clone(),
        );
        let mut cache = capture_with_fallback(&mut self.model, &samples, &targets, &capture)?;
        self.restore_device()?;

        let mut settings = self.config.tune_settings(self.device);
        let cached = cache.num_samples();
        if settings.batch_size > cached {
            warn!("force the train batch size to {cached} ");
            settings.batch_size = cached;
        }
        self.report.train_batch_size = Some(settings.batch_size);

        self.quantize_blocks(groups, &mut cache, &settings)?;
        self.quantize_layers(&leftover, cache, &samples, &capture, &settings)
    }

    fn quantize_blocks(
        &mut self,
        groups: &[Vec<String>],
        cache: &mut CalibrationCache,
        settings: &TuneSettings,
    ) -> Result<()> {
        let policy = self.config.schedule_policy();
        let mut evaluator = match (
            self.config.eval_after_each_optimization,
            self.evaluator.as_deref_mut(),
        ) {
            (true, Some(inner)) => Some(SnapshotEvaluator::new(
                inner,
                self.config.model_save_dir.as_deref(),
            )),
            (true, None) => {
                warn!("eval_after_each_optimization is set but no evaluator was given");
                None
            }
            (false, _) => None,
        };

        for group in groups {
            let Some(first) = group.first() else {
                continue;
            };
            let inputs = cache.take(first)?;
            let mut scheduler = BlockScheduler::new(policy.clone(), settings.clone())
                .with_quanted_input(self.config.enable_quanted_input);
            if let Some(evaluator) = evaluator.as_mut() {
                scheduler = scheduler.with_evaluator(evaluator, self.config.eval_tasks.clone());
            }
            let report = scheduler.run(&mut self.model, group, inputs, &mut self.layer_config)?;
            self.report.absorb(report);
        }
        Ok(())
    }

    /// Tune the configured layers outside blocks one by one
    fn quantize_layers(
        &mut self,
        names: &[String],
        mut cache: CalibrationCache,
        samples: &[TokenSample],
        capture: &CaptureSettings,
        settings: &TuneSettings,
    ) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let mut q_cache = if self.config.enable_quanted_input {
            info!("recapturing layer inputs from the quantized blocks");
            let targets = CaptureTargets::new(Vec::new(), names.to_vec());
            let q_cache = capture_with_fallback(&mut self.model, samples, &targets, capture)?;
            self.restore_device()?;
            Some(q_cache)
        } else {
            None
        };

        let layer_settings = settings.for_layer();
        for name in names {
            let inputs = cache.take(name)?;
            let q_inputs = q_cache.as_mut().map(|c| c.take(name)).transpose()?;
            let config = self
                .layer_config
                .get(name)
                .map(LayerQuantInfo::quant_config)
                .ok_or_else(|| Error::LayerNotFound(name.clone()))?;
            let mut result = {
                let layer = self
                    .model
                    .linear(name)
                    .ok_or_else(|| Error::LayerNotFound(name.clone()))?;
                tune_layer(
                    name,
                    layer,
                    config,
                    inputs.hidden(),
                    q_inputs.as_ref().map(|q| q.hidden()),
                    &layer_settings,
                )?
            };
            drop(inputs);
            drop(q_inputs);

            let folded = std::mem::take(&mut result.folded);
            write_back(&mut self.model, &folded)?;
            for layer in &folded {
                self.layer_config.record(layer);
            }
            self.model.release_device_cache();
            self.report.layers.push(result);
        }
        Ok(())
    }

    /// Move the model back after a capture fell back to CPU
    fn restore_device(&mut self) -> Result<()> {
        if self.model.device() != self.device {
            self.model.to_device(self.device)?;
        }
        Ok(())
    }
}
