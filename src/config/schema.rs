//! YAML schema of a quantization run

use crate::model::{Device, Precision};
use crate::optim::{LrSchedule, OptimizerKind};
use crate::quant::{GroupSize, QuantConfig, ScaleDtype};
use crate::schedule::SchedulePolicy;
use crate::tune::{SamplerKind, TuneSettings};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Iteration count used when `iters <= 0`
pub const DEFAULT_ITERS: usize = 200;

/// Calibration dataset used when none is given
pub const DEFAULT_DATASET: &str = "NeelNanda/pile-10k";

/// Complete quantization run configuration
///
/// Every key has a default, so an empty document is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoRoundConfig {
    /// Name recorded in evaluation tables
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,

    /// Weight bit width
    pub bits: u32,
    /// Weight group size (`-1` for per-channel)
    pub group_size: i64,
    /// Symmetric weight quantization
    pub sym: bool,
    pub data_type: String,
    pub scale_dtype: ScaleDtype,
    pub act_bits: u32,
    /// Defaults to `group_size`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub act_group_size: Option<i64>,
    /// Defaults to `sym`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub act_sym: Option<bool>,
    pub act_dynamic: bool,

    /// Tuning iterations per unit; `<= 0` falls back to 200
    pub iters: i64,
    /// Minimum calibration sequence length
    pub seqlen: usize,
    pub nsamples: usize,
    pub batch_size: usize,
    pub eval_batch_size: usize,
    pub gradient_accumulate_steps: usize,
    /// Rounding learning rate; defaults to `1 / iters`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lr: Option<f32>,
    /// Min/max scale learning rate; defaults to `lr`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minmax_lr: Option<f32>,
    pub enable_lr_scheduler: bool,
    pub lr_schedule: LrSchedule,
    pub enable_minmax_tuning: bool,
    pub enable_quanted_input: bool,
    pub round_to_nearest: bool,
    pub amp: bool,
    /// Tuning device; the model's own device when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
    pub low_gpu_mem_usage: bool,
    pub low_cpu_mem_usage: bool,
    pub dataset: String,
    pub sampler: SamplerKind,
    pub seed: u64,

    pub nblocks: usize,
    pub block_step_size: usize,
    pub num_lookahead_blocks: usize,
    pub num_observe_blocks: usize,
    pub cleanly_separated_lookahead: bool,
    pub isolation_experiment: bool,
    pub fine_tune_block_idx: usize,
    pub observe_block_idx: usize,
    pub attach_loss_block_indices: Vec<i64>,

    pub not_use_best_mse: bool,
    /// Early-stop gap; `<= 0` disables early stopping
    pub dynamic_max_gap: i64,
    pub optimizer: OptimizerKind,

    pub eval_after_each_optimization: bool,
    pub eval_tasks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_save_dir: Option<PathBuf>,

    /// Per-layer overrides keyed by fully-qualified layer name
    pub layer_config: BTreeMap<String, LayerOverride>,
}

impl Default for AutoRoundConfig {
    fn default() -> Self {
        Self {
            model_name: None,
            bits: 4,
            group_size: 128,
            sym: false,
            data_type: "int".to_string(),
            scale_dtype: ScaleDtype::Fp16,
            act_bits: 32,
            act_group_size: None,
            act_sym: None,
            act_dynamic: true,
            iters: DEFAULT_ITERS as i64,
            seqlen: 2048,
            nsamples: 128,
            batch_size: 8,
            eval_batch_size: 4,
            gradient_accumulate_steps: 1,
            lr: None,
            minmax_lr: None,
            enable_lr_scheduler: false,
            lr_schedule: LrSchedule::Linear,
            enable_minmax_tuning: true,
            enable_quanted_input: true,
            round_to_nearest: false,
            amp: true,
            device: None,
            low_gpu_mem_usage: false,
            low_cpu_mem_usage: false,
            dataset: DEFAULT_DATASET.to_string(),
            sampler: SamplerKind::Rand,
            seed: 42,
            nblocks: 1,
            block_step_size: 1,
            num_lookahead_blocks: 0,
            num_observe_blocks: 0,
            cleanly_separated_lookahead: false,
            isolation_experiment: false,
            fine_tune_block_idx: 0,
            observe_block_idx: 0,
            attach_loss_block_indices: vec![-1],
            not_use_best_mse: false,
            dynamic_max_gap: -1,
            optimizer: OptimizerKind::SignSgd,
            eval_after_each_optimization: false,
            eval_tasks: Vec::new(),
            model_save_dir: None,
            layer_config: BTreeMap::new(),
        }
    }
}

/// Partial quantization settings of one layer; unset keys take the run
/// defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bits: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sym: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_dtype: Option<ScaleDtype>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub act_bits: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub act_group_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub act_sym: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub act_dynamic: Option<bool>,
}

impl LayerOverride {
    /// Override that keeps a layer in float
    pub fn float() -> Self {
        Self {
            bits: Some(32),
            act_bits: Some(32),
            ..Self::default()
        }
    }
}

fn group_size(raw: i64) -> Result<GroupSize> {
    GroupSize::try_from(raw).map_err(Error::ConfigError)
}

impl AutoRoundConfig {
    /// Iterations after the `iters <= 0` fallback
    pub fn resolved_iters(&self) -> usize {
        usize::try_from(self.iters)
            .ok()
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_ITERS)
    }

    pub fn resolved_lr(&self) -> f32 {
        self.lr.unwrap_or(1.0 / self.resolved_iters() as f32)
    }

    pub fn resolved_minmax_lr(&self) -> f32 {
        self.minmax_lr.unwrap_or_else(|| self.resolved_lr())
    }

    pub fn resolved_act_group_size(&self) -> i64 {
        self.act_group_size.unwrap_or(self.group_size)
    }

    pub fn resolved_act_sym(&self) -> bool {
        self.act_sym.unwrap_or(self.sym)
    }

    /// Settings of a layer without overrides
    pub fn quant_config(&self) -> Result<QuantConfig> {
        self.layer_quant_config(&LayerOverride::default())
    }

    /// Run defaults overlaid with `layer`
    pub fn layer_quant_config(&self, layer: &LayerOverride) -> Result<QuantConfig> {
        let config = QuantConfig {
            bits: layer.bits.unwrap_or(self.bits),
            group_size: group_size(layer.group_size.unwrap_or(self.group_size))?,
            sym: layer.sym.unwrap_or(self.sym),
            data_type: layer
                .data_type
                .clone()
                .unwrap_or_else(|| self.data_type.clone()),
            scale_dtype: layer.scale_dtype.unwrap_or(self.scale_dtype),
            act_bits: layer.act_bits.unwrap_or(self.act_bits),
            act_group_size: group_size(
                layer
                    .act_group_size
                    .unwrap_or_else(|| self.resolved_act_group_size()),
            )?,
            act_sym: layer.act_sym.unwrap_or_else(|| self.resolved_act_sym()),
            act_dynamic: layer.act_dynamic.unwrap_or(self.act_dynamic),
        };
        config.validate()?;
        Ok(config)
    }

    /// Window policy selected by the scheduling keys
    pub fn schedule_policy(&self) -> SchedulePolicy {
        if self.isolation_experiment {
            SchedulePolicy::Ablation {
                fine_tune_block_idx: self.fine_tune_block_idx,
                observe_block_idx: self.observe_block_idx,
                attach_loss_block_indices: self.attach_loss_block_indices.clone(),
            }
        } else if self.cleanly_separated_lookahead {
            SchedulePolicy::CleanlySeparated {
                num_lookahead_blocks: self.num_lookahead_blocks,
            }
        } else {
            SchedulePolicy::Standard {
                nblocks: self.nblocks,
                block_step_size: self.block_step_size,
                num_lookahead_blocks: self.num_lookahead_blocks,
                num_observe_blocks: self.num_observe_blocks,
            }
        }
    }

    /// Tuning loop settings for the resolved device
    ///
    /// Dynamic loss scaling is used by the adaptive optimizer only, with AMP
    /// on an accelerator.
    pub fn tune_settings(&self, device: Device) -> TuneSettings {
        let precision = Precision::for_amp(self.amp, device);
        TuneSettings {
            iters: self.resolved_iters(),
            batch_size: self.batch_size,
            gradient_accumulate_steps: self.gradient_accumulate_steps,
            lr: self.resolved_lr(),
            minmax_lr: self.resolved_minmax_lr(),
            enable_minmax_tuning: self.enable_minmax_tuning,
            lr_schedule: self.enable_lr_scheduler.then_some(self.lr_schedule),
            sampler: self.sampler,
            seed: self.seed,
            not_use_best_mse: self.not_use_best_mse,
            dynamic_max_gap: self.dynamic_max_gap,
            optimizer: self.optimizer,
            loss_scaling: self.optimizer == OptimizerKind::AdamW
                && self.amp
                && device.is_accelerator(),
            precision,
        }
    }

    /// Tuning keys stored next to an exported model
    pub fn serialization_dict(&self) -> BTreeMap<String, serde_json::Value> {
        use serde_json::json;
        let mut dict = BTreeMap::new();
        dict.insert("bits".to_string(), json!(self.bits));
        dict.insert("group_size".to_string(), json!(self.group_size));
        dict.insert("sym".to_string(), json!(self.sym));
        dict.insert("data_type".to_string(), json!(self.data_type));
        dict.insert("enable_quanted_input".to_string(), json!(self.enable_quanted_input));
        dict.insert("enable_minmax_tuning".to_string(), json!(self.enable_minmax_tuning));
        dict.insert("seqlen".to_string(), json!(self.seqlen));
        dict.insert("train_bs".to_string(), json!(self.batch_size));
        dict.insert("scale_dtype".to_string(), json!(self.scale_dtype));
        dict.insert("lr".to_string(), json!(self.resolved_lr()));
        dict.insert("minmax_lr".to_string(), json!(self.resolved_minmax_lr()));
        dict.insert(
            "gradient_accumulate_steps".to_string(),
            json!(self.gradient_accumulate_steps),
        );
        dict.insert("iters".to_string(), json!(self.resolved_iters()));
        dict.insert("amp".to_string(), json!(self.amp));
        dict.insert("nsamples".to_string(), json!(self.nsamples));
        dict.insert("low_gpu_mem_usage".to_string(), json!(self.low_gpu_mem_usage));
        dict.insert("dataset".to_string(), json!(self.dataset));
        dict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: AutoRoundConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, AutoRoundConfig::default());
        assert_eq!(config.resolved_iters(), 200);
        assert_eq!(config.resolved_lr(), 1.0 / 200.0);
        assert_eq!(config.resolved_minmax_lr(), config.resolved_lr());
        assert_eq!(config.attach_loss_block_indices, vec![-1]);
        assert_eq!(config.dataset, DEFAULT_DATASET);
    }

    #[test]
    fn test_deserialize_full_config() {
        let yaml = r#"
bits: 2
group_size: -1
sym: true
iters: 50
lr: 0.01
sampler: fix
optimizer: adamw
enable_lr_scheduler: true
lr_schedule: cosine
device: cuda:1
nblocks: 2
num_lookahead_blocks: 1
layer_config:
  lm_head:
    bits: 8
    group_size: 32
  model.layers.0.mlp.up_proj:
    bits: 16
"#;
        let config: AutoRoundConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.bits, 2);
        assert_eq!(config.sampler, SamplerKind::Fixed);
        assert_eq!(config.optimizer, OptimizerKind::AdamW);
        assert_eq!(config.device, Some(Device::Accelerator(1)));
        assert_eq!(config.resolved_minmax_lr(), 0.01);
        assert_eq!(config.layer_config.len(), 2);

        let head = config.layer_quant_config(&config.layer_config["lm_head"]).unwrap();
        assert_eq!(head.bits, 8);
        assert_eq!(head.group_size, GroupSize::Size(32));
        assert!(head.sym);
        // activation group size follows the run default, not the override
        assert_eq!(head.act_group_size, GroupSize::PerChannel);

        let settings = config.tune_settings(Device::Accelerator(1));
        assert_eq!(settings.iters, 50);
        assert_eq!(settings.lr_schedule, Some(LrSchedule::Cosine));
        assert!(settings.loss_scaling);
        assert_eq!(settings.precision, Precision::F16);
    }

    #[test]
    fn test_non_positive_iters_fall_back() {
        let config = AutoRoundConfig {
            iters: 0,
            ..AutoRoundConfig::default()
        };
        assert_eq!(config.resolved_iters(), DEFAULT_ITERS);
        let config = AutoRoundConfig {
            iters: -5,
            ..AutoRoundConfig::default()
        };
        assert_eq!(config.resolved_iters(), DEFAULT_ITERS);
    }

    #[test]
    fn test_schedule_policy_selection() {
        let mut config = AutoRoundConfig::default();
        assert_eq!(config.schedule_policy(), SchedulePolicy::default());
        config.cleanly_separated_lookahead = true;
        config.num_lookahead_blocks = 2;
        assert_eq!(
            config.schedule_policy(),
            SchedulePolicy::CleanlySeparated {
                num_lookahead_blocks: 2
            }
        );
        config.isolation_experiment = true;
        assert!(matches!(config.schedule_policy(), SchedulePolicy::Ablation { .. }));
    }

    #[test]
    fn test_float_override() {
        let config = AutoRoundConfig::default();
        let qc = config.layer_quant_config(&LayerOverride::float()).unwrap();
        assert!(!qc.is_quantized());
        assert_eq!(qc.act_bits, 32);
    }

    #[test]
    fn test_serialization_dict_keys() {
        let dict = AutoRoundConfig::default().serialization_dict();
        assert_eq!(dict["train_bs"], serde_json::json!(8));
        assert_eq!(dict["scale_dtype"], serde_json::json!("fp16"));
        assert!(dict.contains_key("dataset"));
    }
}
