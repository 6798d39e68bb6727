//! Configuration validation

use super::schema::AutoRoundConfig;

/// Validation error type
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid bits: {0} (must be > 0)")]
    InvalidBits(u32),

    #[error("Invalid act_bits: {0} (must be > 0)")]
    InvalidActBits(u32),

    #[error("Invalid group size: {0} (must be -1 for per channel or >= 1)")]
    InvalidGroupSize(i64),

    #[error("Invalid act_group_size: {0} (must be -1 for per channel or >= 1)")]
    InvalidActGroupSize(i64),

    #[error("Invalid batch size: {0} (must be > 0)")]
    InvalidBatchSize(usize),

    #[error("Invalid eval batch size: {0} (must be > 0)")]
    InvalidEvalBatchSize(usize),

    #[error("Invalid seqlen: {0} (must be > 0)")]
    InvalidSeqlen(usize),

    #[error("Invalid nblocks: {0} (must be > 0)")]
    InvalidNblocks(usize),

    #[error("Invalid block_step_size: {step} (must be between 1 and nblocks {nblocks})")]
    InvalidBlockStepSize { step: usize, nblocks: usize },

    #[error("Invalid gradient_accumulate_steps: {0} (must be > 0)")]
    InvalidGradientAccumulateSteps(usize),

    #[error("num_lookahead_blocks must be > 0 when cleanly_separated_lookahead is set")]
    MissingLookahead,

    #[error("fine_tune_block_idx {fine_tune} should not exceed observe_block_idx {observe}")]
    FineTuneAfterObserve { fine_tune: usize, observe: usize },

    #[error("-1 must be the only element of attach_loss_block_indices, got {0:?}")]
    MixedSweepMarker(Vec<i64>),

    #[error("attach loss block index {index} outside {fine_tune}..={observe}")]
    AttachLossOutOfRange {
        index: i64,
        fine_tune: usize,
        observe: usize,
    },

    #[error("{0} must be provided when eval_after_each_optimization is set")]
    MissingEvalSetting(&'static str),

    #[error("only dynamic activation quantization is supported")]
    StaticActivation,

    #[error("Invalid layer override for {layer}: {reason}")]
    InvalidLayerOverride { layer: String, reason: String },
}

fn valid_group_size(value: i64) -> bool {
    value == -1 || value >= 1
}

/// Validate a quantization run configuration
///
/// Checks:
/// - Bit widths and group sizes of the defaults and every override
/// - Positive batch, sequence and window sizes
/// - Window index ordering of the ablation sweep
/// - Evaluation settings when per-window evaluation is requested
///
/// `iters <= 0` is accepted; it is resolved to the default count.
pub fn validate_config(config: &AutoRoundConfig) -> Result<(), ValidationError> {
    if config.bits == 0 {
        return Err(ValidationError::InvalidBits(config.bits));
    }
    if config.act_bits == 0 {
        return Err(ValidationError::InvalidActBits(config.act_bits));
    }
    if !valid_group_size(config.group_size) {
        return Err(ValidationError::InvalidGroupSize(config.group_size));
    }
    let act_group_size = config.resolved_act_group_size();
    if !valid_group_size(act_group_size) {
        return Err(ValidationError::InvalidActGroupSize(act_group_size));
    }

    if config.cleanly_separated_lookahead && config.num_lookahead_blocks == 0 {
        return Err(ValidationError::MissingLookahead);
    }
    if config.eval_after_each_optimization {
        if config.model_save_dir.is_none() {
            return Err(ValidationError::MissingEvalSetting("model_save_dir"));
        }
        if config.eval_tasks.is_empty() {
            return Err(ValidationError::MissingEvalSetting("eval_tasks"));
        }
    }

    if config.fine_tune_block_idx > config.observe_block_idx {
        return Err(ValidationError::FineTuneAfterObserve {
            fine_tune: config.fine_tune_block_idx,
            observe: config.observe_block_idx,
        });
    }
    let indices = &config.attach_loss_block_indices;
    if indices.contains(&-1) {
        if indices.len() != 1 {
            return Err(ValidationError::MixedSweepMarker(indices.clone()));
        }
    } else if let Some(&index) = indices.iter().find(|&&i| {
        usize::try_from(i).map_or(true, |i| {
            i < config.fine_tune_block_idx || i > config.observe_block_idx
        })
    }) {
        return Err(ValidationError::AttachLossOutOfRange {
            index,
            fine_tune: config.fine_tune_block_idx,
            observe: config.observe_block_idx,
        });
    }

    if config.batch_size == 0 {
        return Err(ValidationError::InvalidBatchSize(config.batch_size));
    }
    if config.eval_batch_size == 0 {
        return Err(ValidationError::InvalidEvalBatchSize(config.eval_batch_size));
    }
    if config.seqlen == 0 {
        return Err(ValidationError::InvalidSeqlen(config.seqlen));
    }
    if config.nblocks == 0 {
        return Err(ValidationError::InvalidNblocks(config.nblocks));
    }
    if config.block_step_size == 0 || config.block_step_size > config.nblocks {
        return Err(ValidationError::InvalidBlockStepSize {
            step: config.block_step_size,
            nblocks: config.nblocks,
        });
    }
    if config.gradient_accumulate_steps == 0 {
        return Err(ValidationError::InvalidGradientAccumulateSteps(
            config.gradient_accumulate_steps,
        ));
    }
    if !config.act_dynamic {
        return Err(ValidationError::StaticActivation);
    }

    for (layer, over) in &config.layer_config {
        let invalid = |reason: &str| ValidationError::InvalidLayerOverride {
            layer: layer.clone(),
            reason: reason.to_string(),
        };
        if over.bits == Some(0) || over.act_bits == Some(0) {
            return Err(invalid("bits must be > 0"));
        }
        if over.group_size.is_some_and(|g| !valid_group_size(g))
            || over.act_group_size.is_some_and(|g| !valid_group_size(g))
        {
            return Err(invalid("group size must be -1 or >= 1"));
        }
        if over.act_dynamic == Some(false) {
            return Err(invalid("only dynamic activation quantization is supported"));
        }
    }

    Ok(())
}
