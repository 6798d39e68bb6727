//! Outcome of tuning one unit

use crate::quant::{QuantizedLinear, WrapperSnapshot};
use ndarray::Array2;

/// Diagnostics and folded layers of one tuned block window or layer
#[derive(Clone, Debug)]
pub struct TuningResult {
    /// Fine-tuned block names or the layer name
    pub unit: String,
    pub init_loss: f32,
    /// Lowest iteration loss seen
    pub best_loss: f32,
    /// Loss that was reported: the best loss, or the last one when the best
    /// checkpoint is not used
    pub final_loss: f32,
    /// Iteration of the folded values (`iters` when the best checkpoint is
    /// not used)
    pub best_iter: usize,
    pub iterations_run: usize,
    /// Iteration at which stagnation stopped the loop
    pub early_stopped_at: Option<usize>,
    /// Training loss per iteration
    pub loss_history: Vec<f32>,
    /// Observe-segment MSE per iteration
    pub observe_history: Vec<f32>,
    /// Learnable values that were folded into the weights
    pub best: Option<WrapperSnapshot>,
    pub quantized_layers: Vec<String>,
    pub unquantized_layers: Vec<String>,
    /// Quantize-dequantized layers ready to be written back to the model
    pub folded: Vec<QuantizedLinear>,
}

impl TuningResult {
    /// Layers in the unit, tuned or not
    pub fn num_layers(&self) -> usize {
        self.quantized_layers.len() + self.unquantized_layers.len()
    }

    /// Observe MSE of the last iteration
    pub fn last_observe_mse(&self) -> Option<f32> {
        self.observe_history.last().copied()
    }
}

/// Result of one block window
#[derive(Clone, Debug)]
pub struct WindowOutcome {
    /// Full-precision outputs of the fine-tune segment
    pub fp_outputs: Vec<Array2<f32>>,
    /// `None` when the segment had nothing to tune
    pub tuning: Option<TuningResult>,
    pub quantized_layers: Vec<String>,
    pub unquantized_layers: Vec<String>,
}

impl WindowOutcome {
    /// Observe-segment MSE per iteration; empty when nothing was tuned
    pub fn observe_history(&self) -> &[f32] {
        self.tuning
            .as_ref()
            .map_or(&[], |t| t.observe_history.as_slice())
    }
}
