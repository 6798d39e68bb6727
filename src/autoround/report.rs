//! What a quantization run produced

use crate::schedule::{AblationRow, EvalTable, ScheduleReport, WindowReport};
use crate::tune::TuningResult;
use std::time::Duration;

/// Results of [`AutoRound::quantize`](super::AutoRound::quantize)
#[derive(Clone, Debug, Default)]
pub struct QuantizeReport {
    /// Block windows in tuning order, over every block group
    pub windows: Vec<WindowReport>,
    /// Layers outside blocks, in tuning order
    pub layers: Vec<TuningResult>,
    pub ablation: Vec<AblationRow>,
    pub evaluations: EvalTable,
    /// Layers folded with round-to-nearest
    pub rtn_layers: Vec<String>,
    pub quantized_layers: Vec<String>,
    pub unquantized_layers: Vec<String>,
    /// Batch size actually used after clamping to the cached sample count
    pub train_batch_size: Option<usize>,
    pub elapsed: Duration,
}

impl QuantizeReport {
    pub(crate) fn absorb(&mut self, report: ScheduleReport) {
        self.windows.extend(report.windows);
        self.ablation.extend(report.ablation);
        self.evaluations.append(report.evaluations);
    }

    /// Tuning results of every block window and layer
    pub fn tuning_results(&self) -> impl Iterator<Item = &TuningResult> {
        self.windows
            .iter()
            .filter_map(|w| w.tuning.as_ref())
            .chain(self.layers.iter())
    }
}
