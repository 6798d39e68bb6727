//! Evaluation hooks run between optimization windows
//!
//! The evaluation harness itself stays outside the crate: an [`Evaluator`]
//! receives the partly quantized model and returns named metrics, which are
//! collected into an [`EvalTable`].
//!
//! # Example
//!
//! ```rust
//! use autoround::model::QuantModel;
//! use autoround::schedule::Evaluator;
//! use std::collections::BTreeMap;
//!
//! struct CountLayers;
//!
//! impl Evaluator for CountLayers {
//!     fn evaluate(
//!         &mut self,
//!         model: &dyn QuantModel,
//!         _tasks: &[String],
//!         _tag: &str,
//!     ) -> autoround::Result<BTreeMap<String, f64>> {
//!         let mut metrics = BTreeMap::new();
//!         metrics.insert("layers".to_string(), model.linear_names().len() as f64);
//!         Ok(metrics)
//!     }
//! }
//! ```

use crate::model::QuantModel;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;

/// External benchmark harness
pub trait Evaluator {
    /// Evaluate the model on `tasks`
    ///
    /// # Arguments
    /// * `tag` - identifies the quantization state, usable as a results
    ///   file suffix
    fn evaluate(
        &mut self,
        model: &dyn QuantModel,
        tasks: &[String],
        tag: &str,
    ) -> Result<BTreeMap<String, f64>>;

    /// Name used in logs
    fn name(&self) -> &str {
        "Evaluator"
    }
}

/// Tag of the model state after a window: number of quantized blocks and the
/// fine-tuned range
pub fn eval_tag(fine_tune: &Range<usize>) -> String {
    format!(
        "_num-quantized-blocks::{}_fine-tune-block-indices::{}:{}",
        fine_tune.end, fine_tune.start, fine_tune.end
    )
}

/// One evaluation row
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvalRecord {
    pub num_quantized_blocks: usize,
    /// `start:end` of the fine-tuned range
    pub fine_tune_block_indices: String,
    pub metrics: BTreeMap<String, f64>,
}

impl EvalRecord {
    pub fn new(fine_tune: &Range<usize>, metrics: BTreeMap<String, f64>) -> Self {
        Self {
            num_quantized_blocks: fine_tune.end,
            fine_tune_block_indices: format!("{}:{}", fine_tune.start, fine_tune.end),
            metrics,
        }
    }
}

/// Evaluation results accumulated over a run
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalTable {
    rows: Vec<EvalRecord>,
}

impl EvalTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: EvalRecord) {
        self.rows.push(record);
    }

    /// Move the rows of `other` to the end of this table
    pub fn append(&mut self, mut other: EvalTable) {
        self.rows.append(&mut other.rows);
    }

    pub fn rows(&self) -> &[EvalRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Union of the metric names of every row, sorted
    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .rows
            .iter()
            .flat_map(|r| r.metrics.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Values of one metric in row order; `None` where a row lacks it
    pub fn column(&self, metric: &str) -> Vec<Option<f64>> {
        self.rows.iter().map(|r| r.metrics.get(metric).copied()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_eval_tag_format() {
        assert_eq!(
            eval_tag(&(2..4)),
            "_num-quantized-blocks::4_fine-tune-block-indices::2:4"
        );
    }

    #[test]
    fn test_table_columns() {
        let mut table = EvalTable::new();
        table.push(EvalRecord::new(&(0..1), metrics(&[("ppl", 12.5)])));
        table.push(EvalRecord::new(&(1..2), metrics(&[("ppl", 13.0), ("acc", 0.5)])));
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows()[1].fine_tune_block_indices, "1:2");
        assert_eq!(table.rows()[1].num_quantized_blocks, 2);
        assert_eq!(table.metric_names(), vec!["acc".to_string(), "ppl".to_string()]);
        assert_eq!(table.column("acc"), vec![None, Some(0.5)]);
    }
}
