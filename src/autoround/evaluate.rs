//! Evaluation between windows with a saved copy of the model

use crate::io::{save_weights, ExportMetadata, QDQ_FORMAT, WEIGHTS_FILE};
use crate::model::QuantModel;
use crate::schedule::Evaluator;
use crate::Result;
use std::collections::BTreeMap;
use std::path::Path;

/// Writes the current weights to the save directory before delegating
///
/// The directory is overwritten at every window, so an external harness
/// reading it always sees the latest quantization state.
pub(crate) struct SnapshotEvaluator<'a, E: Evaluator + ?Sized> {
    inner: &'a mut E,
    save_dir: Option<&'a Path>,
}

impl<'a, E: Evaluator + ?Sized> SnapshotEvaluator<'a, E> {
    pub(crate) fn new(inner: &'a mut E, save_dir: Option<&'a Path>) -> Self {
        Self { inner, save_dir }
    }
}

impl<E: Evaluator + ?Sized> Evaluator for SnapshotEvaluator<'_, E> {
    fn evaluate(
        &mut self,
        model: &dyn QuantModel,
        tasks: &[String],
        tag: &str,
    ) -> Result<BTreeMap<String, f64>> {
        if let Some(dir) = self.save_dir {
            std::fs::create_dir_all(dir)?;
            let metadata = ExportMetadata::new(QDQ_FORMAT).with_model_name(Some(tag.to_string()));
            save_weights(model, dir.join(WEIGHTS_FILE), &metadata)?;
        }
        self.inner.evaluate(model, tasks, tag)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
