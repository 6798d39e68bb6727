//! Sign-gradient tuning of wrapped weights
//!
//! - [`tune_window`] tunes the fine-tune blocks of one window against the
//!   output of its attach segment and tracks the observe segment
//! - [`tune_layer`] tunes a single layer outside any block
//! - [`CurveStats`] summarises per-iteration MSE histories

mod result;
mod sampler;
mod stats;
mod tuner;

#[cfg(test)]
mod tests;

pub use result::{TuningResult, WindowOutcome};
pub use sampler::{BatchSampler, SamplerKind};
pub use stats::{absolute_changes, convergence_iter, moving_average, slope, CurveStats};
pub use tuner::{tune_layer, tune_window, TuneSettings, WindowSegments};
