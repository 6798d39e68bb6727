//! Block scheduling
//!
//! Cuts the ordered block list into (fine-tune, attach-loss, observe)
//! windows and runs the window tuner over them, carrying the reference and
//! quantized activation streams from one window to the next.

mod callback;
mod scheduler;
mod windows;

pub use callback::{eval_tag, EvalRecord, EvalTable, Evaluator};
pub use scheduler::{AblationRow, BlockScheduler, ScheduleReport, SchedulePolicy, WindowReport};
pub(crate) use scheduler::write_back;
pub use windows::{ablation_windows, cleanly_separated_windows, standard_windows, BlockWindow};
