//! Optimizers for the learnable quantization parameters

mod adamw;
mod optimizer;
mod scaler;
mod scheduler;
mod sgd;
mod strategy;

pub use adamw::AdamW;
pub use optimizer::Optimizer;
pub use scaler::GradScaler;
pub use scheduler::{CosineAnnealingLR, LRScheduler, LinearLR, LrSchedule};
pub use sgd::SGD;
pub use strategy::{
    rounding_optimizer, AdaptiveRounding, OptimizerKind, RoundingOptimizer, SignSgd,
    SIGN_LOSS_SCALE,
};
