//! Learning rate schedulers
//!
//! Tuning runs a scheduler with a base value of `1.0` and multiplies each
//! parameter group's own learning rate by the result.

use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// Learning-rate decay applied over a tuning run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrSchedule {
    /// Linear decay to zero
    #[default]
    Linear,
    /// Cosine annealing to zero
    Cosine,
}

impl LrSchedule {
    /// Scheduler yielding a factor that starts at `1.0` and reaches zero
    /// after `iters` steps
    pub fn factor_scheduler(self, iters: usize) -> Box<dyn LRScheduler> {
        match self {
            LrSchedule::Linear => Box::new(LinearLR::to_zero(1.0, iters)),
            LrSchedule::Cosine => Box::new(CosineAnnealingLR::default_min(1.0, iters)),
        }
    }
}

/// Learning rate scheduler trait
pub trait LRScheduler {
    /// Get the current learning rate
    fn get_lr(&self) -> f32;

    /// Step the scheduler once per tuning iteration
    fn step(&mut self);
}

/// Linear interpolation from `lr * start_factor` to `lr * end_factor`
///
/// Formula: lr_t = lr * (s + (e - s) * min(t, T) / T)
#[derive(Clone, Debug)]
pub struct LinearLR {
    lr: f32,
    start_factor: f32,
    end_factor: f32,
    total_steps: usize,
    current_step: usize,
}

impl LinearLR {
    pub fn new(lr: f32, start_factor: f32, end_factor: f32, total_steps: usize) -> Self {
        Self {
            lr,
            start_factor,
            end_factor,
            total_steps,
            current_step: 0,
        }
    }

    /// Decay from `lr` to zero over `total_steps`
    pub fn to_zero(lr: f32, total_steps: usize) -> Self {
        Self::new(lr, 1.0, 0.0, total_steps)
    }
}

impl LRScheduler for LinearLR {
    fn get_lr(&self) -> f32 {
        if self.total_steps == 0 {
            return self.lr * self.end_factor;
        }
        let progress = self.current_step.min(self.total_steps) as f32 / self.total_steps as f32;
        self.lr * (self.start_factor + (self.end_factor - self.start_factor) * progress)
    }

    fn step(&mut self) {
        self.current_step += 1;
    }
}

/// Half-cosine decay from `lr_max` to `lr_min` over `t_max` steps
///
/// Formula: lr_t = lr_min + (lr_max - lr_min) * (1 + cos(π * min(t, T) / T)) / 2
#[derive(Clone, Debug)]
pub struct CosineAnnealingLR {
    lr_max: f32,
    lr_min: f32,
    t_max: usize,
    current_step: usize,
}

impl CosineAnnealingLR {
    pub fn new(lr_max: f32, t_max: usize, lr_min: f32) -> Self {
        Self {
            lr_max,
            lr_min,
            t_max,
            current_step: 0,
        }
    }

    /// Decay from `lr_max` to zero
    pub fn default_min(lr_max: f32, t_max: usize) -> Self {
        Self::new(lr_max, t_max, 0.0)
    }
}

impl LRScheduler for CosineAnnealingLR {
    fn get_lr(&self) -> f32 {
        if self.t_max == 0 || self.current_step >= self.t_max {
            return self.lr_min;
        }
        let phase = PI * self.current_step as f32 / self.t_max as f32;
        self.lr_min + (self.lr_max - self.lr_min) * (1.0 + phase.cos()) / 2.0
    }

    fn step(&mut self) {
        self.current_step += 1;
    }
}
