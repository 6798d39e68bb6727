//! Dynamic loss scaling for fp16 tuning

use crate::Tensor;

/// Loss scale multiplier with overflow back-off
///
/// Gradients of the scaled loss are divided by the scale before the step; a
/// non-finite gradient skips the step and halves the scale.
#[derive(Clone, Debug)]
pub struct GradScaler {
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: usize,
    steps_since_growth: usize,
    overflow_count: usize,
}

impl GradScaler {
    pub fn new(initial_scale: f32, growth_interval: usize) -> Self {
        Self {
            scale: initial_scale,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval,
            steps_since_growth: 0,
            overflow_count: 0,
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count
    }

    /// Divide the gradients by the scale; false if any value is not finite
    pub fn unscale(&self, params: &[Tensor]) -> bool {
        let inv_scale = 1.0 / self.scale;
        let mut finite = true;
        for param in params {
            if let Some(grad) = param.grad() {
                let unscaled = grad.mapv(|g| g * inv_scale);
                finite &= unscaled.iter().all(|g| g.is_finite());
                param.set_grad(unscaled);
            }
        }
        finite
    }

    /// Grow after `growth_interval` clean steps, back off on overflow
    pub fn update(&mut self, grads_finite: bool) {
        if grads_finite {
            self.steps_since_growth += 1;
            if self.steps_since_growth >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.steps_since_growth = 0;
            }
        } else {
            self.overflow_count += 1;
            self.scale = (self.scale * self.backoff_factor).max(1.0);
            self.steps_since_growth = 0;
        }
    }
}

impl Default for GradScaler {
    /// Initial scale 1024, growth every 100000 clean steps
    fn default() -> Self {
        Self::new(1024.0, 100_000)
    }
}
