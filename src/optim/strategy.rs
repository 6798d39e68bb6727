//! Update strategies for the learnable quantization parameters
//!
//! Rounding values form one parameter group at `lr`; min and max scales form
//! a second group at `minmax_lr` and are only stepped when min/max tuning is
//! enabled.

use super::{AdamW, GradScaler, Optimizer, SGD};
use crate::autograd::scale;
use crate::quant::WrapperRegistry;
use crate::Tensor;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Loss multiplier of the sign-gradient strategy
pub const SIGN_LOSS_SCALE: f32 = 1000.0;

/// Which update rule tunes the quantization parameters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// Step by the sign of each gradient component
    #[default]
    SignSgd,
    /// AdamW on raw gradients
    #[serde(rename = "adamw", alias = "adam")]
    AdamW,
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::SignSgd => write!(f, "sign_sgd"),
            OptimizerKind::AdamW => write!(f, "adamw"),
        }
    }
}

/// Loss scaling, step direction and parameter update of one tuning run
pub trait RoundingOptimizer {
    /// Loss that is back-propagated in place of `loss`
    fn scale_loss(&self, loss: &Tensor) -> Tensor;

    /// Direction the update moves along for a gradient
    fn step_direction(&self, grad: &Array1<f32>) -> Array1<f32>;

    /// Update every parameter group and clear the gradients
    ///
    /// Returns false when the step was skipped.
    fn apply_step(&mut self, registry: &mut WrapperRegistry) -> bool;

    /// Multiply both base learning rates by `factor`
    fn set_lr_factor(&mut self, factor: f32);

    fn kind(&self) -> OptimizerKind;
}

/// Create the strategy for a tuning run
///
/// The loss scaler of the adaptive strategy is only used with `amp` on an
/// accelerator.
pub fn rounding_optimizer(
    kind: OptimizerKind,
    lr: f32,
    minmax_lr: f32,
    loss_scaling: bool,
) -> Box<dyn RoundingOptimizer> {
    match kind {
        OptimizerKind::SignSgd => Box::new(SignSgd::new(lr, minmax_lr)),
        OptimizerKind::AdamW => Box::new(AdaptiveRounding::new(lr, minmax_lr, loss_scaling)),
    }
}

/// One optimizer instance per parameter group
#[derive(Clone, Debug)]
struct ParamGroups<O> {
    rounding: O,
    min_scale: O,
    max_scale: O,
    lr: f32,
    minmax_lr: f32,
}

impl<O: Optimizer> ParamGroups<O> {
    fn new(lr: f32, minmax_lr: f32, make: impl Fn(f32) -> O) -> Self {
        Self {
            rounding: make(lr),
            min_scale: make(minmax_lr),
            max_scale: make(minmax_lr),
            lr,
            minmax_lr,
        }
    }

    fn step(&mut self, registry: &mut WrapperRegistry) {
        self.rounding.step(registry.rounding_params());
        if registry.minmax_tuning() {
            let (mins, maxs) = registry.scale_params();
            self.min_scale.step(mins);
            self.max_scale.step(maxs);
            registry.clamp_scales();
        }
    }

    fn set_lr_factor(&mut self, factor: f32) {
        self.rounding.set_lr(self.lr * factor);
        self.min_scale.set_lr(self.minmax_lr * factor);
        self.max_scale.set_lr(self.minmax_lr * factor);
    }
}

/// Replace every gradient with its step direction
fn rewrite_grads(params: &[Tensor], direction: impl Fn(&Array1<f32>) -> Array1<f32>) {
    for param in params {
        if let Some(grad) = param.grad() {
            param.set_grad(direction(&grad));
        }
    }
}

fn rewrite_all(registry: &mut WrapperRegistry, direction: impl Fn(&Array1<f32>) -> Array1<f32>) {
    rewrite_grads(registry.rounding_params(), &direction);
    let (mins, maxs) = registry.scale_params();
    rewrite_grads(mins, &direction);
    rewrite_grads(maxs, &direction);
}

/// Sign-gradient descent: `p -= lr * sign(grad)`, with `sign(0) = 0`
#[derive(Clone, Debug)]
pub struct SignSgd {
    groups: ParamGroups<SGD>,
}

impl SignSgd {
    pub fn new(lr: f32, minmax_lr: f32) -> Self {
        Self {
            groups: ParamGroups::new(lr, minmax_lr, SGD::new),
        }
    }
}

impl RoundingOptimizer for SignSgd {
    fn scale_loss(&self, loss: &Tensor) -> Tensor {
        scale(loss, SIGN_LOSS_SCALE)
    }

    fn step_direction(&self, grad: &Array1<f32>) -> Array1<f32> {
        grad.mapv(|g| if g > 0.0 { 1.0 } else if g < 0.0 { -1.0 } else { 0.0 })
    }

    fn apply_step(&mut self, registry: &mut WrapperRegistry) -> bool {
        rewrite_all(registry, |g| self.step_direction(g));
        self.groups.step(registry);
        registry.zero_grad();
        true
    }

    fn set_lr_factor(&mut self, factor: f32) {
        self.groups.set_lr_factor(factor);
    }

    fn kind(&self) -> OptimizerKind {
        OptimizerKind::SignSgd
    }
}

/// AdamW without weight decay, optionally behind a dynamic loss scaler
#[derive(Clone, Debug)]
pub struct AdaptiveRounding {
    groups: ParamGroups<AdamW>,
    scaler: Option<GradScaler>,
}

impl AdaptiveRounding {
    pub fn new(lr: f32, minmax_lr: f32, loss_scaling: bool) -> Self {
        Self {
            groups: ParamGroups::new(lr, minmax_lr, AdamW::without_decay),
            scaler: loss_scaling.then(GradScaler::default),
        }
    }

    pub fn scaler(&self) -> Option<&GradScaler> {
        self.scaler.as_ref()
    }
}

impl RoundingOptimizer for AdaptiveRounding {
    fn scale_loss(&self, loss: &Tensor) -> Tensor {
        match &self.scaler {
            Some(scaler) => scale(loss, scaler.scale()),
            None => loss.clone(),
        }
    }

    fn step_direction(&self, grad: &Array1<f32>) -> Array1<f32> {
        grad.clone()
    }

    fn apply_step(&mut self, registry: &mut WrapperRegistry) -> bool {
        let finite = match &self.scaler {
            Some(scaler) => {
                let (mins, maxs) = registry.scale_params();
                let scales_ok = scaler.unscale(mins) & scaler.unscale(maxs);
                scaler.unscale(registry.rounding_params()) && scales_ok
            }
            None => true,
        };
        if finite {
            self.groups.step(registry);
        }
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.update(finite);
        }
        registry.zero_grad();
        finite
    }

    fn set_lr_factor(&mut self, factor: f32) {
        self.groups.set_lr_factor(factor);
    }

    fn kind(&self) -> OptimizerKind {
        OptimizerKind::AdamW
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Linear;
    use crate::quant::{GroupSize, QuantConfig};
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn registry(minmax: bool) -> WrapperRegistry {
        let mut reg = WrapperRegistry::new(minmax);
        let layer = Linear::new(Array2::from_elem((2, 2), 0.5), None);
        reg.wrap("fc", &layer, QuantConfig::new(4, GroupSize::PerChannel, true))
            .unwrap();
        reg
    }

    fn set_grads(reg: &mut WrapperRegistry) {
        reg.rounding_params()[0].set_grad(ndarray::arr1(&[0.3, -2.0, 0.0, 1e-9]));
        let (mins, maxs) = reg.scale_params();
        mins[0].set_grad(ndarray::arr1(&[1.0, -1.0]));
        maxs[0].set_grad(ndarray::arr1(&[-5.0, 0.0]));
    }

    #[test]
    fn test_sign_step_moves_by_lr() {
        let mut reg = registry(true);
        set_grads(&mut reg);
        let mut opt = SignSgd::new(0.1, 0.01);
        assert!(opt.apply_step(&mut reg));

        let v = reg.rounding_params()[0].data().to_vec();
        assert_eq!(v, vec![-0.1, 0.1, 0.0, -0.1]);
        let (mins, maxs) = reg.scale_params();
        assert_abs_diff_eq!(mins[0].data()[0], 0.99, epsilon = 1e-6);
        assert_eq!(mins[0].data()[1], 1.0);
        assert_eq!(maxs[0].data()[0], 1.0);
        assert_eq!(maxs[0].data()[1], 1.0);
        assert!(reg.rounding_params()[0].grad().is_none());
    }

    #[test]
    fn test_scales_stay_in_unit_range() {
        let mut reg = registry(true);
        let mut opt = SignSgd::new(0.1, 0.4);
        for _ in 0..4 {
            set_grads(&mut reg);
            opt.apply_step(&mut reg);
        }
        let (mins, maxs) = reg.scale_params();
        for t in mins.iter().chain(maxs.iter()) {
            assert!(t.data().iter().all(|&x| (0.0..=1.0).contains(&x)));
        }
        // min[0] was pushed down past zero, max[0] up past one
        assert_eq!(mins[0].data()[0], 0.0);
        assert_eq!(maxs[0].data()[0], 1.0);
    }

    #[test]
    fn test_scales_frozen_without_minmax_tuning() {
        let mut reg = registry(false);
        set_grads(&mut reg);
        let mut opt = SignSgd::new(0.1, 0.1);
        opt.apply_step(&mut reg);
        let (mins, _) = reg.scale_params();
        assert!(mins[0].data().iter().all(|&x| x == 1.0));
    }

    #[test]
    fn test_lr_factor_scales_both_groups() {
        let mut reg = registry(true);
        set_grads(&mut reg);
        let mut opt = SignSgd::new(0.1, 0.01);
        opt.set_lr_factor(0.5);
        opt.apply_step(&mut reg);
        assert_abs_diff_eq!(reg.rounding_params()[0].data()[0], -0.05, epsilon = 1e-7);
        let (mins, _) = reg.scale_params();
        assert_abs_diff_eq!(mins[0].data()[0], 0.995, epsilon = 1e-6);
    }

    #[test]
    fn test_loss_scaling() {
        let loss = Tensor::from_vec(vec![0.002], true);
        assert_abs_diff_eq!(SignSgd::new(0.1, 0.1).scale_loss(&loss).item(), 2.0, epsilon = 1e-6);
        let plain = AdaptiveRounding::new(0.1, 0.1, false);
        assert_eq!(plain.scale_loss(&loss).item(), 0.002);
        let scaled = AdaptiveRounding::new(0.1, 0.1, true);
        assert_abs_diff_eq!(scaled.scale_loss(&loss).item(), 2.048, epsilon = 1e-5);
    }

    #[test]
    fn test_adaptive_skips_overflowing_step() {
        let mut reg = registry(true);
        reg.rounding_params()[0].set_grad(ndarray::arr1(&[f32::NAN, 0.0, 0.0, 0.0]));
        let mut opt = AdaptiveRounding::new(0.1, 0.1, true);
        assert!(!opt.apply_step(&mut reg));
        assert!(reg.rounding_params()[0].data().iter().all(|&x| x == 0.0));
        assert_eq!(opt.scaler().map(GradScaler::scale), Some(512.0));
    }

    #[test]
    fn test_factory_selects_strategy() {
        assert_eq!(rounding_optimizer(OptimizerKind::SignSgd, 0.1, 0.1, true).kind(), OptimizerKind::SignSgd);
        assert_eq!(rounding_optimizer(OptimizerKind::AdamW, 0.1, 0.1, false).kind(), OptimizerKind::AdamW);
        let kind: OptimizerKind = serde_yaml::from_str("adam").unwrap();
        assert_eq!(kind, OptimizerKind::AdamW);
    }
}
