//! AdamW: Adam with decoupled weight decay

use super::Optimizer;
use crate::Tensor;
use ndarray::{Array1, Zip};

/// Running first and second moment of one parameter tensor
#[derive(Clone, Debug)]
struct Moments {
    first: Array1<f32>,
    second: Array1<f32>,
}

impl Moments {
    fn zeros(len: usize) -> Self {
        Self {
            first: Array1::zeros(len),
            second: Array1::zeros(len),
        }
    }
}

/// Adam with decoupled weight decay
///
/// Weight decay is applied to the parameters directly instead of being added
/// to the gradient:
///
/// θ_t = (1 - lr * λ) * θ_{t-1} - lr_t * m_t / (√v_t + ε)
///
/// with the bias correction folded into `lr_t`.
#[derive(Clone, Debug)]
pub struct AdamW {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    steps: i32,
    /// One slot per parameter, filled on its first gradient
    moments: Vec<Option<Moments>>,
}

impl AdamW {
    pub fn new(lr: f32, beta1: f32, beta2: f32, epsilon: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            steps: 0,
            moments: Vec::new(),
        }
    }

    /// AdamW with weight decay disabled, as used for quantization parameters
    pub fn without_decay(lr: f32) -> Self {
        Self::new(lr, 0.9, 0.999, 1e-8, 0.0)
    }

    /// Step size after bias correction of both moments
    fn corrected_lr(&self) -> f32 {
        let c1 = 1.0 - self.beta1.powi(self.steps);
        let c2 = 1.0 - self.beta2.powi(self.steps);
        self.lr * c2.sqrt() / c1
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, params: &mut [Tensor]) {
        if self.moments.len() < params.len() {
            self.moments.resize(params.len(), None);
        }
        self.steps = self.steps.saturating_add(1);
        let lr_t = self.corrected_lr();
        let decay = 1.0 - self.lr * self.weight_decay;
        let (beta1, beta2, eps) = (self.beta1, self.beta2, self.epsilon);

        for (param, slot) in params.iter_mut().zip(self.moments.iter_mut()) {
            let Some(grad) = param.grad() else {
                continue;
            };
            let state = slot.get_or_insert_with(|| Moments::zeros(grad.len()));
            Zip::from(param.data_mut())
                .and(&mut state.first)
                .and(&mut state.second)
                .and(&grad)
                .for_each(|theta, m, v, &g| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    *theta = *theta * decay - lr_t * *m / (v.sqrt() + eps);
                });
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_adamw_quadratic_convergence() {
        let mut params = vec![Tensor::from_vec(vec![5.0, -3.0, 2.0], true)];
        let mut optimizer = AdamW::without_decay(0.1);

        for _ in 0..100 {
            let grad = params[0].data().mapv(|x| 2.0 * x);
            params[0].set_grad(grad);
            optimizer.step(&mut params);
        }

        for &val in params[0].data().iter() {
            assert!(val.abs() < 0.5, "Value {} did not converge", val);
        }
    }

    #[test]
    fn test_adamw_weight_decay() {
        let mut params = vec![Tensor::from_vec(vec![1.0], true)];
        let mut optimizer = AdamW::new(0.1, 0.9, 0.999, 1e-8, 0.1);
        params[0].set_grad(ndarray::arr1(&[0.0]));

        optimizer.step(&mut params);

        // (1 - lr * λ) * θ = 0.99
        assert_abs_diff_eq!(params[0].data()[0], 0.99, epsilon = 1e-6);
    }

    #[test]
    fn test_first_step_size_is_lr() {
        // bias-corrected first step moves every coordinate by ~lr regardless of scale
        let mut params = vec![Tensor::from_vec(vec![0.0, 0.0], true)];
        params[0].set_grad(ndarray::arr1(&[1000.0, -0.001]));
        let mut optimizer = AdamW::without_decay(0.01);
        optimizer.step(&mut params);
        assert_abs_diff_eq!(params[0].data()[0], -0.01, epsilon = 1e-5);
        assert_abs_diff_eq!(params[0].data()[1], 0.01, epsilon = 1e-4);
    }
}
