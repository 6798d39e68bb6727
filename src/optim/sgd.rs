//! Plain gradient descent

use super::Optimizer;
use crate::Tensor;

/// `param -= lr * grad`
///
/// Paired with sign directions it gives the sign-gradient update used for
/// rounding values.
#[derive(Clone, Debug)]
pub struct SGD {
    lr: f32,
}

impl SGD {
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }
}

impl Optimizer for SGD {
    fn step(&mut self, params: &mut [Tensor]) {
        for param in params.iter_mut() {
            if let Some(grad) = param.grad() {
                *param.data_mut() = param.data() - &(&grad * self.lr);
            }
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
    fn test_step_skips_params_without_grad() {
        let mut params = vec![
            Tensor::from_vec(vec![1.0, 2.0], true),
            Tensor::from_vec(vec![3.0], true),
        ];
        params[0].set_grad(ndarray::arr1(&[1.0, -2.0]));
        let mut opt = SGD::new(0.5);
        opt.step(&mut params);

        assert_abs_diff_eq!(params[0].data()[0], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(params[0].data()[1], 3.0, epsilon = 1e-6);
        assert_eq!(params[1].data()[0], 3.0);

        opt.zero_grad(&mut params);
        assert!(params[0].grad().is_none());
    }
}
