//! Autograd operations with backward passes

use super::backward::parents_of;
use super::tensor::GradCell;
use super::{BackwardOp, Tensor};
use crate::{Error, Result};
use ndarray::{Array1, Array2, Axis};
use std::rc::Rc;

fn flatten(a: Array2<f32>) -> Array1<f32> {
    a.iter().copied().collect()
}

/// Add two tensors
pub fn add(a: &Tensor, b: &Tensor) -> Tensor {
    let data = a.data() + b.data();
    let requires_grad = a.requires_grad() || b.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(AddBackward {
            a: a.clone(),
            b: b.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct AddBackward {
    a: Tensor,
    b: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for AddBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                self.a.accumulate_grad(grad.clone());
            }
            if self.b.requires_grad() {
                self.b.accumulate_grad(grad.clone());
            }
        }
    }

    fn parents(&self) -> Vec<Rc<dyn BackwardOp>> {
        parents_of(&[&self.a, &self.b])
    }
}

/// Subtract `b` from `a`
pub fn sub(a: &Tensor, b: &Tensor) -> Tensor {
    add(a, &scale(b, -1.0))
}

/// Multiply two tensors element-wise
pub fn mul(a: &Tensor, b: &Tensor) -> Tensor {
    let data = a.data() * b.data();
    let requires_grad = a.requires_grad() || b.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(MulBackward {
            a: a.clone(),
            b: b.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct MulBackward {
    a: Tensor,
    b: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for MulBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂L/∂a = ∂L/∂out * b
                self.a.accumulate_grad(grad * self.b.data());
            }
            if self.b.requires_grad() {
                // ∂L/∂b = ∂L/∂out * a
                self.b.accumulate_grad(grad * self.a.data());
            }
        }
    }

    fn parents(&self) -> Vec<Rc<dyn BackwardOp>> {
        parents_of(&[&self.a, &self.b])
    }
}

/// Scale tensor by a scalar
pub fn scale(a: &Tensor, factor: f32) -> Tensor {
    let data = a.data() * factor;
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(ScaleBackward {
            a: a.clone(),
            factor,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct ScaleBackward {
    a: Tensor,
    factor: f32,
    result_grad: GradCell,
}

impl BackwardOp for ScaleBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                self.a.accumulate_grad(grad * self.factor);
            }
        }
    }

    fn parents(&self) -> Vec<Rc<dyn BackwardOp>> {
        parents_of(&[&self.a])
    }
}

const SQRT_2_OVER_PI: f32 = 0.797_884_6; // √(2/π)
const GELU_COEFF: f32 = 0.044_715;

/// GELU activation (Gaussian Error Linear Unit)
///
/// GELU(x) ≈ 0.5 * x * (1 + tanh(√(2/π) * (x + 0.044715 * x³)))
pub fn gelu(a: &Tensor) -> Tensor {
    let data = a.data().mapv(|x| {
        let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
        0.5 * x * (1.0 + inner.tanh())
    });

    let requires_grad = a.requires_grad();
    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(GeluBackward {
            a: a.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct GeluBackward {
    a: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for GeluBackward {
    fn backward(&self) {
        if let Some(grad_output) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂GELU/∂x = 0.5 * (1 + tanh(z)) + 0.5 * x * sech²(z) * dz/dx
                let grad_a: Array1<f32> = self
                    .a
                    .data()
                    .iter()
                    .zip(grad_output.iter())
                    .map(|(&x, &grad)| {
                        let x2 = x * x;
                        let z = SQRT_2_OVER_PI * (x + GELU_COEFF * x2 * x);
                        let tanh_z = z.tanh();
                        let sech2_z = 1.0 - tanh_z * tanh_z;
                        let dz_dx = SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_COEFF * x2);
                        grad * (0.5 * (1.0 + tanh_z) + 0.5 * x * sech2_z * dz_dx)
                    })
                    .collect();

                self.a.accumulate_grad(grad_a);
            }
        }
    }

    fn parents(&self) -> Vec<Rc<dyn BackwardOp>> {
        parents_of(&[&self.a])
    }
}

/// Affine map `y = x · Wᵀ + b` over the rows of `x`
///
/// # Arguments
/// * `x` - Input (rows × in_features, flattened)
/// * `weight` - Weight (out_features × in_features, flattened)
/// * `bias` - Optional bias (out_features)
pub fn linear(
    x: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    in_features: usize,
    out_features: usize,
) -> Result<Tensor> {
    if in_features == 0 || x.len() % in_features != 0 {
        return Err(Error::ShapeMismatch {
            expected: vec![in_features],
            got: vec![x.len()],
        });
    }
    if let Some(b) = bias {
        if b.len() != out_features {
            return Err(Error::ShapeMismatch {
                expected: vec![out_features],
                got: vec![b.len()],
            });
        }
    }
    let rows = x.len() / in_features;
    let xv = x.view2(rows, in_features)?;
    let wv = weight.view2(out_features, in_features)?;

    let mut out = xv.dot(&wv.t());
    if let Some(b) = bias {
        out += b.data();
    }

    let requires_grad =
        x.requires_grad() || weight.requires_grad() || bias.is_some_and(Tensor::requires_grad);
    let mut result = Tensor::new(flatten(out), requires_grad);

    if requires_grad {
        let backward_op = Rc::new(LinearBackward {
            x: x.clone(),
            weight: weight.clone(),
            bias: bias.cloned(),
            rows,
            in_features,
            out_features,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    Ok(result)
}

struct LinearBackward {
    x: Tensor,
    weight: Tensor,
    bias: Option<Tensor>,
    rows: usize,
    in_features: usize,
    out_features: usize,
    result_grad: GradCell,
}

impl BackwardOp for LinearBackward {
    fn backward(&self) {
        let grad_ref = self.result_grad.borrow();
        let Some(grad_output) = grad_ref.as_ref() else {
            return;
        };
        let Ok(g) = grad_output
            .view()
            .into_shape_with_order((self.rows, self.out_features))
        else {
            return;
        };

        if self.x.requires_grad() {
            // ∂L/∂X = G · W
            if let Ok(w) = self.weight.view2(self.out_features, self.in_features) {
                self.x.accumulate_grad(flatten(g.dot(&w)));
            }
        }
        if self.weight.requires_grad() {
            // ∂L/∂W = Gᵀ · X
            if let Ok(x) = self.x.view2(self.rows, self.in_features) {
                self.weight.accumulate_grad(flatten(g.t().dot(&x)));
            }
        }
        if let Some(bias) = &self.bias {
            if bias.requires_grad() {
                bias.accumulate_grad(g.sum_axis(Axis(0)));
            }
        }
    }

    fn parents(&self) -> Vec<Rc<dyn BackwardOp>> {
        let mut inputs = vec![&self.x, &self.weight];
        if let Some(b) = &self.bias {
            inputs.push(b);
        }
        parents_of(&inputs)
    }
}

/// Mean squared error between a prediction and a fixed target
///
/// L = mean((prediction - target)²); the target receives no gradient.
pub fn mse_loss(prediction: &Tensor, target: &Tensor) -> Result<Tensor> {
    if prediction.len() != target.len() {
        return Err(Error::ShapeMismatch {
            expected: vec![target.len()],
            got: vec![prediction.len()],
        });
    }
    let diff = prediction.data() - target.data();
    let mse = diff.mapv(|d| d * d).mean().unwrap_or(0.0);

    let mut result = Tensor::from_vec(vec![mse], prediction.requires_grad());

    if prediction.requires_grad() {
        let backward_op = Rc::new(MseBackward {
            prediction: prediction.clone(),
            diff,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    Ok(result)
}

struct MseBackward {
    prediction: Tensor,
    diff: Array1<f32>,
    result_grad: GradCell,
}

impl BackwardOp for MseBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            // ∂L/∂pred = 2 * (pred - target) / n
            let n = self.diff.len().max(1) as f32;
            let upstream = grad.first().copied().unwrap_or(0.0);
            self.prediction
                .accumulate_grad(&self.diff * (2.0 * upstream / n));
        }
    }

    fn parents(&self) -> Vec<Rc<dyn BackwardOp>> {
        parents_of(&[&self.prediction])
    }
}

/// Mean of scalar tensors, e.g. per-sample losses of a mini-batch
pub fn mean(values: &[Tensor]) -> Result<Tensor> {
    let (first, rest) = values
        .split_first()
        .ok_or_else(|| Error::InvalidParameter("mean of an empty set".into()))?;
    let total = rest.iter().fold(first.clone(), |acc, v| add(&acc, v));
    Ok(scale(&total, 1.0 / values.len() as f32))
}

