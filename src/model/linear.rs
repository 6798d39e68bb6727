//! Dense linear layer

use crate::autograd::{linear, Tensor};
use crate::{Error, Result};
use ndarray::{Array1, Array2};

/// Linear layer `y = x · Wᵀ + b` with `W` stored as `out_features × in_features`
#[derive(Clone, Debug, PartialEq)]
pub struct Linear {
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

impl Linear {
    pub fn new(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Self {
        Self { weight, bias }
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    /// Forward with frozen weights; gradients still flow into `x`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let weight = Tensor::from_array2(&self.weight, false);
        let bias = self.bias.as_ref().map(|b| Tensor::new(b.clone(), false));
        linear(
            x,
            &weight,
            bias.as_ref(),
            self.in_features(),
            self.out_features(),
        )
    }

    /// Replace the weight with a row-major flat array of the same size
    pub fn set_weight_flat(&mut self, values: &Array1<f32>) -> Result<()> {
        let (rows, cols) = self.weight.dim();
        if values.len() != rows * cols {
            return Err(Error::ShapeMismatch {
                expected: vec![rows, cols],
                got: vec![values.len()],
            });
        }
        self.weight = Array2::from_shape_vec((rows, cols), values.to_vec())?;
        Ok(())
    }
}
