//! Tensor type with gradient tracking

use super::BackwardOp;
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2};
use std::cell::RefCell;
use std::rc::Rc;

/// Shared gradient slot of a tensor
pub type GradCell = Rc<RefCell<Option<Array1<f32>>>>;

/// Flat tensor with automatic differentiation support
///
/// Matrices are stored row-major; operations that need a 2-D view take the
/// row/column split explicitly.
#[derive(Clone)]
pub struct Tensor {
    data: Array1<f32>,
    grad: GradCell,
    backward_op: Option<Rc<dyn BackwardOp>>,
    requires_grad: bool,
}

impl Tensor {
    /// Create a new tensor with data
    pub fn new(data: Array1<f32>, requires_grad: bool) -> Self {
        Self {
            data,
            grad: Rc::new(RefCell::new(None)),
            backward_op: None,
            requires_grad,
        }
    }

    /// Create a tensor from a vector
    pub fn from_vec(data: Vec<f32>, requires_grad: bool) -> Self {
        Self::new(Array1::from(data), requires_grad)
    }

    /// Create a tensor from a row-major matrix
    pub fn from_array2(data: &Array2<f32>, requires_grad: bool) -> Self {
        Self::new(data.iter().copied().collect(), requires_grad)
    }

    /// Create a tensor filled with zeros
    pub fn zeros(size: usize, requires_grad: bool) -> Self {
        Self::new(Array1::zeros(size), requires_grad)
    }

    /// Create a tensor filled with ones
    pub fn ones(size: usize, requires_grad: bool) -> Self {
        Self::new(Array1::ones(size), requires_grad)
    }

    /// Get reference to data
    pub fn data(&self) -> &Array1<f32> {
        &self.data
    }

    /// Get mutable reference to data
    pub fn data_mut(&mut self) -> &mut Array1<f32> {
        &mut self.data
    }

    /// View the data as a `rows × cols` matrix
    pub fn view2(&self, rows: usize, cols: usize) -> Result<ArrayView2<'_, f32>> {
        self.data
            .view()
            .into_shape_with_order((rows, cols))
            .map_err(|_| Error::ShapeMismatch {
                expected: vec![rows, cols],
                got: vec![self.data.len()],
            })
    }

    /// Copy the data into an owned `rows × cols` matrix
    pub fn to_array2(&self, rows: usize, cols: usize) -> Result<Array2<f32>> {
        Ok(self.view2(rows, cols)?.to_owned())
    }

    /// First element, for scalar tensors such as losses
    pub fn item(&self) -> f32 {
        self.data.first().copied().unwrap_or(0.0)
    }

    /// Copy of the data cut off from the graph
    pub fn detach(&self) -> Tensor {
        Tensor::new(self.data.clone(), false)
    }

    /// Get gradient (if computed)
    pub fn grad(&self) -> Option<Array1<f32>> {
        self.grad.borrow().clone()
    }

    /// Set gradient
    pub fn set_grad(&self, grad: Array1<f32>) {
        *self.grad.borrow_mut() = Some(grad);
    }

    /// Accumulate gradient (for when tensor is used multiple times)
    pub fn accumulate_grad(&self, grad: Array1<f32>) {
        let mut grad_ref = self.grad.borrow_mut();
        if let Some(existing) = grad_ref.as_mut() {
            *existing += &grad;
        } else {
            *grad_ref = Some(grad);
        }
    }

    /// Zero out gradient
    pub fn zero_grad(&self) {
        *self.grad.borrow_mut() = None;
    }

    /// Check if requires gradient
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Get reference to gradient cell (for backward operations)
    pub fn grad_cell(&self) -> GradCell {
        self.grad.clone()
    }

    /// Set backward operation
    pub fn set_backward_op(&mut self, op: Rc<dyn BackwardOp>) {
        self.backward_op = Some(op);
    }

    /// Get backward operation
    pub fn backward_op(&self) -> Option<Rc<dyn BackwardOp>> {
        self.backward_op.clone()
    }

    /// Get size
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("data", &self.data)
            .field("grad", &self.grad.borrow())
            .field("requires_grad", &self.requires_grad)
            .finish()
    }
}
