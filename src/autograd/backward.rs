//! Backward operation trait and graph traversal

use super::Tensor;
use std::collections::HashSet;
use std::rc::Rc;

/// Trait for backward pass operations
///
/// An operation only moves the gradient of its own output into the gradient
/// cells of its inputs. Graph traversal is done once by [`backward`], so
/// shared sub-expressions receive their full gradient before they propagate.
pub trait BackwardOp {
    /// Propagate the output gradient into the inputs
    fn backward(&self);

    /// Backward operations of the inputs that were themselves produced by ops
    fn parents(&self) -> Vec<Rc<dyn BackwardOp>>;
}

/// Collect the backward ops of the given inputs
pub fn parents_of(inputs: &[&Tensor]) -> Vec<Rc<dyn BackwardOp>> {
    inputs.iter().filter_map(|t| t.backward_op()).collect()
}

fn op_id(op: &Rc<dyn BackwardOp>) -> usize {
    Rc::as_ptr(op) as *const () as usize
}

/// Ops reachable from `root`, ordered so that every op comes before its parents
fn topological_order(root: Rc<dyn BackwardOp>) -> Vec<Rc<dyn BackwardOp>> {
    let mut visited = HashSet::new();
    let mut post_order = Vec::new();
    // (op, children already expanded)
    let mut stack: Vec<(Rc<dyn BackwardOp>, bool)> = vec![(root, false)];

    while let Some((op, expanded)) = stack.pop() {
        if expanded {
            post_order.push(op);
            continue;
        }
        if !visited.insert(op_id(&op)) {
            continue;
        }
        let parents = op.parents();
        stack.push((op, true));
        for parent in parents {
            if !visited.contains(&op_id(&parent)) {
                stack.push((parent, false));
            }
        }
    }

    post_order.reverse();
    post_order
}

/// Perform backward pass on a tensor
///
/// Seeds the output gradient (ones when `grad_output` is `None`) and runs
/// every reachable op exactly once in reverse topological order.
pub fn backward(tensor: &Tensor, grad_output: Option<ndarray::Array1<f32>>) {
    let seed = grad_output.unwrap_or_else(|| ndarray::Array1::ones(tensor.len()));
    tensor.set_grad(seed);

    if let Some(root) = tensor.backward_op() {
        for op in topological_order(root) {
            op.backward();
        }
    }
}
