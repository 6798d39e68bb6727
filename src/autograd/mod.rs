//! Tape-based autograd engine
//!
//! Provides automatic differentiation using a computational graph with gradient tape.
//! Only the handful of operations needed to differentiate a block's output with
//! respect to its quantization parameters are provided.

mod backward;
mod ops;
mod tensor;


pub use backward::{backward, parents_of, BackwardOp};
pub use ops::*;
pub use tensor::{GradCell, Tensor};
