//! # AutoRound: Sign-Gradient Rounding for Weight Quantization
//!
//! AutoRound quantizes the linear layers of a transformer-style model after
//! training. Each block is tuned against its full-precision output on a small
//! calibration set, learning per-weight rounding offsets and per-group range
//! factors with sign-gradient descent, then folded back as
//! quantize-dequantized weights.
//!
//! ## Architecture
//!
//! - **autograd**: Tape-based automatic differentiation
//! - **optim**: Sign-SGD, AdamW, learning-rate schedules and loss scaling
//! - **quant**: Group granularity, fake quantization and weight wrappers
//! - **model**: Block and model traits with a reference MLP model
//! - **calib**: Calibration data and activation capture with CPU fallback
//! - **tune**: The block and layer tuning loop
//! - **schedule**: Block windows with lookahead and observe blocks
//! - **autoround**: The top-level quantization driver
//! - **config**: Declarative YAML configuration
//! - **io**: Export of folded weights and per-layer quantization metadata

pub mod autograd;
pub mod autoround;
pub mod calib;
pub mod config;
pub mod io;
pub mod model;
pub mod optim;
pub mod quant;
pub mod schedule;
pub mod tune;

pub mod error;

// Re-export commonly used types
pub use autograd::{backward, Tensor};
pub use autoround::{AutoRound, QuantizeReport};
pub use error::{Error, Result};
