//! Declarative YAML configuration
//!
//! Every key of a quantization run with its default, per-layer overrides,
//! validation and loading.
//!
//! # Example
//!
//! ```yaml
//! bits: 4
//! group_size: 128
//! sym: false
//! iters: 200
//! nsamples: 128
//! nblocks: 2
//! num_lookahead_blocks: 1
//!
//! layer_config:
//!   lm_head:
//!     bits: 8
//!     group_size: 32
//! ```

mod load;
mod schema;
mod validate;


#[cfg(test)]
mod property_tests;

pub use load::{load_config, parse_config};
pub use schema::{AutoRoundConfig, LayerOverride, DEFAULT_DATASET, DEFAULT_ITERS};
pub use validate::{validate_config, ValidationError};
