//! Error types for AutoRound

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Layer not found: {0}")]
    LayerNotFound(String),

    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("No calibration data: {0}")]
    NoCalibrationData(String),

    #[error("Out of memory on {device}: requested {requested} bytes, {available} available")]
    OutOfMemory {
        device: String,
        requested: usize,
        available: usize,
    },

    #[error("Forward pass failed: {0}")]
    Forward(String),

    #[error("Scheduling error: {0}")]
    Schedule(String),
}

impl Error {
    /// Whether this error is a device memory failure eligible for CPU fallback
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::OutOfMemory { .. })
    }
}

impl From<crate::config::ValidationError> for Error {
    fn from(err: crate::config::ValidationError) -> Self {
        Error::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<ndarray::ShapeError> for Error {
    fn from(err: ndarray::ShapeError) -> Self {
        Error::InvalidParameter(format!("array shape: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
