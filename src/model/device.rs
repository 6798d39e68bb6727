//! Devices and activation precision

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where model weights and cached activations live
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    #[default]
    Cpu,
    /// Accelerator with its ordinal
    Accelerator(usize),
}

impl Device {
    pub fn is_accelerator(self) -> bool {
        matches!(self, Device::Accelerator(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accelerator(i) => write!(f, "cuda:{i}"),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" | "accelerator" => Ok(Device::Accelerator(0)),
            other => {
                let ordinal = other
                    .strip_prefix("cuda:")
                    .or_else(|| other.strip_prefix("gpu:"))
                    .or_else(|| other.strip_prefix("accelerator:"))
                    .ok_or_else(|| format!("unknown device: {s}"))?;
                ordinal
                    .parse()
                    .map(Device::Accelerator)
                    .map_err(|_| format!("invalid device ordinal: {s}"))
            }
        }
    }
}

impl TryFrom<String> for Device {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(value: Device) -> Self {
        value.to_string()
    }
}

/// Precision that activations are rounded to while cached
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F32,
    Bf16,
    F16,
}

impl Precision {
    /// Mixed precision resolved once per run: bf16 on CPU, fp16 on accelerators
    pub fn for_amp(amp: bool, device: Device) -> Self {
        match (amp, device) {
            (false, _) => Precision::F32,
            (true, Device::Cpu) => Precision::Bf16,
            (true, Device::Accelerator(_)) => Precision::F16,
        }
    }

    pub fn round(self, value: f32) -> f32 {
        match self {
            Precision::F32 => value,
            Precision::Bf16 => half::bf16::from_f32(value).to_f32(),
            Precision::F16 => half::f16::from_f32(value).to_f32(),
        }
    }

    /// Round every element in place
    pub fn round_in_place<D: ndarray::Dimension>(self, values: &mut ndarray::Array<f32, D>) {
        if self != Precision::F32 {
            values.mapv_inplace(|x| self.round(x));
        }
    }

    /// Data type tag written for layers kept in float
    pub fn float_tag(self) -> &'static str {
        match self {
            Precision::Bf16 => "bfloat",
            _ => "float",
        }
    }
}
