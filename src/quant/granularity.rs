//! Quantization group granularity
//!
//! Weights are quantized in groups along the input dimension of each output row:
//! - **Per-channel** (`group_size = -1`): one scale/zero-point per output row
//! - **Per-group** (`group_size = n`): one scale/zero-point per `n` consecutive
//!   inputs of a row; the trailing group of a row may be shorter

use serde::{Deserialize, Serialize};
use std::fmt;

/// Group size of a quantized tensor, serialized as `-1` or a positive integer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum GroupSize {
    /// One group per output channel
    PerChannel,
    /// Groups of `n` consecutive input features
    Size(usize),
}

impl GroupSize {
    /// Number of input features covered by one group
    pub fn resolve(self, in_features: usize) -> usize {
        match self {
            GroupSize::PerChannel => in_features.max(1),
            GroupSize::Size(n) => n.min(in_features).max(1),
        }
    }

    /// Raw integer form (`-1` for per-channel)
    pub fn as_i64(self) -> i64 {
        match self {
            GroupSize::PerChannel => -1,
            GroupSize::Size(n) => n as i64,
        }
    }
}

impl Default for GroupSize {
    fn default() -> Self {
        GroupSize::Size(128)
    }
}

impl TryFrom<i64> for GroupSize {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(GroupSize::PerChannel),
            n if n >= 1 => Ok(GroupSize::Size(n as usize)),
            n => Err(format!("group_size must be -1 or >= 1, got {n}")),
        }
    }
}

impl From<GroupSize> for i64 {
    fn from(value: GroupSize) -> Self {
        value.as_i64()
    }
}

impl fmt::Display for GroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i64())
    }
}

/// Mapping between the elements of a row-major `rows × cols` weight and its groups
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupLayout {
    pub rows: usize,
    pub cols: usize,
    pub group_len: usize,
    pub groups_per_row: usize,
}

impl GroupLayout {
    /// Layout for an `out_features × in_features` weight
    pub fn new(rows: usize, cols: usize, group_size: GroupSize) -> Self {
        let group_len = group_size.resolve(cols);
        Self {
            rows,
            cols,
            group_len,
            groups_per_row: cols.div_ceil(group_len),
        }
    }

    /// Total number of groups
    pub fn num_groups(&self) -> usize {
        self.rows * self.groups_per_row
    }

    /// Number of weight elements
    pub fn numel(&self) -> usize {
        self.rows * self.cols
    }

    /// Group of a flat element index
    pub fn group_of(&self, index: usize) -> usize {
        let row = index / self.cols;
        let col = index % self.cols;
        row * self.groups_per_row + col / self.group_len
    }

    /// Flat element range of a group
    pub fn group_range(&self, group: usize) -> std::ops::Range<usize> {
        let row = group / self.groups_per_row;
        let start_col = (group % self.groups_per_row) * self.group_len;
        let end_col = (start_col + self.group_len).min(self.cols);
        row * self.cols + start_col..row * self.cols + end_col
    }
}
