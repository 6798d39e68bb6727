//! Learning-curve statistics of observe-block MSE histories

use serde::{Deserialize, Serialize};

/// Summary of one per-iteration MSE history
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CurveStats {
    pub last_mse: f32,
    pub min_mse: f32,
    pub min_mse_iter: usize,
    /// Iteration where the smoothed curve settles, if it does
    pub convergence_iter: Option<usize>,
    /// Least-squares slope over the first tenth of the smoothed curve
    pub slope_first_tenth: Option<f32>,
    pub slope: Option<f32>,
    /// Mean absolute change between consecutive iterations
    pub avg_abs_change: Option<f32>,
}

impl CurveStats {
    /// `None` for an empty history
    pub fn from_history(values: &[f32]) -> Option<Self> {
        let (&last_mse, _) = values.split_last()?;
        let (min_mse_iter, min_mse) = values
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::INFINITY), |best, (i, v)| if v < best.1 { (i, v) } else { best });
        let smoothed = moving_average(values, 5);
        let changes = absolute_changes(values, 1);
        Some(Self {
            last_mse,
            min_mse,
            min_mse_iter,
            convergence_iter: convergence_iter(values, 0.1, 5, 5),
            slope_first_tenth: slope(&smoothed[..smoothed.len().min(values.len() / 10)]),
            slope: slope(&smoothed),
            avg_abs_change: (!changes.is_empty())
                .then(|| changes.iter().sum::<f32>() / changes.len() as f32),
        })
    }
}

/// Means of every full window (no padding)
pub fn moving_average(values: &[f32], window: usize) -> Vec<f32> {
    if window == 0 || values.len() < window {
        return Vec::new();
    }
    values
        .windows(window)
        .map(|w| w.iter().sum::<f32>() / window as f32)
        .collect()
}

/// `|Δ|` of the moving average
pub fn absolute_changes(values: &[f32], window: usize) -> Vec<f32> {
    moving_average(values, window)
        .windows(2)
        .map(|w| (w[1] - w[0]).abs())
        .collect()
}

/// First iteration after which `consecutive` smoothed values change by less
/// than `std_fraction` of their standard deviation
pub fn convergence_iter(
    values: &[f32],
    std_fraction: f32,
    window: usize,
    consecutive: usize,
) -> Option<usize> {
    let smoothed = moving_average(values, window);
    if smoothed.len() < consecutive || consecutive == 0 {
        return None;
    }
    let n = smoothed.len() as f32;
    let mean = smoothed.iter().sum::<f32>() / n;
    let std = (smoothed.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n).sqrt();
    let threshold = std_fraction * std;
    smoothed
        .windows(consecutive)
        .position(|w| w.windows(2).all(|p| (p[1] - p[0]).abs() < threshold))
        .map(|i| i + window / 2)
}

/// Least-squares slope of `values` against their index
pub fn slope(values: &[f32]) -> Option<f32> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = values.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (i, &v) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        sxy += dx * (f64::from(v) - mean_y);
        sxx += dx * dx;
    }
    Some((sxy / sxx) as f32)
}
