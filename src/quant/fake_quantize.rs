//! Differentiable fake quantization of weights
//!
//! For every group the clipping range is derived from the group's min/max,
//! shrunk by the learnable `min_scale`/`max_scale` factors:
//!
//! - asymmetric: `s = (hi - lo) / maxq`, `zp = round(-lo / s)`
//! - symmetric: `s = 2·max(-lo, hi) / maxq`, `zp = 2^(bits-1)`
//!
//! and each weight becomes `s · (clamp(round(w / s + v) + zp, 0, maxq) - zp)`
//! where `v` is the learnable rounding value.
//!
//! Backward uses the Straight-Through Estimator for every rounding step and
//! propagates through the clamp only inside the representable range. The
//! weight itself is a constant.

use super::{GroupLayout, QuantConfig};
use crate::autograd::{parents_of, BackwardOp, GradCell, Tensor};
use crate::{Error, Result};
use ndarray::{Array1, ArrayView1};
use std::rc::Rc;

/// Smallest scale allowed, prevents division by zero
const MIN_SCALE: f32 = 1e-10;

/// Quantization range of one group
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GroupRange {
    /// Step between quantization levels
    pub scale: f32,
    /// Integer level that represents zero
    pub zero_point: f32,
    raw_min: f32,
    raw_max: f32,
    lo: f32,
    hi: f32,
    /// Range collapsed to zero and was replaced by `[-1, 1]`
    reset: bool,
}

/// Compute the range of one group of weights
pub fn group_range(
    weights: ArrayView1<'_, f32>,
    min_scale: f32,
    max_scale: f32,
    config: &QuantConfig,
) -> GroupRange {
    let maxq = config.maxq();
    let raw_min = weights.iter().copied().fold(0.0f32, f32::min);
    let raw_max = weights.iter().copied().fold(0.0f32, f32::max);
    let lo = raw_min * min_scale;
    let hi = raw_max * max_scale;

    if config.sym {
        let amax = (-lo).max(hi);
        let reset = amax == 0.0;
        let amax = if reset { 1.0 } else { amax };
        let scale = config.scale_dtype.round(2.0 * amax / maxq).max(MIN_SCALE);
        GroupRange {
            scale,
            zero_point: (maxq + 1.0) / 2.0,
            raw_min,
            raw_max,
            lo,
            hi,
            reset,
        }
    } else {
        let reset = lo == 0.0 && hi == 0.0;
        let (lo, hi) = if reset { (-1.0, 1.0) } else { (lo, hi) };
        let scale = config.scale_dtype.round((hi - lo) / maxq).max(MIN_SCALE);
        GroupRange {
            scale,
            zero_point: (-lo / scale).round_ties_even(),
            raw_min,
            raw_max,
            lo,
            hi,
            reset,
        }
    }
}

/// Quantize-dequantize result of a whole weight
#[derive(Clone, Debug)]
pub struct QdqResult {
    /// Dequantized weight, same layout as the input
    pub values: Array1<f32>,
    /// One scale per group
    pub scales: Vec<f32>,
    /// One zero point per group
    pub zero_points: Vec<i32>,
}

struct QdqTrace {
    values: Array1<f32>,
    levels: Array1<f32>,
    inside: Vec<bool>,
    ranges: Vec<GroupRange>,
}

fn check_len(name: &str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(Error::InvalidParameter(format!(
            "{name}: expected {expected} elements, got {got}"
        )));
    }
    Ok(())
}

fn qdq_trace(
    weight: &Array1<f32>,
    rounding: &Array1<f32>,
    min_scale: &Array1<f32>,
    max_scale: &Array1<f32>,
    layout: &GroupLayout,
    config: &QuantConfig,
) -> Result<QdqTrace> {
    config.validate()?;
    check_len("weight", layout.numel(), weight.len())?;
    check_len("rounding value", layout.numel(), rounding.len())?;
    check_len("min scale", layout.num_groups(), min_scale.len())?;
    check_len("max scale", layout.num_groups(), max_scale.len())?;

    let maxq = config.maxq();
    let mut values = Array1::zeros(weight.len());
    let mut levels = Array1::zeros(weight.len());
    let mut inside = vec![false; weight.len()];
    let mut ranges = Vec::with_capacity(layout.num_groups());

    for group in 0..layout.num_groups() {
        let span = layout.group_range(group);
        let range = group_range(
            weight.slice(ndarray::s![span.clone()]),
            min_scale[group],
            max_scale[group],
            config,
        );
        for i in span {
            let level = (weight[i] / range.scale + rounding[i]).round_ties_even() + range.zero_point;
            inside[i] = (0.0..=maxq).contains(&level);
            let q = level.clamp(0.0, maxq);
            levels[i] = q;
            values[i] = range.scale * (q - range.zero_point);
        }
        ranges.push(range);
    }

    Ok(QdqTrace {
        values,
        levels,
        inside,
        ranges,
    })
}

/// Quantize-dequantize with explicit rounding values and range factors
pub fn quantize_dequantize(
    weight: &Array1<f32>,
    rounding: &Array1<f32>,
    min_scale: &Array1<f32>,
    max_scale: &Array1<f32>,
    layout: &GroupLayout,
    config: &QuantConfig,
) -> Result<QdqResult> {
    let trace = qdq_trace(weight, rounding, min_scale, max_scale, layout, config)?;
    Ok(QdqResult {
        values: trace.values,
        scales: trace.ranges.iter().map(|r| r.scale).collect(),
        zero_points: trace.ranges.iter().map(|r| r.zero_point as i32).collect(),
    })
}

/// Plain round-to-nearest quantize-dequantize (`v = 0`, full range)
pub fn quantize_rtn(
    weight: &Array1<f32>,
    layout: &GroupLayout,
    config: &QuantConfig,
) -> Result<QdqResult> {
    let groups = layout.num_groups();
    quantize_dequantize(
        weight,
        &Array1::zeros(weight.len()),
        &Array1::ones(groups),
        &Array1::ones(groups),
        layout,
        config,
    )
}

/// Differentiable fake quantization
///
/// Gradients flow into `rounding`, `min_scale` and `max_scale`; `weight` is fixed.
///
/// # Arguments
/// * `weight` - Row-major weight (`layout.rows × layout.cols`)
/// * `rounding` - Rounding value per weight element
/// * `min_scale` / `max_scale` - Range factor per group
pub fn fake_quantize(
    weight: &Array1<f32>,
    rounding: &Tensor,
    min_scale: &Tensor,
    max_scale: &Tensor,
    layout: GroupLayout,
    config: &QuantConfig,
) -> Result<Tensor> {
    let trace = qdq_trace(
        weight,
        rounding.data(),
        min_scale.data(),
        max_scale.data(),
        &layout,
        config,
    )?;

    let requires_grad =
        rounding.requires_grad() || min_scale.requires_grad() || max_scale.requires_grad();
    let mut result = Tensor::new(trace.values.clone(), requires_grad);

    if requires_grad {
        let backward_op = Rc::new(FakeQuantBackward {
            weight: weight.clone(),
            rounding: rounding.clone(),
            min_scale: min_scale.clone(),
            max_scale: max_scale.clone(),
            layout,
            sym: config.sym,
            maxq: config.maxq(),
            trace,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    Ok(result)
}

struct FakeQuantBackward {
    weight: Array1<f32>,
    rounding: Tensor,
    min_scale: Tensor,
    max_scale: Tensor,
    layout: GroupLayout,
    sym: bool,
    maxq: f32,
    trace: QdqTrace,
    result_grad: GradCell,
}

impl BackwardOp for FakeQuantBackward {
    fn backward(&self) {
        let grad_ref = self.result_grad.borrow();
        let Some(grad) = grad_ref.as_ref() else {
            return;
        };

        let groups = self.layout.num_groups();
        let mut d_rounding = Array1::zeros(self.weight.len());
        let mut d_min = Array1::zeros(groups);
        let mut d_max = Array1::zeros(groups);

        for (group, range) in self.trace.ranges.iter().enumerate() {
            let s = range.scale;
            let mut d_scale = 0.0f32;
            let mut d_lo_direct = 0.0f32;

            for i in self.layout.group_range(group) {
                let g = grad[i];
                let mask = if self.trace.inside[i] { 1.0 } else { 0.0 };
                let centered = self.trace.levels[i] - range.zero_point;
                d_rounding[i] = g * s * mask;

                if self.sym {
                    d_scale += g * (centered - mask * self.weight[i] / s);
                } else {
                    // zero point depends on the scale and on `lo`
                    d_scale += g * (centered - mask * self.weight[i] / s
                        - (1.0 - mask) * range.lo / s);
                    d_lo_direct += g * (1.0 - mask);
                }
            }

            if range.reset {
                continue;
            }

            let (d_lo, d_hi) = if self.sym {
                let d_amax = d_scale * 2.0 / self.maxq;
                if range.hi >= -range.lo {
                    (0.0, d_amax)
                } else {
                    (-d_amax, 0.0)
                }
            } else {
                (d_lo_direct - d_scale / self.maxq, d_scale / self.maxq)
            };

            d_min[group] = range.raw_min * d_lo;
            d_max[group] = range.raw_max * d_hi;
        }

        if self.rounding.requires_grad() {
            self.rounding.accumulate_grad(d_rounding);
        }
        if self.min_scale.requires_grad() {
            self.min_scale.accumulate_grad(d_min);
        }
        if self.max_scale.requires_grad() {
            self.max_scale.accumulate_grad(d_max);
        }
    }

    fn parents(&self) -> Vec<Rc<dyn BackwardOp>> {
        parents_of(&[&self.rounding, &self.min_scale, &self.max_scale])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::backward;
    use crate::quant::{GroupSize, ScaleDtype};
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    fn config(bits: u32, group_size: GroupSize, sym: bool) -> QuantConfig {
        QuantConfig {
            scale_dtype: ScaleDtype::Fp32,
            ..QuantConfig::new(bits, group_size, sym)
        }
    }

    /// Independent reference: per-row chunks, no learnable terms
    fn reference_rtn(weight: &[f32], rows: usize, cols: usize, cfg: &QuantConfig) -> Vec<f32> {
        let maxq = cfg.maxq();
        let len = cfg.group_size.resolve(cols);
        let mut out = Vec::with_capacity(weight.len());
        for r in 0..rows {
            for chunk in weight[r * cols..(r + 1) * cols].chunks(len) {
                let wmin = chunk.iter().copied().fold(0.0f32, f32::min);
                let wmax = chunk.iter().copied().fold(0.0f32, f32::max);
                let (s, zp) = if cfg.sym {
                    let a = if wmax.max(-wmin) == 0.0 { 1.0 } else { wmax.max(-wmin) };
                    (2.0 * a / maxq, (maxq + 1.0) / 2.0)
                } else {
                    let (lo, hi) = if wmin == 0.0 && wmax == 0.0 { (-1.0, 1.0) } else { (wmin, wmax) };
                    let s = (hi - lo) / maxq;
                    (s, (-lo / s).round_ties_even())
                };
                for &w in chunk {
                    let q = ((w / s).round_ties_even() + zp).clamp(0.0, maxq);
                    out.push(s * (q - zp));
                }
            }
        }
        out
    }

    #[test]
    fn test_symmetric_hand_computed_gradients() {
        let cfg = config(4, GroupSize::PerChannel, true);
        let layout = GroupLayout::new(1, 2, GroupSize::PerChannel);
        let weight = ndarray::arr1(&[0.5f32, -1.0]);
        let v = Tensor::zeros(2, true);
        let min_s = Tensor::from_vec(vec![0.8], true);
        let max_s = Tensor::from_vec(vec![0.8], true);

        // lo = -0.8, hi = 0.4, amax = 0.8, s = 1.6 / 15
        let out = fake_quantize(&weight, &v, &min_s, &max_s, layout, &cfg).unwrap();
        let s = 1.6 / 15.0;
        assert_abs_diff_eq!(out.data()[0], 5.0 * s, epsilon = 1e-6);
        assert_abs_diff_eq!(out.data()[1], -8.0 * s, epsilon = 1e-6);

        backward(&out, None);

        let dv = v.grad().unwrap();
        assert_abs_diff_eq!(dv[0], s, epsilon = 1e-6);
        assert_abs_diff_eq!(dv[1], 0.0, epsilon = 1e-7);
        // d_scale = (5 - 4.6875) + (-8), routed through `lo`
        let d_amax = (0.3125 - 8.0) * 2.0 / 15.0;
        assert_abs_diff_eq!(min_s.grad().unwrap()[0], d_amax, epsilon = 1e-4);
        assert_abs_diff_eq!(max_s.grad().unwrap()[0], 0.0, epsilon = 1e-7);
    }

    #[test]
    fn test_clamped_elements_get_no_rounding_gradient() {
        let cfg = config(2, GroupSize::PerChannel, false);
        let layout = GroupLayout::new(1, 3, GroupSize::PerChannel);
        let weight = ndarray::arr1(&[-1.0f32, 0.0, 1.0]);
        // push the last element past maxq
        let v = Tensor::from_vec(vec![0.0, 0.0, 5.0], true);
        let ones = Tensor::ones(1, true);

        let out = fake_quantize(&weight, &v, &ones, &ones.clone(), layout, &cfg).unwrap();
        backward(&out, None);

        let dv = v.grad().unwrap();
        assert!(dv[0] > 0.0);
        assert_eq!(dv[2], 0.0);
    }

    #[test]
    fn test_zero_weights_use_unit_range_without_scale_gradient() {
        let cfg = config(4, GroupSize::PerChannel, false);
        let layout = GroupLayout::new(1, 4, GroupSize::PerChannel);
        let weight = Array1::zeros(4);
        let v = Tensor::zeros(4, true);
        let min_s = Tensor::ones(1, true);
        let max_s = Tensor::ones(1, true);

        let out = fake_quantize(&weight, &v, &min_s, &max_s, layout, &cfg).unwrap();
        for x in out.data().iter() {
            assert_abs_diff_eq!(*x, 0.0, epsilon = 1e-6);
        }
        backward(&out, None);
        assert_eq!(min_s.grad().unwrap()[0], 0.0);
        assert_eq!(max_s.grad().unwrap()[0], 0.0);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let cfg = config(4, GroupSize::PerChannel, true);
        let layout = GroupLayout::new(2, 2, GroupSize::PerChannel);
        let weight = Array1::zeros(4);
        let v = Tensor::zeros(3, true);
        let s = Tensor::ones(2, true);
        assert!(fake_quantize(&weight, &v, &s, &s.clone(), layout, &cfg).is_err());
    }

    #[test]
    fn test_zero_bits_rejected() {
        let cfg = config(0, GroupSize::PerChannel, true);
        let layout = GroupLayout::new(1, 2, GroupSize::PerChannel);
        assert!(quantize_rtn(&Array1::zeros(2), &layout, &cfg).is_err());
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(200))]

        /// Fake quantization with neutral parameters is plain round-to-nearest
        #[test]
        fn prop_neutral_parameters_match_rtn(
            weight in prop::collection::vec(-4.0f32..4.0, 24),
            bits in 1u32..9,
            group in prop::sample::select(vec![-1i64, 1, 4, 5, 8, 24, 64]),
            sym in any::<bool>(),
        ) {
            let group_size = GroupSize::try_from(group).unwrap();
            let cfg = config(bits, group_size, sym);
            let layout = GroupLayout::new(3, 8, group_size);
            let w = Array1::from(weight.clone());

            let fq = fake_quantize(
                &w,
                &Tensor::zeros(24, true),
                &Tensor::ones(layout.num_groups(), true),
                &Tensor::ones(layout.num_groups(), true),
                layout,
                &cfg,
            ).unwrap();
            let rtn = quantize_rtn(&w, &layout, &cfg).unwrap();
            let reference = reference_rtn(&weight, 3, 8, &cfg);

            for i in 0..24 {
                prop_assert!((fq.data()[i] - rtn.values[i]).abs() < 1e-6);
                prop_assert!((rtn.values[i] - reference[i]).abs() < 1e-5);
            }
        }

        /// Every output lies on the integer grid of its group
        #[test]
        fn prop_outputs_on_grid(
            weight in prop::collection::vec(-3.0f32..3.0, 16),
            rounding in prop::collection::vec(-0.5f32..0.5, 16),
            min_s in 0.0f32..=1.0,
            max_s in 0.0f32..=1.0,
            sym in any::<bool>(),
        ) {
            let cfg = config(4, GroupSize::Size(4), sym);
            let layout = GroupLayout::new(2, 8, GroupSize::Size(4));
            let groups = layout.num_groups();
            let res = quantize_dequantize(
                &Array1::from(weight),
                &Array1::from(rounding),
                &Array1::from_elem(groups, min_s),
                &Array1::from_elem(groups, max_s),
                &layout,
                &cfg,
            ).unwrap();

            for i in 0..16 {
                let g = layout.group_of(i);
                let level = res.values[i] / res.scales[g] + res.zero_points[g] as f32;
                prop_assert!((level - level.round()).abs() < 1e-3);
                prop_assert!(level > -1e-3 && level < cfg.maxq() + 1e-3);
            }
        }
    }
}
