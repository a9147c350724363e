//! Log-space numeric kernels shared by the inference backends.
//!
//! Potentials and messages are stored as natural logarithms; `-inf` encodes
//! an impossible state. The scalar kernels are the reference used by the
//! explicit backend, the axis kernels are used by the vectorized backend.
//! Both sum in index order so that they agree to the last few ulps.

use ndarray::{Array, ArrayView, ArrayView1, Axis, Dimension, RemoveAxis};

/// Equivalence epsilon for array-vs-scalar kernel checks.
pub const KERNEL_EQUIVALENCE_EPSILON: f64 = 1e-12;

/// Default relative tolerance of [`allclose`].
pub const DEFAULT_RTOL: f64 = 1e-5;

/// Default absolute tolerance of [`allclose`].
pub const DEFAULT_ATOL: f64 = 1e-8;

/// Computes `ln(sum_i exp(values_i))`.
///
/// Returns `-inf` for an empty slice or when every entry is `-inf`.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Log-sum-exp of a single lane (possibly strided).
pub fn log_sum_exp_lane(lane: ArrayView1<'_, f64>) -> f64 {
    let max = lane.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
    if !max.is_finite() {
        return max;
    }
    let sum = lane.fold(0.0, |acc, &v| acc + (v - max).exp());
    max + sum.ln()
}

/// Log-sum-exp along `axis`, removing that axis.
pub fn log_sum_exp_axis<D>(values: ArrayView<'_, f64, D>, axis: Axis) -> Array<f64, D::Smaller>
where
    D: Dimension + RemoveAxis,
{
    values.map_axis(axis, log_sum_exp_lane)
}

/// Shifts a log vector so that it sums to one in probability space.
///
/// A vector whose log-normalizer is `-inf` (every state impossible) is left
/// untouched instead of turning into NaN.
pub fn normalize_log(values: &mut [f64]) {
    let norm = log_sum_exp(values);
    if norm.is_finite() {
        for v in values.iter_mut() {
            *v -= norm;
        }
    }
}

/// Converts a log vector into normalized probabilities.
///
/// An all-infeasible vector has no distribution and yields NaN entries.
pub fn probabilities_from_log(values: &[f64]) -> Vec<f64> {
    let norm = log_sum_exp(values);
    if norm == f64::NEG_INFINITY {
        return vec![f64::NAN; values.len()];
    }
    values.iter().map(|&v| (v - norm).exp()).collect()
}

/// Mixes a previous and a fresh normalized log message in probability space.
///
/// `damping = 0` returns the fresh message unchanged.
pub fn damp_log(previous: f64, fresh: f64, damping: f64) -> f64 {
    if damping == 0.0 {
        return fresh;
    }
    (damping * previous.exp() + (1.0 - damping) * fresh.exp()).ln()
}

/// Absolute change between two log values measured in probability space.
///
/// Two `-inf` entries are an unchanged impossible state and contribute 0.
#[inline]
pub fn probability_delta(previous: f64, next: f64) -> f64 {
    (next.exp() - previous.exp()).abs()
}

/// Replaces NaN entries (from `-inf - -inf`) with `-inf`.
pub fn nan_to_neg_inf<D: Dimension>(values: &mut Array<f64, D>) {
    values.mapv_inplace(|v| if v.is_nan() { f64::NEG_INFINITY } else { v });
}

/// Element-wise closeness: `|a - b| <= atol + rtol * |b|`. NaN only matches
/// NaN and equal infinities are close.
pub fn allclose<D: Dimension>(
    lhs: &ArrayView<'_, f64, D>,
    rhs: &ArrayView<'_, f64, D>,
    rtol: f64,
    atol: f64,
) -> bool {
    if lhs.shape() != rhs.shape() {
        return false;
    }
    lhs.iter().zip(rhs.iter()).all(|(&a, &b)| {
        if a.is_nan() || b.is_nan() {
            return a.is_nan() && b.is_nan();
        }
        if a == b {
            return true;
        }
        (a - b).abs() <= atol + rtol * b.abs()
    })
}
