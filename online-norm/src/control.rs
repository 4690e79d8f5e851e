//! Batched form of the backward v controller.
//!
//! The controller follows `v_i = α_i · v_{i-1} + β_i` where the decay `α_i`
//! changes per sample, so there is no fixed kernel to correlate with. Over the
//! B samples ending at position i it unrolls to
//!
//! ```text
//! v_i = (Π_k α_k) · v_{i-B} + Σ_k β_k · Π_{m>k} α_m
//! ```
//!
//! The partial products are recovered as `exp` of partial sums of `ln α`,
//! and each partial sum is a box-kernel convolution over the zero padded
//! log window. `α` must be strictly positive, which the floor in
//! [`decay_terms`] guarantees.

use crate::{
    batch::{expand, spatial_mean, FeatureBatch},
    ema::shift_in,
};
use ndarray::{s, Array1, Array2, ArrayView4};

#[derive(Debug, Clone)]
pub struct ControlTrajectory {
    /// Controller value before each sample, used to correct that sample's gradient.
    pub stale: Array2<f64>,
    /// Controller value after each sample, cached for the next call.
    pub fresh: Array2<f64>,
}

/// `α_i = max(1 - (1-ρ)·E[y_i²], floor)` per sample and channel.
///
/// The floor is an approximation: when it binds, the batched recurrence no
/// longer matches the unclamped per-sample loop. NaN is passed through
/// unclamped.
pub fn decay_terms(output: &ArrayView4<f64>, rate: f64, floor: f64) -> Array2<f64> {
    let second_moment = spatial_mean(&(output * output).view());
    second_moment.mapv(|m2| {
        let alpha = 1.0 - (1.0 - rate) * m2;
        if alpha < floor {
            floor
        } else {
            alpha
        }
    })
}

/// `β_i = E[g_i · y_i]` per sample and channel.
pub fn correlation_terms(grad: &ArrayView4<f64>, output: &ArrayView4<f64>) -> Array2<f64> {
    spatial_mean(&(grad * output).view())
}

/// Runs the multiplicative recurrence across the batch.
///
/// `alpha_prev`/`beta_prev` are the previous call's terms and `v_prev` its
/// fresh trajectory; all inputs are (B, C).
pub fn controlled_recurrence(
    alpha: &Array2<f64>,
    beta: &Array2<f64>,
    alpha_prev: &Array2<f64>,
    beta_prev: &Array2<f64>,
    v_prev: &Array2<f64>,
) -> ControlTrajectory {
    let (b, c) = alpha.dim();
    let mut fresh = Array2::<f64>::zeros((b, c));

    for ch in 0..c {
        let log_alpha = alpha_prev
            .column(ch)
            .iter()
            .chain(alpha.column(ch).iter())
            .map(|a| a.ln())
            .collect::<Array1<f64>>();
        let betas = beta_prev
            .column(ch)
            .iter()
            .chain(beta.column(ch).iter())
            .copied()
            .collect::<Array1<f64>>();

        for i in 0..b {
            let mut padded = Array1::<f64>::zeros(2 * b);
            padded
                .slice_mut(s![..b])
                .assign(&log_alpha.slice(s![i + 1..i + 1 + b]));

            // weights[j] = Π_{k >= j} α_window[k], weights[B] = 1
            let weights = padded
                .windows(b)
                .into_iter()
                .map(|w| w.sum().exp())
                .collect::<Array1<f64>>();

            fresh[[i, ch]] = weights[0] * v_prev[[i, ch]]
                + weights.slice(s![1..]).dot(&betas.slice(s![i + 1..i + 1 + b]));
        }
    }

    let stale = shift_in(v_prev, &fresh);
    ControlTrajectory { stale, fresh }
}

/// `g_i - (1-ρ)·v_stale[i]·y_i`
pub fn apply_control(
    grad: &ArrayView4<f64>,
    output: &ArrayView4<f64>,
    stale: &Array2<f64>,
    rate: f64,
) -> FeatureBatch {
    let correction = &expand(&stale.view()) * output;
    grad - &(correction * (1.0 - rate))
}
