//! Exponential moving average over a whole mini-batch in one pass.
//!
//! The sequential update `y_i = ρ·y_{i-1} + (1-ρ)·x_i` unrolled over the B
//! samples ending at position i is
//!
//! ```text
//! y_i = ρ^B · y_{i-B} + (1-ρ) · Σ_{k=0}^{B-1} ρ^k · x_{i-k}
//! ```
//!
//! `y_{i-B}` is the fresh value at the same position in the previous call, and
//! the sum is a valid (unpadded) correlation of the concatenated history
//! `prev[1..] ++ curr` with the kernel `ρ^{B-1}, ..., ρ^0`.

use ndarray::{s, Array1, Array2, Zip};

#[derive(Debug, Clone)]
pub struct DecayKernel {
    rate: f64,
    powers: Array1<f64>,
    batch_power: f64,
}

impl DecayKernel {
    pub fn new(rate: f64, batch_size: usize) -> Self {
        let powers = (0..batch_size)
            .rev()
            .map(|k| rate.powi(k as i32))
            .collect::<Array1<f64>>();
        Self {
            rate,
            powers,
            batch_power: rate.powi(batch_size as i32),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// `ρ^{B-1}, ..., ρ^1, ρ^0`
    pub fn powers(&self) -> &Array1<f64> {
        &self.powers
    }

    /// `ρ^B`
    pub fn batch_power(&self) -> f64 {
        self.batch_power
    }

    pub fn batch_size(&self) -> usize {
        self.powers.len()
    }
}

#[derive(Debug, Clone)]
pub struct EmaTrajectory {
    /// EMA just before each sample was incorporated.
    pub stale: Array2<f64>,
    /// EMA just after each sample was incorporated.
    pub fresh: Array2<f64>,
}

/// Runs the EMA across the batch.
///
/// `prev` holds the inputs of the previous call, `curr` the inputs of this
/// call and `stream` the previous call's fresh trajectory; all are (B, C).
pub fn ema_over_batch(
    prev: &Array2<f64>,
    curr: &Array2<f64>,
    stream: &Array2<f64>,
    kernel: &DecayKernel,
) -> EmaTrajectory {
    let (b, c) = curr.dim();
    let mut fresh = Array2::<f64>::zeros((b, c));

    for ch in 0..c {
        let history = prev
            .slice(s![1.., ch])
            .iter()
            .chain(curr.column(ch).iter())
            .copied()
            .collect::<Array1<f64>>();

        Zip::from(fresh.column_mut(ch))
            .and(history.windows(b))
            .and(stream.column(ch))
            .for_each(|y, window, &seed| {
                *y = kernel.batch_power * seed + (1.0 - kernel.rate) * window.dot(&kernel.powers);
            });
    }

    let stale = shift_in(stream, &fresh);
    EmaTrajectory { stale, fresh }
}

/// `[previous[B-1], current[0], ..., current[B-2]]`
pub(crate) fn shift_in(previous: &Array2<f64>, current: &Array2<f64>) -> Array2<f64> {
    let b = current.nrows();
    let mut shifted = Array2::<f64>::zeros(current.raw_dim());
    shifted.row_mut(0).assign(&previous.row(b - 1));
    shifted
        .slice_mut(s![1.., ..])
        .assign(&current.slice(s![..b - 1, ..]));
    shifted
}
