use crate::{NormError, NormResult};
use ndarray::{Array1, Array2, Array4, ArrayView2, ArrayView4, Axis};

/// Activations laid out as (sample, channel, height, width).
pub type FeatureBatch = Array4<f64>;
/// One value per channel.
pub type ChannelStat = Array1<f64>;

/// Checks a batch against the configured (B, C). `batch_size = None` accepts any sample count.
pub fn check_shape(
    operation: &'static str,
    input: &ArrayView4<f64>,
    batch_size: Option<usize>,
    num_features: usize,
) -> NormResult<()> {
    let (b, c, h, w) = input.dim();
    let expected_b = batch_size.unwrap_or(b);
    if b != expected_b || c != num_features {
        return Err(NormError::ShapeMismatch {
            operation,
            expected: vec![expected_b, num_features, h, w],
            got: vec![b, c, h, w],
        });
    }
    if h * w == 0 {
        return Err(NormError::EmptySpatialExtent {
            operation,
            height: h,
            width: w,
        });
    }
    Ok(())
}

pub fn check_same_shape(
    operation: &'static str,
    expected: &ArrayView4<f64>,
    got: &ArrayView4<f64>,
) -> NormResult<()> {
    if expected.shape() != got.shape() {
        return Err(NormError::ShapeMismatch {
            operation,
            expected: expected.shape().to_vec(),
            got: got.shape().to_vec(),
        });
    }
    Ok(())
}

/// Mean over the spatial axes, shape (B, C).
pub fn spatial_mean(input: &ArrayView4<f64>) -> Array2<f64> {
    let (_, _, h, w) = input.dim();
    input.sum_axis(Axis(3)).sum_axis(Axis(2)) / (h * w) as f64
}

/// Per-sample, per-channel mean and biased variance over the spatial axes.
pub fn moments(input: &ArrayView4<f64>) -> (Array2<f64>, Array2<f64>) {
    let mean = spatial_mean(input);
    let centered = input - &expand(&mean.view());
    let var = spatial_mean(&(&centered * &centered).view());
    (mean, var)
}

/// Views a (B, C) statistic as (B, C, 1, 1) so it broadcasts over a FeatureBatch.
pub fn expand<'a>(stat: &ArrayView2<'a, f64>) -> ArrayView4<'a, f64> {
    stat.clone().insert_axis(Axis(2)).insert_axis(Axis(3))
}
