use crate::{
    batch::{check_same_shape, ChannelStat, FeatureBatch},
    norm::{build, BackwardContext, ControlNorm, RunningStatistics},
    NormError, NormResult, OnlineNormConfig,
};
use ndarray::{Array1, ArrayView4, Axis};
use tracing::{info, warn};

/// Divides each sample by the root mean square of all its activations.
#[derive(Debug, Clone, Copy)]
pub struct LayerScaling {
    pub eps: f64,
}

#[derive(Debug)]
pub struct LayerScalingContext {
    output: FeatureBatch,
    scale: Array1<f64>,
}

impl LayerScaling {
    pub fn new(eps: f64) -> Self {
        Self { eps }
    }

    /// `sqrt(E[x²] + eps)` per sample.
    fn sample_scale(&self, input: &ArrayView4<f64>) -> Array1<f64> {
        let (_, c, h, w) = input.dim();
        let n = (c * h * w) as f64;
        input
            .outer_iter()
            .map(|sample| (sample.iter().map(|x| x * x).sum::<f64>() / n + self.eps).sqrt())
            .collect()
    }

    pub fn forward(&self, input: ArrayView4<f64>) -> (FeatureBatch, LayerScalingContext) {
        let scale = self.sample_scale(&input);
        let output = &input / &per_sample(&scale);
        let ctx = LayerScalingContext {
            output: output.clone(),
            scale,
        };
        (output, ctx)
    }

    /// `(g - y·E[g·y]) / scale`
    pub fn backward(
        &self,
        ctx: LayerScalingContext,
        grad_output: ArrayView4<f64>,
    ) -> NormResult<FeatureBatch> {
        check_same_shape("layer_scaling_backward", &ctx.output.view(), &grad_output)?;
        let (_, c, h, w) = grad_output.dim();
        let n = (c * h * w) as f64;
        let projection = (&grad_output * &ctx.output)
            .outer_iter()
            .map(|sample| sample.sum() / n)
            .collect::<Array1<f64>>();
        let centered = &grad_output - &(&ctx.output * &per_sample(&projection));
        Ok(centered / &per_sample(&ctx.scale))
    }
}

fn per_sample(values: &Array1<f64>) -> ArrayView4<'_, f64> {
    values
        .view()
        .insert_axis(Axis(1))
        .insert_axis(Axis(2))
        .insert_axis(Axis(3))
}

fn per_channel(values: &Array1<f64>) -> ArrayView4<'_, f64> {
    values
        .view()
        .insert_axis(Axis(0))
        .insert_axis(Axis(2))
        .insert_axis(Axis(3))
}

/// Learnable per-channel multiply and add.
pub struct Affine {
    pub num_features: usize,
    pub weight: Option<ChannelStat>,
    pub bias: Option<ChannelStat>,
    pub weight_grad: Option<ChannelStat>,
    pub bias_grad: Option<ChannelStat>,
}

impl Affine {
    pub fn new(num_features: usize, weight: bool, bias: bool) -> Self {
        Self {
            num_features,
            weight: weight.then(|| Array1::ones(num_features)),
            bias: bias.then(|| Array1::zeros(num_features)),
            weight_grad: weight.then(|| Array1::zeros(num_features)),
            bias_grad: bias.then(|| Array1::zeros(num_features)),
        }
    }

    pub fn forward(&self, input: ArrayView4<f64>) -> FeatureBatch {
        let mut output = input.to_owned();
        if let Some(weight) = &self.weight {
            output = output * &per_channel(weight);
        }
        if let Some(bias) = &self.bias {
            output = output + &per_channel(bias);
        }
        output
    }

    /// `input` is what [`Affine::forward`] received.
    pub fn backward(
        &mut self,
        input: ArrayView4<f64>,
        grad_output: ArrayView4<f64>,
        should_accumulate_gradients: bool,
    ) -> NormResult<FeatureBatch> {
        check_same_shape("affine_backward", &input, &grad_output)?;
        let channel_sum = |batch: &FeatureBatch| {
            batch
                .sum_axis(Axis(3))
                .sum_axis(Axis(2))
                .sum_axis(Axis(0))
        };

        if let Some(wg) = self.weight_grad.as_mut() {
            let grad = channel_sum(&(&grad_output * &input));
            accumulate(wg, grad, should_accumulate_gradients);
        }
        if let Some(bg) = self.bias_grad.as_mut() {
            let grad = channel_sum(&grad_output.to_owned());
            accumulate(bg, grad, should_accumulate_gradients);
        }

        Ok(match &self.weight {
            Some(weight) => &grad_output * &per_channel(weight),
            None => grad_output.to_owned(),
        })
    }

    pub fn zero_grad(&mut self) {
        for grad in [self.weight_grad.as_mut(), self.bias_grad.as_mut()]
            .into_iter()
            .flatten()
        {
            grad.fill(0.0);
        }
    }
}

fn accumulate(target: &mut ChannelStat, grad: ChannelStat, should_accumulate: bool) {
    if should_accumulate {
        *target += &grad;
    } else {
        *target = grad;
    }
}

struct OnlineNormCache {
    control: BackwardContext,
    normalized: FeatureBatch,
    layer_scaling: Option<LayerScalingContext>,
}

/// Control normalization followed by the affine transform and optional
/// layer scaling.
pub struct OnlineNorm {
    config: OnlineNormConfig,
    pub ctrl_norm: Box<dyn ControlNorm>,
    pub affine: Affine,
    pub layer_scaling: Option<LayerScaling>,
    cache: Option<OnlineNormCache>,
}

impl OnlineNorm {
    pub fn new(config: OnlineNormConfig) -> NormResult<Self> {
        config.validate()?;
        let ctrl_norm = build(config.control.clone())?;
        Ok(Self::with_control(config, ctrl_norm))
    }

    /// Uses a caller-built controller, e.g. the sequential oracle.
    pub fn with_control(config: OnlineNormConfig, ctrl_norm: Box<dyn ControlNorm>) -> Self {
        let layer_scaling = if config.layer_scaling {
            info!("using layer scaling in online normalization");
            Some(LayerScaling::new(config.control.eps))
        } else {
            warn!("not using layer scaling in online normalization");
            None
        };
        let affine = Affine::new(config.control.num_features, config.weight, config.bias);
        Self {
            config,
            ctrl_norm,
            affine,
            layer_scaling,
            cache: None,
        }
    }

    pub fn config(&self) -> &OnlineNormConfig {
        &self.config
    }

    pub fn forward(&mut self, input: ArrayView4<f64>, training: bool) -> NormResult<FeatureBatch> {
        if !training {
            let normalized = self.ctrl_norm.forward_eval(input)?;
            let output = self.affine.forward(normalized.view());
            return Ok(match &self.layer_scaling {
                Some(ls) => ls.forward(output.view()).0,
                None => output,
            });
        }

        let (normalized, control) = self.ctrl_norm.forward_train(input)?;
        let output = self.affine.forward(normalized.view());
        let (output, layer_scaling) = match &self.layer_scaling {
            Some(ls) => {
                let (output, ctx) = ls.forward(output.view());
                (output, Some(ctx))
            }
            None => (output, None),
        };
        self.cache = Some(OnlineNormCache {
            control,
            normalized,
            layer_scaling,
        });
        Ok(output)
    }

    pub fn backward(
        &mut self,
        grad_output: ArrayView4<f64>,
        should_accumulate_gradients: bool,
    ) -> NormResult<FeatureBatch> {
        let cache = self.cache.take().ok_or(NormError::BackwardWithoutForward {
            reason: "no training forward is pending",
        })?;
        // a rejected gradient keeps the pending forward
        if let Err(e) = check_same_shape(
            "online_norm_backward",
            &cache.normalized.view(),
            &grad_output,
        ) {
            self.cache = Some(cache);
            return Err(e);
        }

        let grad = match (&self.layer_scaling, cache.layer_scaling) {
            (Some(ls), Some(ctx)) => ls.backward(ctx, grad_output)?,
            _ => grad_output.to_owned(),
        };
        let grad = self.affine.backward(
            cache.normalized.view(),
            grad.view(),
            should_accumulate_gradients,
        )?;
        self.ctrl_norm.backward(&cache.control, grad.view())
    }

    pub fn running_statistics(&self) -> RunningStatistics {
        self.ctrl_norm.running_statistics()
    }
}
