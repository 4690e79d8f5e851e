use crate::{
    batch::{check_same_shape, check_shape, moments, ChannelStat, FeatureBatch},
    norm::{BackwardContext, ControlNorm, RunningStatistics, StepGuard},
    ControlNormConfig, NormResult,
};
use ndarray::{s, Array1, Array2, ArrayView3, ArrayView4, Axis};
use tracing::trace;

#[derive(Debug, Clone, PartialEq)]
pub struct SequentialState {
    pub mean: ChannelStat,
    pub var: ChannelStat,
    pub u: ChannelStat,
    pub v: ChannelStat,
}

impl SequentialState {
    pub fn new(num_features: usize) -> Self {
        Self {
            mean: Array1::zeros(num_features),
            var: Array1::ones(num_features),
            u: Array1::zeros(num_features),
            v: Array1::zeros(num_features),
        }
    }
}

/// Per-sample loop over the same recurrences as [`crate::linearized`].
///
/// Slow, but every update is the textbook one, which makes it the reference
/// the batched engine is checked against.
pub struct SequentialControlNorm {
    config: ControlNormConfig,
    state: SequentialState,
    steps: StepGuard,
}

impl SequentialControlNorm {
    pub fn new(config: ControlNormConfig) -> NormResult<Self> {
        config.validate()?;
        let state = SequentialState::new(config.num_features);
        Ok(Self {
            config,
            state,
            steps: StepGuard::new(),
        })
    }

    pub fn state(&self) -> &SequentialState {
        &self.state
    }
}

/// Mean over (height, width) of one sample, per channel.
fn sample_mean(sample: &ArrayView3<f64>) -> ChannelStat {
    let (_, h, w) = sample.dim();
    sample.sum_axis(Axis(2)).sum_axis(Axis(1)) / (h * w) as f64
}

fn channel_view(stat: &ChannelStat) -> ArrayView3<'_, f64> {
    stat.view().insert_axis(Axis(1)).insert_axis(Axis(2))
}

impl ControlNorm for SequentialControlNorm {
    fn config(&self) -> &ControlNormConfig {
        &self.config
    }

    fn forward_train(
        &mut self,
        input: ArrayView4<f64>,
    ) -> NormResult<(FeatureBatch, BackwardContext)> {
        check_shape(
            "forward",
            &input,
            Some(self.config.batch_size),
            self.config.num_features,
        )?;
        let afwd = self.config.alpha_fwd;
        let (b, c, _, _) = input.dim();
        let mut output = FeatureBatch::zeros(input.raw_dim());
        let mut scale = Array2::<f64>::zeros((b, c));
        let (mu, var) = moments(&input);
        let state = &mut self.state;

        for idx in 0..b {
            let sample_scale = (&state.var + self.config.eps).mapv(f64::sqrt);
            let normalized = (&input.index_axis(Axis(0), idx) - &channel_view(&state.mean))
                / &channel_view(&sample_scale);
            output.index_axis_mut(Axis(0), idx).assign(&normalized);
            scale.row_mut(idx).assign(&sample_scale);

            let drift = &mu.row(idx) - &state.mean;
            state.var = &state.var * afwd
                + &(&var.row(idx) * (1.0 - afwd))
                + &(&drift * &drift * (afwd * (1.0 - afwd)));
            state.mean = &state.mean + &(&drift * (1.0 - afwd));
        }

        let (instance, step) = self.steps.begin_forward();
        trace!(step, "sequential forward");
        let ctx = BackwardContext::new(instance, step, output.clone(), scale);
        Ok((output, ctx))
    }

    fn forward_eval(&self, input: ArrayView4<f64>) -> NormResult<FeatureBatch> {
        check_shape("forward_eval", &input, None, self.config.num_features)?;
        let mean = channel_view(&self.state.mean).insert_axis(Axis(0));
        let scale = (&self.state.var + self.config.eps).mapv(f64::sqrt);
        Ok((&input - &mean) / &channel_view(&scale).insert_axis(Axis(0)))
    }

    fn backward(
        &mut self,
        ctx: &BackwardContext,
        grad_output: ArrayView4<f64>,
    ) -> NormResult<FeatureBatch> {
        check_same_shape("backward", &ctx.output().view(), &grad_output)?;
        self.steps.begin_backward(ctx)?;
        let abkw = self.config.alpha_bkw;
        let output = ctx.output();
        let mut grad_input = FeatureBatch::zeros(grad_output.raw_dim());
        let state = &mut self.state;

        for idx in 0..grad_output.len_of(Axis(0)) {
            let out = output.index_axis(Axis(0), idx);

            // ctrl grad_out with the v controller, then update it
            let grad_v_ctrl = &grad_output.index_axis(Axis(0), idx)
                - &(&channel_view(&state.v) * &out * (1.0 - abkw));
            state.v = &state.v + &sample_mean(&(&grad_v_ctrl * &out).view());

            let sample_scale = ctx.scale().row(idx).to_owned();
            let grad_scaled = grad_v_ctrl / &channel_view(&sample_scale);

            // ctrl the rescaled gradient with the u controller, then update it
            let grad = grad_scaled - &(&channel_view(&state.u) * (1.0 - abkw));
            state.u = &state.u + &sample_mean(&grad.view());
            grad_input.slice_mut(s![idx, .., .., ..]).assign(&grad);
        }

        trace!(step = ctx.step(), "sequential backward");
        Ok(grad_input)
    }

    fn running_statistics(&self) -> RunningStatistics {
        RunningStatistics {
            mean: self.state.mean.to_vec(),
            var: self.state.var.to_vec(),
            steps: self.steps.forward_steps(),
        }
    }

    fn reset(&mut self) {
        self.state = SequentialState::new(self.config.num_features);
        self.steps.restart();
    }
}
