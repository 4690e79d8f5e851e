use crate::{
    batch::{check_same_shape, check_shape, expand, moments, spatial_mean, FeatureBatch},
    control::{apply_control, controlled_recurrence, correlation_terms, decay_terms},
    ema::{ema_over_batch, DecayKernel},
    norm::{BackwardContext, ControlNorm, RunningStatistics, StepGuard},
    ControlNormConfig, NormResult,
};
use ndarray::{Array2, ArrayView4, Axis};
use tracing::{debug, trace};

/// Per-instance streaming state, every array (B, C).
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingState {
    pub mean_trajectory: Array2<f64>,
    pub var_trajectory: Array2<f64>,
    pub mean_prev: Array2<f64>,
    pub var_prev: Array2<f64>,
    pub u_trajectory: Array2<f64>,
    pub u_prev: Array2<f64>,
    pub v_prev: Array2<f64>,
    pub alpha_prev: Array2<f64>,
    pub beta_prev: Array2<f64>,
}

impl StreamingState {
    pub fn new(batch_size: usize, num_features: usize) -> Self {
        let zeros = || Array2::<f64>::zeros((batch_size, num_features));
        let ones = || Array2::<f64>::ones((batch_size, num_features));
        Self {
            mean_trajectory: zeros(),
            var_trajectory: ones(),
            mean_prev: zeros(),
            var_prev: ones(),
            u_trajectory: zeros(),
            u_prev: zeros(),
            v_prev: zeros(),
            alpha_prev: ones(),
            beta_prev: zeros(),
        }
    }
}

#[derive(Debug, Clone)]
struct DecayKernels {
    forward: DecayKernel,
    backward: DecayKernel,
}

/// Processes a whole mini-batch per call, reproducing the per-sample
/// recurrences through the batched primitives in [`crate::ema`] and
/// [`crate::control`].
pub struct LinearizedControlNorm {
    config: ControlNormConfig,
    state: StreamingState,
    kernels: Option<DecayKernels>,
    steps: StepGuard,
}

impl LinearizedControlNorm {
    pub fn new(config: ControlNormConfig) -> NormResult<Self> {
        config.validate()?;
        let state = StreamingState::new(config.batch_size, config.num_features);
        Ok(Self {
            config,
            state,
            kernels: None,
            steps: StepGuard::new(),
        })
    }

    pub fn state(&self) -> &StreamingState {
        &self.state
    }

    fn kernels(&mut self) -> DecayKernels {
        let config = &self.config;
        self.kernels
            .get_or_insert_with(|| {
                debug!(
                    batch_size = config.batch_size,
                    alpha_fwd = config.alpha_fwd,
                    alpha_bkw = config.alpha_bkw,
                    "building decay kernels"
                );
                DecayKernels {
                    forward: DecayKernel::new(config.alpha_fwd, config.batch_size),
                    backward: DecayKernel::new(config.alpha_bkw, config.batch_size),
                }
            })
            .clone()
    }
}

impl ControlNorm for LinearizedControlNorm {
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
        let kernel = self.kernels().forward;
        let rate = kernel.rate();
        let state = &mut self.state;

        let (mu, var) = moments(&input);

        let mean = ema_over_batch(&state.mean_prev, &mu, &state.mean_trajectory, &kernel);

        // per-sample variance plus the cross term against the stale mean
        let drift = &mu - &mean.stale;
        let var_current = &var + &(&drift * &drift * rate);
        let variance = ema_over_batch(&state.var_prev, &var_current, &state.var_trajectory, &kernel);

        let scale = (&variance.stale + self.config.eps).mapv(f64::sqrt);
        let output = (&input - &expand(&mean.stale.view())) / &expand(&scale.view());

        state.mean_prev = mu;
        state.var_prev = var_current;
        state.mean_trajectory = mean.fresh;
        state.var_trajectory = variance.fresh;

        let (instance, step) = self.steps.begin_forward();
        trace!(step, "linearized forward");
        let ctx = BackwardContext::new(instance, step, output.clone(), scale);
        Ok((output, ctx))
    }

    fn forward_eval(&self, input: ArrayView4<f64>) -> NormResult<FeatureBatch> {
        check_shape("forward_eval", &input, None, self.config.num_features)?;
        let last = self.config.batch_size - 1;
        let mean = self.state.mean_trajectory.row(last).insert_axis(Axis(0));
        let var = self.state.var_trajectory.row(last).insert_axis(Axis(0));
        let scale = (&var + self.config.eps).mapv(f64::sqrt);
        Ok((&input - &expand(&mean)) / &expand(&scale.view()))
    }

    fn backward(
        &mut self,
        ctx: &BackwardContext,
        grad_output: ArrayView4<f64>,
    ) -> NormResult<FeatureBatch> {
        check_same_shape("backward", &ctx.output().view(), &grad_output)?;
        self.steps.begin_backward(ctx)?;
        let kernel = self.kernels().backward;
        let rate = kernel.rate();
        let state = &mut self.state;
        let output = ctx.output().view();

        // v controller: decorrelate the gradient from the normalized output
        let alpha = decay_terms(&output, rate, self.config.decay_floor);
        let beta = correlation_terms(&grad_output, &output);
        let v = controlled_recurrence(
            &alpha,
            &beta,
            &state.alpha_prev,
            &state.beta_prev,
            &state.v_prev,
        );
        let controlled = apply_control(&grad_output, &output, &v.stale, rate);
        state.v_prev = v.fresh;
        state.alpha_prev = alpha;
        state.beta_prev = beta;

        let grad_scaled = controlled / &expand(&ctx.scale().view());

        // u controller: remove the running mean of the rescaled gradient
        let u_current = spatial_mean(&grad_scaled.view());
        let u = ema_over_batch(&state.u_prev, &u_current, &state.u_trajectory, &kernel);
        let grad_input = grad_scaled - &expand(&u.stale.view());
        state.u_prev = u_current;
        state.u_trajectory = u.fresh;

        trace!(step = ctx.step(), "linearized backward");
        Ok(grad_input)
    }

    fn running_statistics(&self) -> RunningStatistics {
        let last = self.config.batch_size - 1;
        RunningStatistics {
            mean: self.state.mean_trajectory.row(last).to_vec(),
            var: self.state.var_trajectory.row(last).to_vec(),
            steps: self.steps.forward_steps(),
        }
    }

    fn reset(&mut self) {
        self.state = StreamingState::new(self.config.batch_size, self.config.num_features);
        self.steps.restart();
    }
}
