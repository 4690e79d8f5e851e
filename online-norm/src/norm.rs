use crate::{
    batch::FeatureBatch, linearized::LinearizedControlNorm, sequential::SequentialControlNorm,
    ControlNormConfig, NormError, NormResult, Strategy,
};
use ndarray::{Array2, ArrayView4};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_instance_id() -> u64 {
    NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Data a training forward hands to the matching backward.
///
/// Not `Clone`. Backward borrows it, so a call rejected for a bad gradient
/// leaves the context usable, and the owning instance refuses a second
/// successful backward for the same forward.
#[derive(Debug)]
pub struct BackwardContext {
    instance: u64,
    step: u64,
    output: FeatureBatch,
    scale: Array2<f64>,
}

impl BackwardContext {
    pub(crate) fn new(instance: u64, step: u64, output: FeatureBatch, scale: Array2<f64>) -> Self {
        Self {
            instance,
            step,
            output,
            scale,
        }
    }

    /// Normalized output of the forward call.
    pub fn output(&self) -> &FeatureBatch {
        &self.output
    }

    /// `sqrt(var_stale + eps)` per sample and channel, shape (B, C).
    pub fn scale(&self) -> &Array2<f64> {
        &self.scale
    }

    pub fn step(&self) -> u64 {
        self.step
    }
}

/// Forward/backward step counters shared by both strategies.
#[derive(Debug, Clone)]
pub(crate) struct StepGuard {
    instance: u64,
    forward_steps: u64,
    backward_steps: u64,
}

impl StepGuard {
    pub(crate) fn new() -> Self {
        Self {
            instance: next_instance_id(),
            forward_steps: 0,
            backward_steps: 0,
        }
    }

    pub(crate) fn begin_forward(&mut self) -> (u64, u64) {
        self.forward_steps += 1;
        (self.instance, self.forward_steps)
    }

    pub(crate) fn begin_backward(&mut self, ctx: &BackwardContext) -> NormResult<()> {
        if ctx.instance != self.instance {
            return Err(NormError::BackwardWithoutForward {
                reason: "context belongs to another instance",
            });
        }
        if ctx.step != self.forward_steps {
            return Err(NormError::BackwardWithoutForward {
                reason: "context was superseded by a later forward",
            });
        }
        if self.backward_steps >= self.forward_steps {
            return Err(NormError::BackwardWithoutForward {
                reason: "backward already ran for this forward",
            });
        }
        self.backward_steps = self.forward_steps;
        Ok(())
    }

    /// Forgets every outstanding context by taking a new instance id.
    pub(crate) fn restart(&mut self) {
        *self = Self::new();
    }

    pub(crate) fn forward_steps(&self) -> u64 {
        self.forward_steps
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunningStatistics {
    pub mean: Vec<f64>,
    pub var: Vec<f64>,
    pub steps: u64,
}

/// Streaming normalization with a controlled backward pass.
///
/// Implementations hold per-instance state and are single-writer: callers
/// serialize forward/backward calls on one instance.
pub trait ControlNorm: Send {
    fn config(&self) -> &ControlNormConfig;

    /// Normalizes a (B, C, H, W) batch and advances the forward statistics once.
    fn forward_train(
        &mut self,
        input: ArrayView4<f64>,
    ) -> NormResult<(FeatureBatch, BackwardContext)>;

    /// Normalizes with the latest statistics. Accepts any sample count.
    fn forward_eval(&self, input: ArrayView4<f64>) -> NormResult<FeatureBatch>;

    /// Propagates `grad_output` and advances the controllers once.
    fn backward(
        &mut self,
        ctx: &BackwardContext,
        grad_output: ArrayView4<f64>,
    ) -> NormResult<FeatureBatch>;

    fn running_statistics(&self) -> RunningStatistics;

    /// Restores the initial state (mean 0, variance 1, controllers 0) and
    /// invalidates every context handed out before the reset.
    fn reset(&mut self);

    fn forward(
        &mut self,
        input: ArrayView4<f64>,
        training: bool,
    ) -> NormResult<(FeatureBatch, Option<BackwardContext>)> {
        if training {
            let (output, ctx) = self.forward_train(input)?;
            Ok((output, Some(ctx)))
        } else {
            Ok((self.forward_eval(input)?, None))
        }
    }
}

pub fn build(config: ControlNormConfig) -> NormResult<Box<dyn ControlNorm>> {
    Ok(match config.strategy {
        Strategy::Linearized => Box::new(LinearizedControlNorm::new(config)?),
        Strategy::Sequential => Box::new(SequentialControlNorm::new(config)?),
    })
}
