use crate::{NormError, NormResult};
use serde::{Deserialize, Serialize};
use serde_json::{from_value, Map, Value};
use tracing::warn;

pub const DEFAULT_ALPHA_FWD: f64 = 0.999;
pub const DEFAULT_ALPHA_BKW: f64 = 0.99;
pub const DEFAULT_EPS: f64 = 1e-5;
/// Lower clamp applied to the backward decay term before it is moved to log space.
pub const DEFAULT_DECAY_FLOOR: f64 = 1e-5;

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Whole mini-batch per call through the convolution primitives.
    #[default]
    Linearized,
    /// Explicit per-sample loop, kept as a numerical oracle.
    Sequential,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ControlNormConfig {
    pub num_features: usize,
    pub batch_size: usize,
    #[serde(default = "default_alpha_fwd")]
    pub alpha_fwd: f64,
    #[serde(default = "default_alpha_bkw")]
    pub alpha_bkw: f64,
    #[serde(default = "default_eps")]
    pub eps: f64,
    #[serde(default = "default_decay_floor")]
    pub decay_floor: f64,
    #[serde(default)]
    pub strategy: Strategy,
}

fn default_alpha_fwd() -> f64 {
    DEFAULT_ALPHA_FWD
}

fn default_alpha_bkw() -> f64 {
    DEFAULT_ALPHA_BKW
}

fn default_eps() -> f64 {
    DEFAULT_EPS
}

fn default_decay_floor() -> f64 {
    DEFAULT_DECAY_FLOOR
}

fn default_true() -> bool {
    true
}

impl ControlNormConfig {
    pub fn new(num_features: usize, batch_size: usize) -> Self {
        Self {
            num_features,
            batch_size,
            alpha_fwd: DEFAULT_ALPHA_FWD,
            alpha_bkw: DEFAULT_ALPHA_BKW,
            eps: DEFAULT_EPS,
            decay_floor: DEFAULT_DECAY_FLOOR,
            strategy: Strategy::default(),
        }
    }

    pub fn with_decay(mut self, alpha_fwd: f64, alpha_bkw: f64) -> Self {
        self.alpha_fwd = alpha_fwd;
        self.alpha_bkw = alpha_bkw;
        self
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_decay_floor(mut self, decay_floor: f64) -> Self {
        self.decay_floor = decay_floor;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn validate(&self) -> NormResult<()> {
        if self.batch_size == 0 {
            return Err(NormError::InvalidBatchSize);
        }
        if self.num_features == 0 {
            return Err(NormError::InvalidFeatureCount);
        }
        validate_decay_rate("alpha_fwd", self.alpha_fwd)?;
        validate_decay_rate("alpha_bkw", self.alpha_bkw)?;
        if !(self.eps.is_finite() && self.eps > 0.0) {
            return Err(NormError::InvalidEpsilon(self.eps));
        }
        if !(self.decay_floor.is_finite() && self.decay_floor > 0.0) {
            return Err(NormError::InvalidDecayFloor(self.decay_floor));
        }
        Ok(())
    }
}

fn validate_decay_rate(name: &'static str, value: f64) -> NormResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(NormError::InvalidDecayRate { name, value });
    }
    if value == 0.0 || value == 1.0 {
        warn!(name, value, "decay rate on the boundary of (0, 1), statistics will degenerate");
    }
    Ok(())
}

impl TryFrom<Map<String, Value>> for ControlNormConfig {
    type Error = serde_json::Error;

    fn try_from(v: Map<String, Value>) -> Result<Self, Self::Error> {
        from_value(Value::Object(v))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OnlineNormConfig {
    #[serde(flatten)]
    pub control: ControlNormConfig,
    #[serde(default = "default_true")]
    pub weight: bool,
    #[serde(default = "default_true")]
    pub bias: bool,
    #[serde(default = "default_true")]
    pub layer_scaling: bool,
}

impl OnlineNormConfig {
    pub fn new(control: ControlNormConfig) -> Self {
        Self {
            control,
            weight: true,
            bias: true,
            layer_scaling: true,
        }
    }

    pub fn validate(&self) -> NormResult<()> {
        self.control.validate()
    }
}
