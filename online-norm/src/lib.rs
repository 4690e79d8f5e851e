//! Online Normalization: streaming per-channel statistics in the forward pass
//! and streaming gradient controllers in the backward pass.
//!
//! The default engine ([`linearized::LinearizedControlNorm`]) processes a
//! fixed-size mini-batch per call while behaving exactly as if every sample
//! had been processed one at a time; [`sequential::SequentialControlNorm`] is
//! that one-at-a-time loop, kept as a reference.

mod config;
pub use config::*;
mod error;
pub use error::*;
mod norm;
pub use norm::*;

pub mod batch;
pub mod control;
pub mod ema;
pub mod layer;
pub mod linearized;
pub mod sequential;
pub mod synthetic;

pub use batch::{ChannelStat, FeatureBatch};
pub use layer::{Affine, LayerScaling, OnlineNorm};
pub use linearized::LinearizedControlNorm;
pub use sequential::SequentialControlNorm;
