use thiserror::Error;

pub type NormResult<T> = Result<T, NormError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormError {
    #[error("batch_size must be greater than 0")]
    InvalidBatchSize,
    #[error("num_features must be greater than 0")]
    InvalidFeatureCount,
    #[error("{name} must lie in [0, 1], got {value}")]
    InvalidDecayRate { name: &'static str, value: f64 },
    #[error("eps must be positive and finite, got {0}")]
    InvalidEpsilon(f64),
    #[error("decay_floor must be positive and finite, got {0}")]
    InvalidDecayFloor(f64),
    #[error("Shape mismatch in '{operation}': expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        operation: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Spatial extent of '{operation}' input is empty ({height}x{width})")]
    EmptySpatialExtent {
        operation: &'static str,
        height: usize,
        width: usize,
    },
    #[error("backward requires the context of the immediately preceding training forward on the same instance ({reason})")]
    BackwardWithoutForward { reason: &'static str },
}
