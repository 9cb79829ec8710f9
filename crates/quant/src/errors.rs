use thiserror::Error;

pub type Result<T> = std::result::Result<T, QuantError>;

#[derive(Error, Debug)]
pub enum QuantError {
    /// Projections passed to fusion disagree on a quantization parameter.
    #[error("fusion mismatch on {field}: {left} vs {right}")]
    FusionMismatch {
        field: &'static str,
        left: usize,
        right: usize,
    },

    /// A quantization parameter is unusable on its own.
    #[error("invalid quantization config: {0}")]
    InvalidConfig(String),

    /// A packed blob does not match the shape implied by the parameters.
    #[error("{context}: expected shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}
