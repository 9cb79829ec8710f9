//! Error types emitted by the attention operator.

/// Attention-specific error category.
#[derive(Debug)]
pub enum AttentionError {
    /// The module configuration cannot describe a valid head layout.
    ConfigInvalid { context: String },
    /// An intermediate tensor deviated from its contractual shape.
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    /// A backend failure propagated to the caller.
    Backend { message: String },
}

impl std::fmt::Display for AttentionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttentionError::ConfigInvalid { context } => {
                write!(f, "invalid attention config: {context}")
            }
            AttentionError::ShapeMismatch {
                context,
                expected,
                actual,
            } => {
                write!(f, "{context}: expected shape {expected:?}, got {actual:?}")
            }
            AttentionError::Backend { message } => f.write_str(message),
        }
    }
}

impl std::error::Error for AttentionError {}

pub(crate) fn backend_err(err: candle_core::Error) -> AttentionError {
    AttentionError::Backend {
        message: err.to_string(),
    }
}
