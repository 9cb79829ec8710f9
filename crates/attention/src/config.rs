//! Static geometry shared by attention modules.

use serde::{Deserialize, Serialize};

use crate::errors::AttentionError;

/// Immutable attention geometry, typically read from model metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttentionConfig {
    /// Width of the residual stream.
    pub hidden_size: usize,
    /// Number of attention heads; must divide `hidden_size` evenly.
    pub num_heads: usize,
    /// Longest position the host model was trained for. Carried for parity
    /// with model metadata; positions are not policed at runtime.
    pub max_position_embeddings: usize,
}

impl AttentionConfig {
    /// Per-head width, `hidden_size / num_heads`.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    /// Validate the head split. Fails at module-build time, never per call.
    pub fn validate(&self) -> Result<(), AttentionError> {
        if self.hidden_size == 0 || self.num_heads == 0 {
            return Err(AttentionError::ConfigInvalid {
                context: format!(
                    "hidden_size {} and num_heads {} must be non-zero",
                    self.hidden_size, self.num_heads
                ),
            });
        }
        if self.hidden_size % self.num_heads != 0 {
            return Err(AttentionError::ConfigInvalid {
                context: format!(
                    "hidden_size {} is not divisible by num_heads {}",
                    self.hidden_size, self.num_heads
                ),
            });
        }
        Ok(())
    }
}
