//! Caller-owned key/value cache for incremental decoding.

use candle_core::Tensor;

use crate::errors::{backend_err, AttentionError};

/// Cached keys and values for one decoding session of one layer.
///
/// Both tensors are shaped `(batch, heads, cached_len, head_dim)` and always
/// agree on every dimension. An entry is produced by a cache-enabled forward
/// call, threaded back into the next call by the caller, and dropped when
/// the session ends; the module itself never retains one. The tensors own
/// independent contiguous storage, so holding an entry across a long session
/// does not pin any projection buffer from the call that produced it.
#[derive(Debug, Clone)]
pub struct KvCacheEntry {
    keys: Tensor,
    values: Tensor,
}

impl KvCacheEntry {
    /// Build an entry, validating that keys and values agree in shape.
    pub fn new(keys: Tensor, values: Tensor) -> Result<Self, AttentionError> {
        keys.dims4().map_err(backend_err)?;
        if values.dims() != keys.dims() {
            return Err(AttentionError::ShapeMismatch {
                context: "cached values",
                expected: keys.dims().to_vec(),
                actual: values.dims().to_vec(),
            });
        }
        Ok(Self { keys, values })
    }

    pub fn keys(&self) -> &Tensor {
        &self.keys
    }

    pub fn values(&self) -> &Tensor {
        &self.values
    }

    /// Number of cached positions.
    pub fn seq_len(&self) -> usize {
        self.keys.dims()[2]
    }
}
