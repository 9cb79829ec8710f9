//! The fused self-attention operator.
//!
//! Construction wires a fused query/key/value projection, an output
//! projection, and a rotary provider to an immutable [`AttentionConfig`].
//! The forward pass computes the widened projection once, splits it into
//! query/key/value slices, rotates query and key, extends the caller's
//! cache, and finishes with scaled, masked, numerically stable attention.
//!
//! The module holds no per-call state, so one instance can serve any number
//! of concurrent sequences as long as each supplies its own cache entry.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::softmax_last_dim;
use quant::QuantLinear;
use rotary::{apply_rotary_pos_emb, RotaryEmbedding};

use crate::cache::KvCacheEntry;
use crate::config::AttentionConfig;
use crate::errors::{backend_err, AttentionError};

/// Result of a forward pass.
#[derive(Debug)]
pub struct AttentionOutput {
    /// Attention result in model space, `(batch, seq_len, hidden_size)`.
    pub output: Tensor,
    /// Softmax-normalised attention matrix, present only when requested.
    /// Materialising it is wasted memory on the decode path, so it is
    /// omitted unless the caller asks.
    pub weights: Option<Tensor>,
    /// Updated cache, present only when cache use was enabled.
    pub cache: Option<KvCacheEntry>,
}

/// Multi-head self-attention backed by a fused quantized projection.
#[derive(Debug, Clone)]
pub struct FusedSelfAttention {
    config: AttentionConfig,
    qkv_proj: QuantLinear,
    o_proj: QuantLinear,
    rotary: RotaryEmbedding,
    first_call: OnceLock<()>,
}

impl FusedSelfAttention {
    /// Wire the operator. The head split and every projection width are
    /// checked here, once, rather than on the per-token path.
    pub fn new(
        config: AttentionConfig,
        qkv_proj: QuantLinear,
        o_proj: QuantLinear,
        rotary: RotaryEmbedding,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        let hidden = config.hidden_size;
        if qkv_proj.in_features() != hidden || qkv_proj.out_features() != 3 * hidden {
            return Err(AttentionError::ConfigInvalid {
                context: format!(
                    "fused qkv projection must map {hidden} -> {}, got {} -> {}",
                    3 * hidden,
                    qkv_proj.in_features(),
                    qkv_proj.out_features()
                ),
            });
        }
        if o_proj.in_features() != hidden || o_proj.out_features() != hidden {
            return Err(AttentionError::ConfigInvalid {
                context: format!(
                    "output projection must map {hidden} -> {hidden}, got {} -> {}",
                    o_proj.in_features(),
                    o_proj.out_features()
                ),
            });
        }
        if rotary.head_dim() != config.head_dim() {
            return Err(AttentionError::ConfigInvalid {
                context: format!(
                    "rotary head_dim {} does not match configured head_dim {}",
                    rotary.head_dim(),
                    config.head_dim()
                ),
            });
        }
        Ok(Self {
            config,
            qkv_proj,
            o_proj,
            rotary,
            first_call: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    fn split_heads(&self, tensor: &Tensor, batch: usize, seq_len: usize) -> Result<Tensor, AttentionError> {
        tensor
            .reshape((batch, seq_len, self.config.num_heads, self.config.head_dim()))
            .and_then(|t| t.transpose(1, 2))
            .and_then(|t| t.contiguous())
            .map_err(backend_err)
    }

    /// Forward pass.
    ///
    /// * `hidden_states`: `(batch, seq_len, hidden_size)`.
    /// * `attention_mask`: optional additive `(batch, 1, seq_len, total_kv)`
    ///   scores, usually `0.0` or a large negative value.
    /// * `position_ids`: `U32`, one rotary position per input token.
    /// * `past_key_value`: cache from the previous call of this sequence.
    /// * `use_cache`: return an updated cache entry.
    /// * `output_attentions`: return the normalised attention matrix.
    ///
    /// Shape deviations surface as [`AttentionError::ShapeMismatch`] with
    /// the expected and observed dimensions; nothing is silently corrected.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: Option<&Tensor>,
        position_ids: &Tensor,
        past_key_value: Option<&KvCacheEntry>,
        use_cache: bool,
        output_attentions: bool,
    ) -> Result<AttentionOutput, AttentionError> {
        let (batch, q_len, hidden) = hidden_states.dims3().map_err(backend_err)?;
        if hidden != self.config.hidden_size {
            return Err(AttentionError::ShapeMismatch {
                context: "hidden states",
                expected: vec![batch, q_len, self.config.hidden_size],
                actual: hidden_states.dims().to_vec(),
            });
        }
        let heads = self.config.num_heads;
        let head_dim = self.config.head_dim();

        if self.first_call.set(()).is_ok() {
            log::info!(
                "fused attention init: hidden_size={} heads={} head_dim={}",
                hidden,
                heads,
                head_dim
            );
        }

        // One widened product replaces the three per-projection matmuls.
        let qkv = self.qkv_proj.forward(hidden_states).map_err(quant_err)?;
        let query = qkv.narrow(2, 0, hidden).map_err(backend_err)?;
        let key = qkv.narrow(2, hidden, hidden).map_err(backend_err)?;
        let value = qkv.narrow(2, 2 * hidden, hidden).map_err(backend_err)?;

        let query = self.split_heads(&query, batch, q_len)?;
        let key = self.split_heads(&key, batch, q_len)?;
        let value = self.split_heads(&value, batch, q_len)?;

        let cached_len = past_key_value.map(KvCacheEntry::seq_len).unwrap_or(0);
        let total_kv_len = q_len + cached_len;

        let (cos, sin) = self
            .rotary
            .tables(&value, total_kv_len)
            .map_err(backend_err)?;
        let (query, key) = apply_rotary_pos_emb(&query, &key, &cos, &sin, position_ids)
            .map_err(backend_err)?;

        let (key, value) = match past_key_value {
            Some(past) => (
                Tensor::cat(&[past.keys(), &key], 2).map_err(backend_err)?,
                Tensor::cat(&[past.values(), &value], 2).map_err(backend_err)?,
            ),
            None => (key, value),
        };

        let new_cache = if use_cache {
            // The value slice of the fused projection can remain a
            // contiguous view of the full width-3h buffer (single-token
            // decode); a cache entry must not keep that buffer alive for
            // the rest of the session, so both tensors are detached into
            // their own storage.
            Some(KvCacheEntry::new(owned_copy(&key)?, owned_copy(&value)?)?)
        } else {
            None
        };

        let scores = (query
            .matmul(&key.t().map_err(backend_err)?)
            .map_err(backend_err)?
            / (head_dim as f64).sqrt())
        .map_err(backend_err)?;
        expect_dims(
            "attention weights",
            &scores,
            &[batch, heads, q_len, total_kv_len],
        )?;

        let scores = match attention_mask {
            Some(mask) => {
                expect_dims("attention mask", mask, &[batch, 1, q_len, total_kv_len])?;
                let mask = mask.to_dtype(scores.dtype()).map_err(backend_err)?;
                let masked = scores.broadcast_add(&mask).map_err(backend_err)?;
                // A fully masked row would otherwise reach softmax as -inf
                // and come back as NaN; flooring at the dtype's smallest
                // finite value keeps every entry well defined.
                let floor = Tensor::new(finite_min(masked.dtype())?, masked.device())
                    .and_then(|t| t.to_dtype(masked.dtype()))
                    .map_err(backend_err)?;
                masked.broadcast_maximum(&floor).map_err(backend_err)?
            }
            None => scores,
        };

        // Softmax accumulates in f32 regardless of the storage dtype.
        let dtype = scores.dtype();
        let probs = softmax_last_dim(&scores.to_dtype(DType::F32).map_err(backend_err)?)
            .map_err(backend_err)?
            .to_dtype(dtype)
            .map_err(backend_err)?;

        let attn_output = probs.matmul(&value).map_err(backend_err)?;
        expect_dims(
            "attention output",
            &attn_output,
            &[batch, heads, q_len, head_dim],
        )?;

        let attn_output = attn_output
            .transpose(1, 2)
            .and_then(|t| t.contiguous())
            .and_then(|t| t.reshape((batch, q_len, hidden)))
            .map_err(backend_err)?;
        let output = self.o_proj.forward(&attn_output).map_err(quant_err)?;

        Ok(AttentionOutput {
            output,
            weights: output_attentions.then_some(probs),
            cache: new_cache,
        })
    }
}

/// Detach a tensor into compact storage of exactly its logical shape.
fn owned_copy(tensor: &Tensor) -> Result<Tensor, AttentionError> {
    if tensor.is_contiguous() {
        // A contiguous slice can still borrow a wider allocation, and
        // `Tensor::copy` clones that whole allocation; summing into a zero
        // tensor always produces storage sized to the logical shape.
        Tensor::zeros(tensor.dims(), tensor.dtype(), tensor.device())
            .and_then(|zero| zero.add(tensor))
            .map_err(backend_err)
    } else {
        tensor.contiguous().map_err(backend_err)
    }
}

fn expect_dims(
    context: &'static str,
    tensor: &Tensor,
    expected: &[usize],
) -> Result<(), AttentionError> {
    if tensor.dims() == expected {
        Ok(())
    } else {
        Err(AttentionError::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: tensor.dims().to_vec(),
        })
    }
}

/// Smallest finite value representable in the score dtype.
fn finite_min(dtype: DType) -> Result<f32, AttentionError> {
    match dtype {
        DType::F32 => Ok(f32::MIN),
        DType::F16 => Ok(-65_504.0),
        DType::BF16 => Ok(-3.389_531_4e38),
        other => Err(AttentionError::Backend {
            message: format!("unsupported score dtype {other:?}"),
        }),
    }
}

fn quant_err(err: quant::QuantError) -> AttentionError {
    AttentionError::Backend {
        message: err.to_string(),
    }
}
