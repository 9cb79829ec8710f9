//! Fused multi-head self-attention over quantized projections.
//!
//! The operator computes one widened matrix product through a fused
//! query/key/value projection, applies rotary position embeddings, extends a
//! caller-owned key/value cache, and runs numerically stable masked
//! attention. Inputs are `(batch, seq_len, hidden_size)` hidden states; the
//! per-head layout is `(batch, heads, seq_len, head_dim)` with reductions
//! accumulated in `f32` regardless of the storage dtype.
//!
//! Each forward call is a pure function of its inputs and the read-only
//! weights: callers own their cache entries, so concurrent sequences never
//! share mutable state.

pub mod cache;
pub mod config;
pub mod errors;
pub mod fused;
pub mod masks;

pub use cache::KvCacheEntry;
pub use config::AttentionConfig;
pub use errors::AttentionError;
pub use fused::{AttentionOutput, FusedSelfAttention};
