//! Module tree and the attention fusion pass.
//!
//! A model is an explicit tree of named modules. The fusion pass walks the
//! tree once at load time, rewrites every unfused attention node into its
//! fused counterpart, and leaves everything else in place.

pub mod fuse;
pub mod tree;

pub use fuse::{fuse_attention, FuseError};
pub use tree::{Container, Module, SelfAttention, TreeError};
