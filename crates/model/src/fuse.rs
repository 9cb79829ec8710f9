//! Attention fusion pass.
//!
//! Runs once at model-load time. Every unfused attention node has its
//! query/key/value projections concatenated into one fused projection and
//! is replaced, in place, by the fused operator. The pass is all-or-
//! nothing: replacements are built read-only first, so any precondition
//! violation aborts before the tree is touched. Fused nodes are not
//! candidates, which makes a second run a no-op.

use attention::{AttentionError, FusedSelfAttention};
use quant::{fuse_projections, QuantError};
use thiserror::Error;

use crate::tree::{Module, SelfAttention, TreeError};

#[derive(Error, Debug)]
pub enum FuseError {
    #[error(transparent)]
    Quant(#[from] QuantError),
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error(transparent)]
    Tree(#[from] TreeError),
}

/// Replace every unfused attention module under `root` with its fused
/// counterpart. Returns the number of modules rewritten.
pub fn fuse_attention(root: &mut Module) -> Result<usize, FuseError> {
    let mut replacements = Vec::new();
    for (path, module) in root.named_modules() {
        if let Module::Attention(unfused) = module {
            log::debug!("fusing attention module at `{path}`");
            replacements.push((path, build_fused(unfused)?));
        }
    }

    let count = replacements.len();
    for (path, fused) in replacements {
        root.replace(&path, Module::FusedAttention(Box::new(fused)))?;
    }
    log::info!("fused {count} attention modules");
    Ok(count)
}

fn build_fused(unfused: &SelfAttention) -> Result<FusedSelfAttention, FuseError> {
    let qkv = fuse_projections(&[&unfused.q_proj, &unfused.k_proj, &unfused.v_proj])?;
    let fused = FusedSelfAttention::new(
        unfused.config.clone(),
        qkv,
        unfused.o_proj.clone(),
        unfused.rotary.clone(),
    )?;
    Ok(fused)
}
