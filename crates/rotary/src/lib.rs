//! Rotary position embeddings for attention layers.
//!
//! The provider owns lazily built `f32` cosine/sine tables shaped
//! `(covered_len, head_dim)`: the half-width angle table is duplicated along
//! the feature axis so the tables line up with the rotate-half convention,
//! where the two halves of every head vector are rotated against each other.
//! Tables grow on demand and never shrink, so a decode loop that extends its
//! context only pays for trigonometry once per new high-water mark.
//!
//! Callers hand `tables` a reference tensor purely to pin the device and
//! dtype of the returned slices; its content is never read.

use std::sync::Mutex;

use candle_core::{bail, DType, Device, Result, Tensor};

#[derive(Debug, Clone)]
struct Tables {
    coverage: usize,
    cos: Tensor,
    sin: Tensor,
}

/// Cos/sin table provider for a fixed head dimension and base angle.
#[derive(Debug)]
pub struct RotaryEmbedding {
    head_dim: usize,
    theta: f64,
    tables: Mutex<Option<Tables>>,
}

impl Clone for RotaryEmbedding {
    fn clone(&self) -> Self {
        let tables = self.tables.lock().expect("rotary table lock poisoned");
        Self {
            head_dim: self.head_dim,
            theta: self.theta,
            tables: Mutex::new(tables.clone()),
        }
    }
}

impl RotaryEmbedding {
    /// Create a provider for the given head dimension, with the base angle
    /// parameter theta (10 000 in the standard parameterisation).
    pub fn new(head_dim: usize, theta: f64) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            bail!("head_dim must be a non-zero even number, got {head_dim}");
        }
        Ok(Self {
            head_dim,
            theta,
            tables: Mutex::new(None),
        })
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Return cos/sin tables covering positions `0..total_len`, shaped
    /// `(total_len, head_dim)` and cast to the dtype/device of `reference`.
    pub fn tables(&self, reference: &Tensor, total_len: usize) -> Result<(Tensor, Tensor)> {
        if total_len == 0 {
            bail!("total_len must be non-zero");
        }
        let device = reference.device();
        let mut guard = self.tables.lock().expect("rotary table lock poisoned");
        let rebuild = match guard.as_ref() {
            Some(tables) => {
                tables.coverage < total_len || !tables.cos.device().same_device(device)
            }
            None => true,
        };
        if rebuild {
            log::debug!(
                "building rotary tables for {} positions (head_dim {})",
                total_len,
                self.head_dim
            );
            *guard = Some(self.build(total_len, device)?);
        }
        let tables = guard.as_ref().expect("tables present after rebuild");
        let cos = tables
            .cos
            .narrow(0, 0, total_len)?
            .to_dtype(reference.dtype())?;
        let sin = tables
            .sin
            .narrow(0, 0, total_len)?
            .to_dtype(reference.dtype())?;
        Ok((cos, sin))
    }

    fn build(&self, len: usize, device: &Device) -> Result<Tables> {
        let half = self.head_dim / 2;
        let mut inv_freqs = Vec::with_capacity(half);
        for idx in 0..half {
            let exponent = (2 * idx) as f64 / self.head_dim as f64;
            inv_freqs.push(self.theta.powf(-exponent));
        }

        let mut cos_data = Vec::with_capacity(len * half);
        let mut sin_data = Vec::with_capacity(len * half);
        for pos in 0..len {
            let pos_f = pos as f64;
            for &inv_freq in &inv_freqs {
                let angle = pos_f * inv_freq;
                cos_data.push(angle.cos() as f32);
                sin_data.push(angle.sin() as f32);
            }
        }

        let cos_half = Tensor::from_vec(cos_data, (len, half), device)?;
        let sin_half = Tensor::from_vec(sin_data, (len, half), device)?;
        // Duplicate the half-width block so the table width matches head_dim.
        let cos = Tensor::cat(&[&cos_half, &cos_half], 1)?;
        let sin = Tensor::cat(&[&sin_half, &sin_half], 1)?;
        Ok(Tables {
            coverage: len,
            cos,
            sin,
        })
    }
}

/// Negate the second half of the last axis and swap it in front of the
/// first: `[x1, x2] -> [-x2, x1]`.
fn rotate_half(tensor: &Tensor) -> Result<Tensor> {
    let head_dim = *tensor
        .dims()
        .last()
        .ok_or_else(|| candle_core::Error::Msg("rotate_half on a scalar".into()))?;
    let half = head_dim / 2;
    let first = tensor.narrow(3, 0, half)?;
    let second = tensor.narrow(3, half, half)?;
    Tensor::cat(&[&second.neg()?, &first], 3)
}

/// Apply rotary embeddings to query and key tensors shaped
/// `(batch, heads, seq_len, head_dim)`.
///
/// `cos`/`sin` are tables shaped `(table_len, head_dim)` and `position_ids`
/// is a 1-D `U32` tensor of length `seq_len` selecting a table row per
/// token; rows need not be contiguous. The rotation is computed in `f32`
/// and the outputs mirror the inputs' dtype.
pub fn apply_rotary_pos_emb(
    q: &Tensor,
    k: &Tensor,
    cos: &Tensor,
    sin: &Tensor,
    position_ids: &Tensor,
) -> Result<(Tensor, Tensor)> {
    let (_batch, _heads, seq_len, head_dim) = q.dims4()?;
    if k.dims() != q.dims() {
        bail!("q/k shape mismatch: q={:?} k={:?}", q.dims(), k.dims());
    }
    if head_dim % 2 != 0 {
        bail!("head_dim must be even to rotate, got {head_dim}");
    }
    if position_ids.rank() != 1 || position_ids.dims()[0] != seq_len {
        bail!(
            "position_ids must be 1-D of length {seq_len}, got {:?}",
            position_ids.dims()
        );
    }
    if position_ids.dtype() != DType::U32 {
        bail!("position_ids must be U32, got {:?}", position_ids.dtype());
    }
    let (_, cos_dim) = cos.dims2()?;
    let (_, sin_dim) = sin.dims2()?;
    if cos_dim != head_dim || sin_dim != head_dim {
        bail!("cos/sin table width must equal head_dim {head_dim}");
    }

    let cos_rows = cos
        .index_select(position_ids, 0)?
        .to_dtype(DType::F32)?
        .reshape((1, 1, seq_len, head_dim))?;
    let sin_rows = sin
        .index_select(position_ids, 0)?
        .to_dtype(DType::F32)?
        .reshape((1, 1, seq_len, head_dim))?;

    let rotate = |tensor: &Tensor| -> Result<Tensor> {
        let dtype = tensor.dtype();
        let tensor_f32 = tensor.to_dtype(DType::F32)?.contiguous()?;
        let rotated = tensor_f32
            .broadcast_mul(&cos_rows)?
            .add(&rotate_half(&tensor_f32)?.broadcast_mul(&sin_rows)?)?;
        rotated.to_dtype(dtype)
    };

    Ok((rotate(q)?, rotate(k)?))
}
