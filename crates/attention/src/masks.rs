//! Additive attention mask builders.
//!
//! Masks are `f32` tensors shaped `(batch, 1, q_len, k_len)`, added to raw
//! attention scores before softmax: `0.0` keeps a position, a large negative
//! value discards it. The head axis is left at size one and broadcast by the
//! operator.

use candle_core::{Device, Result, Tensor};

/// Construct a causal mask for the supplied sequence dimensions.
///
/// When `k_len > q_len`, queries are assumed to align with the most recent
/// `q_len` keys, so every query may see the entire cached prefix.
pub fn build_causal_mask(
    device: &Device,
    batch: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let mut data = vec![0f32; batch * q_len * k_len];
    let offset = k_len.saturating_sub(q_len);

    for b in 0..batch {
        for q in 0..q_len {
            let row_start = (b * q_len + q) * k_len;
            let max_k = q + offset;
            for k in 0..k_len {
                if k > max_k {
                    data[row_start + k] = f32::NEG_INFINITY;
                }
            }
        }
    }

    Tensor::from_vec(data, (batch, 1, q_len, k_len), device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn square_mask_is_lower_triangular() -> Result<()> {
        let mask = build_causal_mask(&Device::Cpu, 1, 3, 3)?;
        let rows = mask.reshape((3, 3))?.to_vec2::<f32>()?;
        for (q, row) in rows.iter().enumerate() {
            for (k, &value) in row.iter().enumerate() {
                if k <= q {
                    assert_eq!(value, 0.0);
                } else {
                    assert_eq!(value, f32::NEG_INFINITY);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn extended_prefix_is_visible() -> Result<()> {
        // One new query against two cached keys plus itself.
        let mask = build_causal_mask(&Device::Cpu, 1, 1, 3)?;
        let row = mask.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(row, vec![0.0, 0.0, 0.0]);
        Ok(())
    }
}
