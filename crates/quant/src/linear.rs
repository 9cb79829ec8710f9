//! Packed low-bit linear projection.
//!
//! Weights are stored column-major in the logical sense of `(in_features,
//! out_features)` and packed along the input axis: each `u32` word of the
//! weight blob holds `32 / bits` consecutive input features for one output
//! feature. Zero points are packed the same way along the output axis, one
//! per `(group, output feature)` pair, and scales are kept unpacked as `f32`.
//! The forward pass dequantizes group by group, computes the product in
//! `f32`, and casts the result back to the input's storage dtype.

use candle_core::{DType, Tensor};

use crate::errors::{QuantError, Result};

/// Bit widths that pack evenly into `u32` words.
const SUPPORTED_BITS: [usize; 3] = [2, 4, 8];

/// Linear projection with packed integer weights and per-group metadata.
///
/// Blob shapes, with `pack = 32 / bits` and `groups = in_features /
/// group_size`:
/// * `qweight`: `U32`, `(in_features / pack, out_features)`
/// * `qzeros`: `U32`, `(groups, out_features / pack)`
/// * `scales`: `F32`, `(groups, out_features)`
/// * `bias`: optional `(out_features,)`
#[derive(Debug, Clone)]
pub struct QuantLinear {
    bits: usize,
    group_size: usize,
    in_features: usize,
    out_features: usize,
    qweight: Tensor,
    qzeros: Tensor,
    scales: Tensor,
    bias: Option<Tensor>,
}

impl QuantLinear {
    /// Assemble a projection from pre-packed blobs, validating every shape
    /// against the quantization parameters.
    pub fn new(
        bits: usize,
        group_size: usize,
        in_features: usize,
        out_features: usize,
        qweight: Tensor,
        qzeros: Tensor,
        scales: Tensor,
        bias: Option<Tensor>,
    ) -> Result<Self> {
        if !SUPPORTED_BITS.contains(&bits) {
            return Err(QuantError::InvalidConfig(format!(
                "unsupported bit width {bits}, expected one of {SUPPORTED_BITS:?}"
            )));
        }
        let pack = 32 / bits;
        if group_size == 0 || in_features % group_size != 0 {
            return Err(QuantError::InvalidConfig(format!(
                "group size {group_size} must divide in_features {in_features}"
            )));
        }
        if in_features % pack != 0 {
            return Err(QuantError::InvalidConfig(format!(
                "in_features {in_features} must pack evenly into u32 words at {bits} bits"
            )));
        }
        if out_features % pack != 0 {
            return Err(QuantError::InvalidConfig(format!(
                "out_features {out_features} must pack evenly into u32 words at {bits} bits"
            )));
        }
        let groups = in_features / group_size;

        expect_blob("qweight", &qweight, DType::U32, &[in_features / pack, out_features])?;
        expect_blob("qzeros", &qzeros, DType::U32, &[groups, out_features / pack])?;
        expect_blob("scales", &scales, DType::F32, &[groups, out_features])?;
        if let Some(bias) = &bias {
            if bias.dims() != [out_features] {
                return Err(QuantError::ShapeMismatch {
                    context: "bias",
                    expected: vec![out_features],
                    actual: bias.dims().to_vec(),
                });
            }
        }

        Ok(Self {
            bits,
            group_size,
            in_features,
            out_features,
            qweight,
            qzeros,
            scales,
            bias,
        })
    }

    /// Quantize a float weight matrix shaped `(in_features, out_features)`
    /// into packed blobs, using asymmetric per-group min/max ranges.
    ///
    /// The range of every `(group, output feature)` pair is extended to
    /// include zero so that zero activations survive the round trip exactly.
    pub fn quantize(
        weight: &Tensor,
        bits: usize,
        group_size: usize,
        bias: Option<Tensor>,
    ) -> Result<Self> {
        let (in_features, out_features) = weight.dims2().map_err(QuantError::Candle)?;
        let weight = weight.to_dtype(DType::F32)?;
        let rows = weight.to_vec2::<f32>()?;

        if !SUPPORTED_BITS.contains(&bits) {
            return Err(QuantError::InvalidConfig(format!(
                "unsupported bit width {bits}, expected one of {SUPPORTED_BITS:?}"
            )));
        }
        if group_size == 0 || in_features % group_size != 0 {
            return Err(QuantError::InvalidConfig(format!(
                "group size {group_size} must divide in_features {in_features}"
            )));
        }

        let pack = 32 / bits;
        if in_features % pack != 0 || out_features % pack != 0 {
            return Err(QuantError::InvalidConfig(format!(
                "({in_features}, {out_features}) does not pack evenly into u32 words at {bits} bits"
            )));
        }
        let groups = in_features / group_size;
        let maxq = ((1u32 << bits) - 1) as f32;

        let mut scales = vec![0f32; groups * out_features];
        let mut zeros = vec![0u32; groups * out_features];
        for g in 0..groups {
            for j in 0..out_features {
                let mut min = 0f32;
                let mut max = 0f32;
                for i in g * group_size..(g + 1) * group_size {
                    min = min.min(rows[i][j]);
                    max = max.max(rows[i][j]);
                }
                let mut scale = (max - min) / maxq;
                if scale == 0.0 {
                    scale = 1.0;
                }
                let zero = (-min / scale).round().clamp(0.0, maxq);
                scales[g * out_features + j] = scale;
                zeros[g * out_features + j] = zero as u32;
            }
        }

        let mut quantized = vec![0u32; in_features * out_features];
        for i in 0..in_features {
            let g = i / group_size;
            for j in 0..out_features {
                let scale = scales[g * out_features + j];
                let zero = zeros[g * out_features + j] as f32;
                let q = (rows[i][j] / scale).round() + zero;
                quantized[i * out_features + j] = q.clamp(0.0, maxq) as u32;
            }
        }

        let mut qweight = vec![0u32; (in_features / pack) * out_features];
        for i in 0..in_features {
            let word = i / pack;
            let shift = (i % pack) * bits;
            for j in 0..out_features {
                qweight[word * out_features + j] |= quantized[i * out_features + j] << shift;
            }
        }

        let mut qzeros = vec![0u32; groups * (out_features / pack)];
        for g in 0..groups {
            for j in 0..out_features {
                let word = j / pack;
                let shift = (j % pack) * bits;
                qzeros[g * (out_features / pack) + word] |= zeros[g * out_features + j] << shift;
            }
        }

        let device = weight.device();
        let qweight = Tensor::from_vec(qweight, (in_features / pack, out_features), device)?;
        let qzeros = Tensor::from_vec(qzeros, (groups, out_features / pack), device)?;
        let scales = Tensor::from_vec(scales, (groups, out_features), device)?;
        Self::new(
            bits,
            group_size,
            in_features,
            out_features,
            qweight,
            qzeros,
            scales,
            bias,
        )
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn qweight(&self) -> &Tensor {
        &self.qweight
    }

    pub fn qzeros(&self) -> &Tensor {
        &self.qzeros
    }

    pub fn scales(&self) -> &Tensor {
        &self.scales
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Expand the packed blobs into a dense `f32` weight of shape
    /// `(in_features, out_features)` on the blobs' device.
    pub fn dequantize(&self) -> Result<Tensor> {
        let pack = 32 / self.bits;
        let mask = (1u32 << self.bits) - 1;
        let qweight = self.qweight.to_vec2::<u32>()?;
        let qzeros = self.qzeros.to_vec2::<u32>()?;
        let scales = self.scales.to_vec2::<f32>()?;

        let mut dense = vec![0f32; self.in_features * self.out_features];
        for i in 0..self.in_features {
            let g = i / self.group_size;
            let word = i / pack;
            let shift = (i % pack) * self.bits;
            for j in 0..self.out_features {
                let q = (qweight[word][j] >> shift) & mask;
                let zero = (qzeros[g][j / pack] >> ((j % pack) * self.bits)) & mask;
                dense[i * self.out_features + j] =
                    (q as f32 - zero as f32) * scales[g][j];
            }
        }
        let dense = Tensor::from_vec(
            dense,
            (self.in_features, self.out_features),
            self.qweight.device(),
        )?;
        Ok(dense)
    }

    /// Dequantized matrix product. Accepts `(batch, seq, in_features)` or
    /// `(rows, in_features)` inputs and mirrors the input dtype on output.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let dims = input.dims().to_vec();
        let last = dims.last().copied().unwrap_or(0);
        if !(dims.len() == 2 || dims.len() == 3) || last != self.in_features {
            return Err(QuantError::ShapeMismatch {
                context: "input",
                expected: vec![self.in_features],
                actual: dims,
            });
        }

        let dtype = input.dtype();
        let weight = self.dequantize()?.to_device(input.device())?;
        let flat = if dims.len() == 3 {
            input.reshape((dims[0] * dims[1], self.in_features))?
        } else {
            input.clone()
        };
        let mut product = flat.to_dtype(DType::F32)?.matmul(&weight)?;
        if let Some(bias) = &self.bias {
            product = product.broadcast_add(&bias.to_dtype(DType::F32)?)?;
        }
        let product = if dims.len() == 3 {
            product.reshape((dims[0], dims[1], self.out_features))?
        } else {
            product
        };
        Ok(product.to_dtype(dtype)?)
    }
}

fn expect_blob(context: &'static str, blob: &Tensor, dtype: DType, shape: &[usize]) -> Result<()> {
    if blob.dtype() != dtype {
        return Err(QuantError::InvalidConfig(format!(
            "{context} must be {dtype:?}, got {:?}",
            blob.dtype()
        )));
    }
    if blob.dims() != shape {
        return Err(QuantError::ShapeMismatch {
            context,
            expected: shape.to_vec(),
            actual: blob.dims().to_vec(),
        });
    }
    Ok(())
}
