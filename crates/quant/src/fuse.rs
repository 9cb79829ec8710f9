//! Blob-level fusion of projections that share an input.
//!
//! Fusing concatenates the packed weight, zero-point, and scale blobs of
//! several projections along the output-feature axis, producing one
//! projection whose single matrix product replaces the individual ones.
//! Callers split the widened output back into per-projection slices.

use candle_core::Tensor;

use crate::errors::{QuantError, Result};
use crate::linear::QuantLinear;

/// Fuse projections into one whose output width is the sum of the parts.
///
/// Parts are concatenated in the order given; for attention this is always
/// query, key, value. All parts must agree on bit width, group size, and
/// input-feature count, and none may carry a bias.
pub fn fuse_projections(parts: &[&QuantLinear]) -> Result<QuantLinear> {
    let first = parts
        .first()
        .ok_or_else(|| QuantError::InvalidConfig("no projections to fuse".into()))?;
    for part in &parts[1..] {
        if part.bits() != first.bits() {
            return Err(QuantError::FusionMismatch {
                field: "bits",
                left: first.bits(),
                right: part.bits(),
            });
        }
        if part.group_size() != first.group_size() {
            return Err(QuantError::FusionMismatch {
                field: "group_size",
                left: first.group_size(),
                right: part.group_size(),
            });
        }
        if part.in_features() != first.in_features() {
            return Err(QuantError::FusionMismatch {
                field: "in_features",
                left: first.in_features(),
                right: part.in_features(),
            });
        }
    }
    if parts.iter().any(|part| part.bias().is_some()) {
        return Err(QuantError::InvalidConfig(
            "bias is not carried by fusion".into(),
        ));
    }

    let qweights: Vec<&Tensor> = parts.iter().map(|p| p.qweight()).collect();
    let qzeros: Vec<&Tensor> = parts.iter().map(|p| p.qzeros()).collect();
    let scales: Vec<&Tensor> = parts.iter().map(|p| p.scales()).collect();
    let out_features = parts.iter().map(|p| p.out_features()).sum();
    log::debug!(
        "fusing {} projections into one with {} output features",
        parts.len(),
        out_features
    );

    QuantLinear::new(
        first.bits(),
        first.group_size(),
        first.in_features(),
        out_features,
        Tensor::cat(&qweights, 1)?,
        Tensor::cat(&qzeros, 1)?,
        Tensor::cat(&scales, 1)?,
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        let diff = a.sub(b).unwrap().abs().unwrap();
        diff.flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .into_iter()
            .fold(0f32, f32::max)
    }

    fn random_projection(device: &Device, out_features: usize, bits: usize) -> QuantLinear {
        let weight = Tensor::randn(0f32, 0.5, (16, out_features), device).unwrap();
        QuantLinear::quantize(&weight, bits, 8, None).unwrap()
    }

    #[test]
    fn fused_width_is_the_sum_of_parts() -> Result<()> {
        let device = Device::Cpu;
        let q = random_projection(&device, 8, 8);
        let k = random_projection(&device, 16, 8);
        let v = random_projection(&device, 24, 8);
        let fused = fuse_projections(&[&q, &k, &v])?;
        assert_eq!(fused.out_features(), 48);
        assert_eq!(fused.bits(), 8);
        assert_eq!(fused.group_size(), 8);
        Ok(())
    }

    #[test]
    fn fused_forward_matches_concatenated_parts() -> Result<()> {
        let device = Device::Cpu;
        for &bits in &[4usize, 8] {
            let q = random_projection(&device, 8, bits);
            let k = random_projection(&device, 8, bits);
            let v = random_projection(&device, 16, bits);
            let fused = fuse_projections(&[&q, &k, &v])?;

            let input = Tensor::randn(0f32, 1.0, (2, 3, 16), &device)?;
            let fused_out = fused.forward(&input)?;
            let parts_out = Tensor::cat(
                &[
                    &q.forward(&input)?,
                    &k.forward(&input)?,
                    &v.forward(&input)?,
                ],
                2,
            )?;
            assert!(max_abs_diff(&fused_out, &parts_out) < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn mismatched_bits_fail() {
        let device = Device::Cpu;
        let q = random_projection(&device, 8, 8);
        let k = random_projection(&device, 8, 4);
        let v = random_projection(&device, 8, 8);
        let err = fuse_projections(&[&q, &k, &v]).unwrap_err();
        assert!(matches!(
            err,
            QuantError::FusionMismatch { field: "bits", left: 8, right: 4 }
        ));
    }

    #[test]
    fn mismatched_group_size_fails() {
        let device = Device::Cpu;
        let q = random_projection(&device, 8, 8);
        let weight = Tensor::randn(0f32, 0.5, (16, 8), &device).unwrap();
        let k = QuantLinear::quantize(&weight, 8, 16, None).unwrap();
        let err = fuse_projections(&[&q, &k]).unwrap_err();
        assert!(matches!(
            err,
            QuantError::FusionMismatch { field: "group_size", .. }
        ));
    }

    #[test]
    fn mismatched_input_width_fails() {
        let device = Device::Cpu;
        let q = random_projection(&device, 8, 8);
        let weight = Tensor::randn(0f32, 0.5, (32, 8), &device).unwrap();
        let k = QuantLinear::quantize(&weight, 8, 8, None).unwrap();
        let err = fuse_projections(&[&q, &k]).unwrap_err();
        assert!(matches!(
            err,
            QuantError::FusionMismatch { field: "in_features", .. }
        ));
    }

    #[test]
    fn biased_parts_are_rejected() {
        let device = Device::Cpu;
        let weight = Tensor::randn(0f32, 0.5, (16, 8), &device).unwrap();
        let bias = Tensor::zeros(8, candle_core::DType::F32, &device).unwrap();
        let q = QuantLinear::quantize(&weight, 8, 8, Some(bias)).unwrap();
        let k = random_projection(&device, 8, 8);
        let err = fuse_projections(&[&q, &k]).unwrap_err();
        assert!(matches!(err, QuantError::InvalidConfig(_)));
    }
}
