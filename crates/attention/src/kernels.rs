//! Softmax kernels behind [`Implementation`].
//!
//! Both kernels receive `f32` scores shaped `[batch, heads, q_len, k_len]`
//! that already include the scale and additive bias. They differ only in how
//! the row-wise softmax is evaluated, so outputs agree within floating-point
//! tolerance but are not guaranteed to be bit-identical.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::ops::softmax_last_dim;

use crate::backend::Implementation;
use crate::error::AttentionError;

/// Largest head dimension accepted by the fused kernel.
pub const FUSED_MAX_HEAD_DIM: usize = 256;
/// The fused kernel works on head dimensions that are multiples of this.
pub const FUSED_HEAD_DIM_MULTIPLE: usize = 8;

/// A row-wise softmax strategy for attention scores.
pub trait AttentionKernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Checks whether inputs with this dtype and head size can run here.
    fn check_available(&self, dtype: DType, head_dim: usize) -> std::result::Result<(), AttentionError>;

    /// Normalises the last axis of `scores` into probabilities.
    fn probabilities(&self, scores: &Tensor) -> Result<Tensor>;
}

/// Portable softmax composed from primitive ops with max subtraction.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericAttention;

impl AttentionKernel for GenericAttention {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn check_available(&self, _dtype: DType, _head_dim: usize) -> std::result::Result<(), AttentionError> {
        Ok(())
    }

    fn probabilities(&self, scores: &Tensor) -> Result<Tensor> {
        let max = scores.max_keepdim(D::Minus1)?;
        let shifted = scores.broadcast_sub(&max)?.exp()?;
        let denom = shifted.sum_keepdim(D::Minus1)?;
        shifted.broadcast_div(&denom)
    }
}

/// Fused last-axis softmax provided by `candle-nn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FusedAttention;

impl AttentionKernel for FusedAttention {
    fn name(&self) -> &'static str {
        "cudnn"
    }

    fn check_available(&self, dtype: DType, head_dim: usize) -> std::result::Result<(), AttentionError> {
        if !matches!(dtype, DType::F16 | DType::BF16 | DType::F32) {
            return Err(AttentionError::BackendUnavailable {
                backend: self.name(),
                reason: format!("dtype {dtype:?} is not supported"),
            });
        }
        if head_dim % FUSED_HEAD_DIM_MULTIPLE != 0 || head_dim > FUSED_MAX_HEAD_DIM {
            return Err(AttentionError::BackendUnavailable {
                backend: self.name(),
                reason: format!(
                    "head_dim {head_dim} must be a multiple of {FUSED_HEAD_DIM_MULTIPLE} and at most {FUSED_MAX_HEAD_DIM}"
                ),
            });
        }
        Ok(())
    }

    fn probabilities(&self, scores: &Tensor) -> Result<Tensor> {
        softmax_last_dim(&scores.contiguous()?)
    }
}

/// Resolves `implementation` to a concrete kernel for the given inputs.
///
/// [`Implementation::Unspecified`] picks the fused kernel when it qualifies and
/// the generic kernel otherwise. An explicit [`Implementation::Fused`] request
/// that does not qualify is an error.
pub fn select_kernel(
    implementation: Implementation,
    dtype: DType,
    head_dim: usize,
) -> std::result::Result<&'static dyn AttentionKernel, AttentionError> {
    static GENERIC: GenericAttention = GenericAttention;
    static FUSED: FusedAttention = FusedAttention;

    let kernel: &'static dyn AttentionKernel = match implementation {
        Implementation::Generic => &GENERIC,
        Implementation::Fused => {
            FUSED.check_available(dtype, head_dim)?;
            &FUSED
        }
        Implementation::Unspecified => match FUSED.check_available(dtype, head_dim) {
            Ok(()) => &FUSED,
            Err(_) => &GENERIC,
        },
    };
    log::debug!(
        "attention kernel {} selected for {implementation} (dtype={dtype:?}, head_dim={head_dim})",
        kernel.name()
    );
    Ok(kernel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn fused_requires_aligned_head_dim() {
        assert!(FusedAttention.check_available(DType::F32, 64).is_ok());
        let err = FusedAttention.check_available(DType::F32, 6).unwrap_err();
        assert!(matches!(err, AttentionError::BackendUnavailable { backend: "cudnn", .. }));
        assert!(FusedAttention.check_available(DType::F32, 264).is_err());
        assert!(FusedAttention.check_available(DType::F64, 64).is_err());
    }

    #[test]
    fn unspecified_falls_to_generic_when_fused_does_not_qualify() {
        let kernel = select_kernel(Implementation::Unspecified, DType::F32, 6).unwrap();
        assert_eq!(kernel.name(), "generic");
        let kernel = select_kernel(Implementation::Unspecified, DType::F32, 16).unwrap();
        assert_eq!(kernel.name(), "cudnn");
        assert!(select_kernel(Implementation::Fused, DType::F32, 6).is_err());
    }

    #[test]
    fn kernels_agree_on_softmax() -> Result<()> {
        let scores = Tensor::new(&[[1.0f32, 2.0, -3.0, 0.5], [100.0, 100.0, 99.0, -1e4]], &Device::Cpu)?;
        let generic = GenericAttention.probabilities(&scores)?;
        let fused = FusedAttention.probabilities(&scores)?;
        let diff = generic.sub(&fused)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        let rows = generic.sum(D::Minus1)?.to_vec1::<f32>()?;
        assert!(rows.iter().all(|s| (s - 1.0).abs() < 1e-6));
        Ok(())
    }
}
