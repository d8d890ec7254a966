//! Conversions between boolean masks and additive biases.

use candle_core::{bail, Result, Tensor};

use super::{BIAS_DTYPE, MASK_DTYPE, NEG_SENTINEL};

fn ensure_mask(mask: &Tensor) -> Result<()> {
    if mask.dtype() != MASK_DTYPE {
        bail!(
            "boolean masks must have dtype {MASK_DTYPE:?}, got {:?}",
            mask.dtype()
        );
    }
    Ok(())
}

/// Logical AND of every present mask, broadcasting their shapes.
///
/// Returns `None` when no mask is supplied.
pub fn combine_masks(masks: &[Option<&Tensor>]) -> Result<Option<Tensor>> {
    let mut combined: Option<Tensor> = None;
    for mask in masks.iter().flatten() {
        ensure_mask(mask)?;
        combined = Some(match combined {
            None => (*mask).clone(),
            Some(acc) => acc.broadcast_mul(mask)?,
        });
    }
    Ok(combined)
}

/// `0.0` where `mask` is set, [`NEG_SENTINEL`] elsewhere.
pub fn mask_to_bias(mask: &Tensor) -> Result<Tensor> {
    ensure_mask(mask)?;
    let keep = Tensor::zeros(mask.shape(), BIAS_DTYPE, mask.device())?;
    let block = Tensor::full(NEG_SENTINEL, mask.shape(), mask.device())?;
    mask.where_cond(&keep, &block)
}

/// Forces `bias` to [`NEG_SENTINEL`] wherever `mask` is unset.
///
/// Kept positions retain the supplied bias value. The result has the
/// broadcast shape of both inputs.
pub fn mask_bias(bias: &Tensor, mask: &Tensor) -> Result<Tensor> {
    ensure_mask(mask)?;
    let shape = bias
        .shape()
        .broadcast_shape_binary_op(mask.shape(), "mask_bias")?;
    let bias = bias.to_dtype(BIAS_DTYPE)?.broadcast_as(&shape)?.contiguous()?;
    let mask = mask.broadcast_as(&shape)?.contiguous()?;
    let block = Tensor::full(NEG_SENTINEL, &shape, bias.device())?;
    mask.where_cond(&bias, &block)
}
