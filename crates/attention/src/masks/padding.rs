//! Builders for padding masks used to drop padded keys.

use candle_core::{bail, Device, Result, Tensor};

/// Converts a `[batch, k_len]` attention mask of ones (valid) and zeros
/// (padding) into a boolean key mask shaped `[batch, 1, 1, k_len]`.
///
/// Any non-zero entry counts as valid, whatever the input dtype.
pub fn make_padding_mask(attention_mask: &Tensor) -> Result<Tensor> {
    let (batch, k_len) = match attention_mask.dims() {
        [batch, k_len] => (*batch, *k_len),
        dims => bail!("attention_mask must be shaped [batch, seq], got {dims:?}"),
    };
    let valid = attention_mask.ne(&attention_mask.zeros_like()?)?;
    valid.reshape((batch, 1, 1, k_len))
}

/// Construct padding masks from per-batch valid key lengths.
pub fn padding_mask_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    k_len: usize,
) -> Result<Tensor> {
    let data: Vec<u8> = key_lengths
        .iter()
        .flat_map(|&valid| (0..k_len).map(move |k| u8::from(k < valid)))
        .collect();
    Tensor::from_vec(data, (key_lengths.len(), 1, 1, k_len), device)
}
