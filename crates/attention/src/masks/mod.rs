//! Boolean masks and additive biases shared by attention implementations.
//!
//! Boolean masks are `u8` tensors where `1` means "attend" and `0` means
//! "block", broadcastable to `[batch, num_heads, q_len, k_len]`. Additive
//! biases are `f32` tensors holding `0.0` for kept positions and
//! [`NEG_SENTINEL`] for blocked ones. A large finite sentinel is used instead of
//! `-inf` so that fully-masked rows soften to a uniform distribution rather than
//! `NaN`.

pub mod bias;
pub mod causal;
pub mod padding;

use candle_core::DType;

/// Dtype of boolean masks.
pub const MASK_DTYPE: DType = DType::U8;

/// Dtype of additive biases.
pub const BIAS_DTYPE: DType = DType::F32;

/// Value written into blocked bias positions.
pub const NEG_SENTINEL: f32 = f32::MIN;

pub use bias::{combine_masks, mask_bias, mask_to_bias};
pub use causal::make_causal_mask;
pub use padding::{make_padding_mask, padding_mask_from_lengths};
