//! Scaled dot-product attention with backend selection, plus a multi-head
//! self-attention module.
//!
//! Tensors follow the layout `[batch, n_heads, seq_len, head_dim]` inside the
//! attention function and `[batch, seq_len, features]` at the module boundary.
//! Scores and softmax are computed in `f32`; outputs mirror the input dtype.
//!
//! Masks are boolean (`u8`, `1` = attend) and biases are additive `f32`; see
//! [`masks`] for the conversion rules. Causal masking is not implied anywhere
//! and must be folded into the mask by the caller.
//!
//! Dropout is applied only when a rate, an explicit [`layers::RngKey`] and a
//! non-deterministic call are all present.

pub mod backend;
pub mod error;
pub mod function;
pub mod heads;
pub mod kernels;
pub mod masks;
pub mod module;

pub use backend::Implementation;
pub use error::AttentionError;
pub use function::{dot_product_attention, dot_product_attention_weights, AttentionCall};
pub use kernels::{select_kernel, AttentionKernel, FusedAttention, GenericAttention};
pub use module::{AttentionFn, DotProductAttentionFn, MultiHeadAttention, MultiHeadAttentionConfig};
