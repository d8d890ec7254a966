//! Head splitting, merging and key/value replication.

use candle_core::{bail, Result, Tensor};

/// `[batch, seq, heads * head_dim]` → `[batch, heads, seq, head_dim]`.
pub fn split_heads(hidden: &Tensor, heads: usize, head_dim: usize) -> Result<Tensor> {
    let (batch, seq, features) = hidden.dims3()?;
    if features != heads * head_dim {
        bail!("cannot split {features} features into {heads} heads of {head_dim}");
    }
    hidden
        .reshape((batch, seq, heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()
}

/// `[batch, heads, seq, head_dim]` → `[batch, seq, heads * head_dim]`.
pub fn merge_heads(hidden: &Tensor) -> Result<Tensor> {
    let (batch, heads, seq, head_dim) = hidden.dims4()?;
    hidden
        .transpose(1, 2)?
        .contiguous()?
        .reshape((batch, seq, heads * head_dim))
}

/// Repeats each key/value head `n_rep` times along the head axis so that head
/// `h` of the output is head `h / n_rep` of the input.
pub fn repeat_kv(hidden: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(hidden.clone());
    }
    let (batch, kv_heads, seq, head_dim) = hidden.dims4()?;
    Tensor::cat(&vec![hidden; n_rep], 2)?.reshape((batch, kv_heads * n_rep, seq, head_dim))
}
