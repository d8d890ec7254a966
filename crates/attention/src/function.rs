//! Scaled dot-product attention.
//!
//! Inputs are laid out `[batch, heads, len, head_dim]`; the key/value head
//! count must already match the query head count (see
//! [`repeat_kv`](crate::heads::repeat_kv)). Scores, softmax and the weighted
//! sum run in `f32` and the output is cast back to the query dtype.
//!
//! Mask/bias policy:
//! * mask only: converted to an additive bias (`0` / [`NEG_SENTINEL`]);
//! * bias and mask: the mask forces blocked positions of the bias to the sentinel;
//! * bias only: added as-is.
//!
//! Causality is never implied; callers fold it into the mask.
//!
//! [`NEG_SENTINEL`]: crate::masks::NEG_SENTINEL

use candle_core::{DType, Tensor};
use layers::{checks::FLOAT_DTYPES, RngKey};

use crate::backend::Implementation;
use crate::error::AttentionError;
use crate::kernels::select_kernel;
use crate::masks::{mask_bias, mask_to_bias, BIAS_DTYPE};

/// Per-call knobs forwarded to the attention function.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AttentionCall {
    pub implementation: Implementation,
    /// Probability of zeroing an attention weight.
    pub dropout_rate: f32,
    /// Disables dropout when set.
    pub deterministic: bool,
    /// Randomness for dropout; without it no dropout is applied.
    pub dropout_rng: Option<RngKey>,
}

impl AttentionCall {
    pub fn new(implementation: Implementation) -> Self {
        Self {
            implementation,
            ..Self::default()
        }
    }

    pub fn with_dropout(mut self, rate: f32, rng: Option<RngKey>) -> Self {
        self.dropout_rate = rate;
        self.dropout_rng = rng;
        self
    }

    pub fn deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }

    fn dropout_key(&self) -> Result<Option<RngKey>, AttentionError> {
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(AttentionError::InvalidDropout(self.dropout_rate));
        }
        if self.deterministic || self.dropout_rate == 0.0 {
            return Ok(None);
        }
        if self.dropout_rng.is_none() {
            log::debug!(
                "dropout rate {} requested without an rng; skipping dropout",
                self.dropout_rate
            );
        }
        Ok(self.dropout_rng)
    }
}

#[derive(Debug, Clone, Copy)]
struct Geometry {
    batch: usize,
    heads: usize,
    q_len: usize,
    k_len: usize,
    head_dim: usize,
}

fn dims4(name: &str, tensor: &Tensor) -> Result<(usize, usize, usize, usize), AttentionError> {
    tensor.dims4().map_err(|_| {
        AttentionError::shape(format!(
            "{name} must have shape [batch, heads, len, head_dim], got {:?}",
            tensor.dims()
        ))
    })
}

fn validate(q: &Tensor, k: &Tensor, v: Option<&Tensor>) -> Result<Geometry, AttentionError> {
    let (batch, heads, q_len, head_dim) = dims4("query", q)?;
    let (kb, kh, k_len, kd) = dims4("key", k)?;
    if (kb, kh, kd) != (batch, heads, head_dim) {
        return Err(AttentionError::shape(format!(
            "key shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
        )));
    }
    if k.dtype() != q.dtype() {
        return Err(AttentionError::shape("query and key must share the same dtype"));
    }
    if let Some(v) = v {
        let (vb, vh, vk, vd) = dims4("value", v)?;
        if (vb, vh, vk) != (batch, heads, k_len) {
            return Err(AttentionError::shape(format!(
                "value shape mismatch: expected [{batch}, {heads}, {k_len}, ?] got [{vb}, {vh}, {vk}, {vd}]"
            )));
        }
        if v.dtype() != q.dtype() {
            return Err(AttentionError::shape("query and value must share the same dtype"));
        }
    }
    if !FLOAT_DTYPES.contains(&q.dtype()) {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("{:?}", q.dtype()),
        });
    }
    Ok(Geometry {
        batch,
        heads,
        q_len,
        k_len,
        head_dim,
    })
}

fn resolve_bias(
    bias: Option<&Tensor>,
    mask: Option<&Tensor>,
    geometry: Geometry,
) -> Result<Option<Tensor>, AttentionError> {
    let combined = match (bias, mask) {
        (None, None) => return Ok(None),
        (None, Some(mask)) => mask_to_bias(mask),
        (Some(bias), Some(mask)) => mask_bias(bias, mask),
        (Some(bias), None) => bias.to_dtype(BIAS_DTYPE),
    }
    .map_err(|err| AttentionError::shape(format!("mask/bias: {err}")))?;

    let target = (geometry.batch, geometry.heads, geometry.q_len, geometry.k_len);
    let broadcast = combined.broadcast_as(target).map_err(|_| {
        AttentionError::shape(format!(
            "mask/bias {:?} is not broadcastable to {:?}",
            combined.dims(),
            [geometry.batch, geometry.heads, geometry.q_len, geometry.k_len]
        ))
    })?;
    Ok(Some(broadcast))
}

/// Attention probabilities `softmax(q·kᵀ/sqrt(d) + bias)` in `f32`, with
/// dropout applied when `call` enables it.
pub fn dot_product_attention_weights(
    query: &Tensor,
    key: &Tensor,
    bias: Option<&Tensor>,
    mask: Option<&Tensor>,
    call: &AttentionCall,
) -> Result<Tensor, AttentionError> {
    let geometry = validate(query, key, None)?;
    weights(query, key, bias, mask, call, geometry)
}

fn weights(
    query: &Tensor,
    key: &Tensor,
    bias: Option<&Tensor>,
    mask: Option<&Tensor>,
    call: &AttentionCall,
    geometry: Geometry,
) -> Result<Tensor, AttentionError> {
    let kernel = select_kernel(call.implementation, query.dtype(), geometry.head_dim)?;
    let dropout_key = call.dropout_key()?;

    let q = query.to_dtype(DType::F32)?.contiguous()?;
    let k = key.to_dtype(DType::F32)?.contiguous()?;
    let scale = 1.0 / (geometry.head_dim as f64).sqrt();
    let mut scores = (q.matmul(&k.t()?)? * scale)?;
    if let Some(bias) = resolve_bias(bias, mask, geometry)? {
        scores = scores.add(&bias)?;
    }

    let mut probs = kernel.probabilities(&scores)?;
    if let Some(key) = dropout_key {
        let keep_prob = 1.0 - call.dropout_rate;
        let keep = key.keep_mask(keep_prob, probs.shape(), probs.device())?;
        probs = (probs.mul(&keep)? / keep_prob as f64)?;
    }
    Ok(probs)
}

/// `softmax(q·kᵀ/sqrt(d) + bias)·v`, shaped like the query and in its dtype.
///
/// An explicit [`Implementation::Fused`] request that the inputs do not
/// qualify for fails with [`AttentionError::BackendUnavailable`].
pub fn dot_product_attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    bias: Option<&Tensor>,
    mask: Option<&Tensor>,
    call: &AttentionCall,
) -> Result<Tensor, AttentionError> {
    let geometry = validate(query, key, Some(value))?;
    let probs = weights(query, key, bias, mask, call, geometry)?;
    let v = value.to_dtype(DType::F32)?.contiguous()?;
    let output = probs.matmul(&v)?;
    Ok(output.to_dtype(query.dtype())?)
}
