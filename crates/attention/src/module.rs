//! Multi-head self-attention module.
//!
//! The module owns `q_proj`, `k_proj`, `v_proj` and `o_proj` and delegates the
//! per-head score/weighted-sum computation to an [`AttentionFn`] stored at
//! construction. By default that is a [`DotProductAttentionFn`] that pins the
//! configured [`Implementation`]; [`MultiHeadAttention::with_attention_fn`]
//! swaps in any other strategy verbatim.

use std::fmt;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use embedding::positional::rope::{Rope, RopeConfig};
use layers::linear::{Linear, LinearConfig, LinearInit};
use layers::{ParamStore, PrecisionPolicy, RngKey};

use crate::backend::Implementation;
use crate::error::AttentionError;
use crate::function::{dot_product_attention, AttentionCall};
use crate::heads::{merge_heads, repeat_kv, split_heads};

/// Strategy computing attention from per-head query/key/value tensors.
pub trait AttentionFn: Send + Sync {
    fn attend(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        bias: Option<&Tensor>,
        mask: Option<&Tensor>,
        call: &AttentionCall,
    ) -> Result<Tensor, AttentionError>;
}

impl<F> AttentionFn for F
where
    F: Fn(
            &Tensor,
            &Tensor,
            &Tensor,
            Option<&Tensor>,
            Option<&Tensor>,
            &AttentionCall,
        ) -> Result<Tensor, AttentionError>
        + Send
        + Sync,
{
    fn attend(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        bias: Option<&Tensor>,
        mask: Option<&Tensor>,
        call: &AttentionCall,
    ) -> Result<Tensor, AttentionError> {
        self(query, key, value, bias, mask, call)
    }
}

/// [`dot_product_attention`] with a fixed implementation; every other argument
/// is forwarded unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DotProductAttentionFn {
    implementation: Implementation,
}

impl DotProductAttentionFn {
    pub fn new(implementation: Implementation) -> Self {
        Self { implementation }
    }

    pub fn implementation(&self) -> Implementation {
        self.implementation
    }
}

impl AttentionFn for DotProductAttentionFn {
    fn attend(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        bias: Option<&Tensor>,
        mask: Option<&Tensor>,
        call: &AttentionCall,
    ) -> Result<Tensor, AttentionError> {
        let call = AttentionCall {
            implementation: self.implementation,
            ..*call
        };
        dot_product_attention(query, key, value, bias, mask, &call)
    }
}

/// Hyperparameters of [`MultiHeadAttention`].
#[derive(Debug, Clone, PartialEq)]
pub struct MultiHeadAttentionConfig {
    pub num_heads: usize,
    /// Key/value head count; `None` means one per query head.
    pub num_kv_heads: Option<usize>,
    pub in_features: usize,
    /// Per-head width; defaults to `in_features / num_heads`.
    pub head_dim: Option<usize>,
    /// Output width; defaults to `in_features`.
    pub out_features: Option<usize>,
    pub dropout_rate: f32,
    pub implementation: Implementation,
    pub deterministic: bool,
    pub use_bias: bool,
    /// Rotary encoding applied to queries and keys before attention.
    pub rope_theta: Option<f32>,
}

impl MultiHeadAttentionConfig {
    pub fn new(num_heads: usize, in_features: usize) -> Self {
        Self {
            num_heads,
            num_kv_heads: None,
            in_features,
            head_dim: None,
            out_features: None,
            dropout_rate: 0.0,
            implementation: Implementation::Unspecified,
            deterministic: true,
            use_bias: false,
            rope_theta: None,
        }
    }

    pub fn kv_heads(&self) -> usize {
        self.num_kv_heads.unwrap_or(self.num_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or_else(|| self.in_features / self.num_heads.max(1))
    }

    pub fn out_features(&self) -> usize {
        self.out_features.unwrap_or(self.in_features)
    }

    pub fn validate(&self) -> Result<(), AttentionError> {
        let invalid = |msg: String| Err(AttentionError::InvalidConfig(msg));
        if self.num_heads == 0 || self.kv_heads() == 0 {
            return invalid("head counts must be positive".into());
        }
        if self.head_dim.is_none() && self.in_features % self.num_heads != 0 {
            return invalid(format!(
                "in_features {} is not divisible by num_heads {}",
                self.in_features, self.num_heads
            ));
        }
        if self.head_dim() == 0 {
            return invalid("head_dim must be positive".into());
        }
        if self.num_heads % self.kv_heads() != 0 {
            return invalid(format!(
                "num_heads {} is not a multiple of num_kv_heads {}",
                self.num_heads,
                self.kv_heads()
            ));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(AttentionError::InvalidDropout(self.dropout_rate));
        }
        Ok(())
    }
}

/// Self-attention over `[batch, seq, features]` inputs.
#[derive(Clone)]
pub struct MultiHeadAttention {
    config: MultiHeadAttentionConfig,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    rope: Option<Rope>,
    attention_fn: Arc<dyn AttentionFn>,
    policy: PrecisionPolicy,
}

impl fmt::Debug for MultiHeadAttention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiHeadAttention")
            .field("config", &self.config)
            .field("rope", &self.rope.is_some())
            .finish_non_exhaustive()
    }
}

impl MultiHeadAttention {
    /// Registers `{path}.{q,k,v,o}_proj.kernel` in `store`.
    pub fn new(
        config: MultiHeadAttentionConfig,
        store: &mut ParamStore,
        path: &str,
        init: &LinearInit,
        key: RngKey,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        let head_dim = config.head_dim();
        let q_width = config.num_heads * head_dim;
        let kv_width = config.kv_heads() * head_dim;
        let keys = key.split_n(4);

        let mut projection = |name: &str, in_f: usize, out_f: usize, key: RngKey| {
            Linear::new(
                LinearConfig::new(in_f, out_f).with_bias(config.use_bias),
                store,
                &format!("{path}.{name}"),
                init,
                key,
                device,
                dtype,
            )
        };
        let q_proj = projection("q_proj", config.in_features, q_width, keys[0])?;
        let k_proj = projection("k_proj", config.in_features, kv_width, keys[1])?;
        let v_proj = projection("v_proj", config.in_features, kv_width, keys[2])?;
        let o_proj = projection("o_proj", q_width, config.out_features(), keys[3])?;

        let rope = config
            .rope_theta
            .map(|theta| Rope::new(RopeConfig::new(head_dim, theta), device))
            .transpose()?;

        Ok(Self {
            attention_fn: Arc::new(DotProductAttentionFn::new(config.implementation)),
            config,
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            rope,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    /// Replaces the attention strategy; the configured implementation is then ignored.
    pub fn with_attention_fn(mut self, attention_fn: Arc<dyn AttentionFn>) -> Self {
        self.attention_fn = attention_fn;
        self
    }

    pub fn config(&self) -> &MultiHeadAttentionConfig {
        &self.config
    }

    /// Self-attention without positional encoding input.
    pub fn forward(
        &self,
        hidden: &Tensor,
        mask: Option<&Tensor>,
        rng: Option<RngKey>,
    ) -> Result<Tensor, AttentionError> {
        self.forward_with_positions(hidden, None, None, mask, rng)
    }

    /// Self-attention with explicit position ids for the rotary encoding.
    ///
    /// When the module carries a rotary encoding and `positions` is `None`,
    /// positions `0..seq` are used.
    pub fn forward_with_positions(
        &self,
        hidden: &Tensor,
        positions: Option<&Tensor>,
        bias: Option<&Tensor>,
        mask: Option<&Tensor>,
        rng: Option<RngKey>,
    ) -> Result<Tensor, AttentionError> {
        let (_, seq, features) = hidden.dims3().map_err(|_| {
            AttentionError::shape(format!(
                "attention input must be [batch, seq, features], got {:?}",
                hidden.dims()
            ))
        })?;
        if features != self.config.in_features {
            return Err(AttentionError::shape(format!(
                "attention expected {} input features, got {features}",
                self.config.in_features
            )));
        }

        let head_dim = self.config.head_dim();
        let kv_heads = self.config.kv_heads();
        let q = split_heads(&self.q_proj.forward(hidden, &self.policy)?, self.config.num_heads, head_dim)?;
        let k = split_heads(&self.k_proj.forward(hidden, &self.policy)?, kv_heads, head_dim)?;
        let v = split_heads(&self.v_proj.forward(hidden, &self.policy)?, kv_heads, head_dim)?;

        let (q, k) = match &self.rope {
            Some(rope) => match positions {
                Some(positions) => rope.apply(&q, &k, positions)?,
                None => {
                    let positions = Tensor::arange(0u32, seq as u32, hidden.device())?;
                    rope.apply(&q, &k, &positions)?
                }
            },
            None => (q, k),
        };

        let n_rep = self.config.num_heads / kv_heads;
        let k = repeat_kv(&k, n_rep)?;
        let v = repeat_kv(&v, n_rep)?;

        let call = AttentionCall {
            implementation: self.config.implementation,
            dropout_rate: self.config.dropout_rate,
            deterministic: self.config.deterministic,
            dropout_rng: rng,
        };
        let attended = self.attention_fn.attend(&q, &k, &v, bias, mask, &call)?;
        Ok(self.o_proj.forward(&merge_heads(&attended)?, &self.policy)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::make_causal_mask;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn build(config: MultiHeadAttentionConfig, store: &mut ParamStore) -> Result<MultiHeadAttention, AttentionError> {
        MultiHeadAttention::new(
            config,
            store,
            "attention",
            &LinearInit::XavierUniform,
            RngKey::new(5),
            &Device::Cpu,
            DType::F32,
        )
    }

    fn input() -> candle_core::Result<Tensor> {
        let data: Vec<f32> = (0..3 * 16).map(|i| ((i * 3 % 17) as f32) * 0.1 - 0.8).collect();
        Tensor::from_vec(data, (1, 3, 16), &Device::Cpu)
    }

    #[test]
    fn output_shape_matches_input() -> Result<(), AttentionError> {
        let mut store = ParamStore::new();
        let attention = build(MultiHeadAttentionConfig::new(2, 16), &mut store)?;
        let names: Vec<_> = store.names().collect();
        assert_eq!(
            names,
            vec![
                "attention.k_proj.kernel",
                "attention.o_proj.kernel",
                "attention.q_proj.kernel",
                "attention.v_proj.kernel"
            ]
        );
        let x = input()?;
        let mask = make_causal_mask(&Device::Cpu, 3, 3)?;
        let out = attention.forward(&x, Some(&mask), None)?;
        assert_eq!(out.dims(), x.dims());
        Ok(())
    }

    #[test]
    fn grouped_query_projections_are_narrower() -> Result<(), AttentionError> {
        let mut store = ParamStore::new();
        let mut config = MultiHeadAttentionConfig::new(4, 16);
        config.num_kv_heads = Some(2);
        config.rope_theta = Some(10_000.0);
        let attention = build(config, &mut store)?;
        assert_eq!(store.value("attention.k_proj.kernel")?.dims(), &[16, 8]);
        assert_eq!(store.value("attention.q_proj.kernel")?.dims(), &[16, 16]);
        let out = attention.forward(&input()?, None, None)?;
        assert_eq!(out.dims(), &[1, 3, 16]);
        Ok(())
    }

    #[test]
    fn custom_attention_fn_is_used_verbatim() -> Result<(), AttentionError> {
        let mut store = ParamStore::new();
        let mut config = MultiHeadAttentionConfig::new(2, 16);
        // head_dim 6 cannot run on the fused kernel.
        config.implementation = Implementation::Fused;
        config.head_dim = Some(6);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let custom = move |q: &Tensor,
                           k: &Tensor,
                           v: &Tensor,
                           bias: Option<&Tensor>,
                           mask: Option<&Tensor>,
                           call: &AttentionCall| {
            seen.fetch_add(1, Ordering::SeqCst);
            let generic = AttentionCall {
                implementation: Implementation::Generic,
                ..*call
            };
            dot_product_attention(q, k, v, bias, mask, &generic)
        };

        let attention = build(config, &mut store)?;
        assert!(matches!(
            attention.forward(&input()?, None, None),
            Err(AttentionError::BackendUnavailable { .. })
        ));

        let attention = attention.with_attention_fn(Arc::new(custom));
        let out = attention.forward(&input()?, None, None)?;
        assert_eq!(out.dims(), &[1, 3, 16]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn rejects_indivisible_kv_heads() {
        let mut config = MultiHeadAttentionConfig::new(4, 16);
        config.num_kv_heads = Some(3);
        assert!(matches!(config.validate(), Err(AttentionError::InvalidConfig(_))));
    }
}
