use std::sync::Arc;

use attention::{AttentionFn, MultiHeadAttention, MultiHeadAttentionConfig};
use candle_core::{DType, Device, Tensor};
use layers::{
    linear::LinearInit,
    mlp::{FeedForward, FeedForwardConfig},
    norm::{NormConfig, RmsNorm},
    ParamStore, PrecisionPolicy, RngKey,
};

use crate::{config::LlamaConfig, error::ModelError};

/// Pre-norm decoder layer registered under `layers.{index}`:
///
/// ```text
/// h   = x + attention(input_layernorm(x), positions, bias)
/// out = h + mlp(post_attention_layernorm(h))
/// ```
#[derive(Debug, Clone)]
pub struct DecoderBlock {
    index: usize,
    input_layernorm: RmsNorm,
    attention: MultiHeadAttention,
    post_attention_layernorm: RmsNorm,
    mlp: FeedForward,
    policy: PrecisionPolicy,
}

impl DecoderBlock {
    pub fn new(
        index: usize,
        config: &LlamaConfig,
        store: &mut ParamStore,
        key: RngKey,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, ModelError> {
        let prefix = format!("layers.{index}");
        let (attn_key, mlp_key) = key.split();
        let init = LinearInit::Normal {
            std: config.initializer_range,
        };
        let norm_config = NormConfig::new(config.hidden_size, config.rms_norm_eps);

        let input_layernorm = RmsNorm::new(
            norm_config.clone(),
            store,
            &format!("{prefix}.input_layernorm"),
            device,
            dtype,
        )?;

        let attention_config = MultiHeadAttentionConfig {
            num_heads: config.num_attention_heads,
            num_kv_heads: Some(config.num_kv_heads()),
            in_features: config.hidden_size,
            head_dim: Some(config.head_dim()),
            out_features: Some(config.hidden_size),
            dropout_rate: config.attention_dropout,
            implementation: config.implementation()?,
            deterministic: false,
            use_bias: false,
            rope_theta: Some(config.rope_theta),
        };
        let attention = MultiHeadAttention::new(
            attention_config,
            store,
            &format!("{prefix}.attention"),
            &init,
            attn_key,
            device,
            dtype,
        )?;

        let post_attention_layernorm = RmsNorm::new(
            norm_config,
            store,
            &format!("{prefix}.post_attention_layernorm"),
            device,
            dtype,
        )?;

        let mlp = FeedForward::new(
            FeedForwardConfig {
                hidden_size: config.hidden_size,
                intermediate_size: config.intermediate_size,
                activation: config.activation()?,
            },
            store,
            &format!("{prefix}.mlp"),
            &init,
            mlp_key,
            device,
            dtype,
        )?;

        Ok(Self {
            index,
            input_layernorm,
            attention,
            post_attention_layernorm,
            mlp,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn with_attention_fn(mut self, attention_fn: Arc<dyn AttentionFn>) -> Self {
        self.attention = self.attention.with_attention_fn(attention_fn);
        self
    }

    /// `rng`, when present, drives attention dropout for this layer.
    pub fn forward(
        &self,
        hidden: &Tensor,
        positions: &Tensor,
        bias: Option<&Tensor>,
        rng: Option<RngKey>,
    ) -> Result<Tensor, ModelError> {
        let normed = self.input_layernorm.forward(hidden, &self.policy)?;
        let attended = self
            .attention
            .forward_with_positions(&normed, Some(positions), bias, None, rng)?;
        let hidden = hidden.add(&attended)?;

        let normed = self.post_attention_layernorm.forward(&hidden, &self.policy)?;
        let mlp_out = self.mlp.forward(&normed, &self.policy)?;
        Ok(hidden.add(&mlp_out)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_leaves_under_layer_prefix() -> Result<(), ModelError> {
        let config = LlamaConfig::tiny();
        let mut store = ParamStore::new();
        let block = DecoderBlock::new(1, &config, &mut store, RngKey::new(0), &Device::Cpu, DType::F32)?;
        let names: Vec<_> = store.names().collect();
        assert_eq!(
            names,
            vec![
                "layers.1.attention.k_proj.kernel",
                "layers.1.attention.o_proj.kernel",
                "layers.1.attention.q_proj.kernel",
                "layers.1.attention.v_proj.kernel",
                "layers.1.input_layernorm.weight",
                "layers.1.mlp.down_proj.kernel",
                "layers.1.mlp.gate_proj.kernel",
                "layers.1.mlp.up_proj.kernel",
                "layers.1.post_attention_layernorm.weight",
            ]
        );
        assert_eq!(store.value("layers.1.attention.k_proj.kernel")?.dims(), &[32, 16]);
        assert_eq!(block.index(), 1);
        Ok(())
    }

    #[test]
    fn zeroed_sublayers_leave_residual_stream_untouched() -> Result<(), ModelError> {
        let config = LlamaConfig::tiny();
        let device = Device::Cpu;
        let mut store = ParamStore::new();
        let block = DecoderBlock::new(0, &config, &mut store, RngKey::new(1), &device, DType::F32)?;
        for path in ["layers.0.attention.o_proj.kernel", "layers.0.mlp.down_proj.kernel"] {
            let zeros = store.value(path)?.zeros_like()?;
            store.assign(path, &zeros)?;
        }

        let hidden = RngKey::new(2).normal(0.0, 1.0, (1, 4, 32), &device)?;
        let positions = Tensor::arange(0u32, 4, &device)?;
        let out = block.forward(&hidden, &positions, None, None)?;
        let diff = out.sub(&hidden)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }
}
