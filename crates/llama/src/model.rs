use std::sync::Arc;

use attention::masks::{combine_masks, make_causal_mask, make_padding_mask, mask_to_bias};
use attention::AttentionFn;
use candle_core::{DType, Device, Tensor};
use embedding::token::{TokenEmbedding, TokenEmbeddingConfig};
use layers::{
    linear::{Linear, LinearConfig, LinearInit},
    norm::{NormConfig, RmsNorm},
    ParamStore, PrecisionPolicy, RngKey,
};

use crate::{block::DecoderBlock, config::LlamaConfig, error::ModelError};

pub(crate) const EMBED_PATH: &str = "embed_tokens";
pub(crate) const EMBED_LEAF: &str = "embed_tokens.embedding";
pub(crate) const NORM_PATH: &str = "norm";
pub(crate) const LM_HEAD_PATH: &str = "lm_head";
pub(crate) const LM_HEAD_LEAF: &str = "lm_head.kernel";

/// How hidden states are projected to vocabulary logits.
#[derive(Debug, Clone)]
pub enum OutputProjection {
    /// Reuses the embedding table transposed; no separate leaf exists.
    Tied,
    /// Separate `lm_head.kernel` shaped `[hidden, vocab]`.
    Untied(Linear),
}

/// Per-call options for [`LlamaForCausalLM::forward`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardOptions {
    /// Randomness for attention dropout; `None` runs deterministically.
    pub dropout_rng: Option<RngKey>,
}

impl ForwardOptions {
    pub fn deterministic() -> Self {
        Self::default()
    }

    pub fn with_dropout(rng: RngKey) -> Self {
        Self {
            dropout_rng: Some(rng),
        }
    }
}

/// Llama-style decoder-only language model.
#[derive(Debug)]
pub struct LlamaForCausalLM {
    config: LlamaConfig,
    device: Device,
    dtype: DType,
    params: ParamStore,
    embed_tokens: TokenEmbedding,
    layers: Vec<DecoderBlock>,
    norm: RmsNorm,
    lm_head: OutputProjection,
    policy: PrecisionPolicy,
}

impl LlamaForCausalLM {
    /// Validates `config` and randomly initialises every leaf from `key`.
    pub fn new(config: LlamaConfig, device: &Device, key: RngKey) -> Result<Self, ModelError> {
        config.validate()?;
        let dtype = config.candle_dtype()?;
        let mut params = ParamStore::new();

        let embed_tokens = TokenEmbedding::new(
            TokenEmbeddingConfig {
                vocab_size: config.vocab_size,
                hidden_dim: config.hidden_size,
                init_std: config.initializer_range,
                dtype,
                device: device.clone(),
            },
            &mut params,
            EMBED_PATH,
            key.fold_in_str(EMBED_PATH),
        )?;

        let layers = (0..config.num_hidden_layers)
            .map(|index| {
                DecoderBlock::new(
                    index,
                    &config,
                    &mut params,
                    key.fold_in_str("layers").fold_in(index as u64),
                    device,
                    dtype,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let norm = RmsNorm::new(
            NormConfig::new(config.hidden_size, config.rms_norm_eps),
            &mut params,
            NORM_PATH,
            device,
            dtype,
        )?;

        let lm_head = if config.tie_word_embeddings {
            OutputProjection::Tied
        } else {
            OutputProjection::Untied(Linear::new(
                LinearConfig::new(config.hidden_size, config.vocab_size),
                &mut params,
                LM_HEAD_PATH,
                &LinearInit::Normal {
                    std: config.initializer_range,
                },
                key.fold_in_str(LM_HEAD_PATH),
                device,
                dtype,
            )?)
        };

        log::info!(
            "built llama model: layers={} hidden={} heads={}/{} vocab={} tied={} params={} dtype={dtype:?}",
            config.num_hidden_layers,
            config.hidden_size,
            config.num_attention_heads,
            config.num_kv_heads(),
            config.vocab_size,
            config.tie_word_embeddings,
            params.len(),
        );

        Ok(Self {
            config,
            device: device.clone(),
            dtype,
            params,
            embed_tokens,
            layers,
            norm,
            lm_head,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    /// Replaces the attention strategy of every layer.
    pub fn with_attention_fn(mut self, attention_fn: Arc<dyn AttentionFn>) -> Self {
        self.layers = self
            .layers
            .into_iter()
            .map(|layer| layer.with_attention_fn(attention_fn.clone()))
            .collect();
        self
    }

    pub fn config(&self) -> &LlamaConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    pub fn is_tied(&self) -> bool {
        matches!(self.lm_head, OutputProjection::Tied)
    }

    /// Effective output kernel, `[hidden, vocab]`.
    pub fn output_kernel(&self) -> Result<Tensor, ModelError> {
        Ok(match &self.lm_head {
            OutputProjection::Tied => self.embedding_kernel()?,
            OutputProjection::Untied(linear) => linear.kernel().clone(),
        })
    }

    /// Embedding table transposed to `[hidden, vocab]`.
    pub(crate) fn embedding_kernel(&self) -> Result<Tensor, ModelError> {
        Ok(self.embed_tokens.weight().t()?.contiguous()?)
    }

    /// Gives the output projection its own leaf initialised to `kernel`.
    pub(crate) fn untie(&mut self, kernel: &Tensor) -> Result<(), ModelError> {
        let kernel = kernel.to_dtype(self.dtype)?.contiguous()?.copy()?;
        let var = self.params.register(LM_HEAD_LEAF, kernel)?;
        let linear = Linear::from_parts(
            LinearConfig::new(self.config.hidden_size, self.config.vocab_size),
            var,
            None,
        )?;
        self.lm_head = OutputProjection::Untied(linear);
        Ok(())
    }

    /// Computes logits `[1, seq, vocab]` for `input_ids` shaped `[1, seq]`.
    ///
    /// `attention_mask` is an optional `[1, seq]` tensor of ones (valid) and
    /// zeros (padding). Batch sizes other than one are rejected.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        options: &ForwardOptions,
    ) -> Result<Tensor, ModelError> {
        let (batch, seq) = input_ids.dims2().map_err(|_| {
            ModelError::InvalidInput(format!(
                "input_ids must be shaped [batch, seq], got {:?}",
                input_ids.dims()
            ))
        })?;
        if batch != 1 {
            return Err(ModelError::BatchSize(batch));
        }
        if seq == 0 {
            return Err(ModelError::InvalidInput("input_ids must not be empty".into()));
        }
        if seq > self.config.max_position_embeddings {
            return Err(ModelError::InvalidInput(format!(
                "sequence length {seq} exceeds max_position_embeddings {}",
                self.config.max_position_embeddings
            )));
        }
        if let Some(mask) = attention_mask {
            if mask.dims() != input_ids.dims() {
                return Err(ModelError::InvalidInput(format!(
                    "attention_mask {:?} must match input_ids {:?}",
                    mask.dims(),
                    input_ids.dims()
                )));
            }
        }

        let positions = Tensor::arange(0u32, seq as u32, &self.device)?;
        let causal = make_causal_mask(&self.device, seq, seq)?;
        let padding = attention_mask.map(make_padding_mask).transpose()?;
        let mask = combine_masks(&[Some(&causal), padding.as_ref()])?.unwrap_or(causal);
        let bias = mask_to_bias(&mask)?;

        let mut hidden = self.embed_tokens.forward(input_ids)?;
        for (index, layer) in self.layers.iter().enumerate() {
            let rng = options.dropout_rng.map(|key| key.fold_in(index as u64));
            hidden = layer.forward(&hidden, &positions, Some(&bias), rng)?;
        }
        let hidden = self.norm.forward(&hidden, &self.policy)?;

        let logits = match &self.lm_head {
            OutputProjection::Tied => self.embed_tokens.attend(&hidden)?,
            OutputProjection::Untied(linear) => linear.forward(&hidden, &self.policy)?,
        };
        Ok(logits)
    }
}
