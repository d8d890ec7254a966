//! Model hyperparameters.
//!
//! Field names follow HF `config.json` so a checkpoint's config file can be
//! deserialised directly. Unknown fields are ignored.

use std::{env, fs, path::Path};

use attention::Implementation;
use candle_core::DType;
use layers::{activations::ActivationKind, dtypes::parse_dtype};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Environment variable overriding [`LlamaConfig::attention_implementation`].
pub const ATTENTION_IMPL_ENV: &str = "LLAMA_ATTENTION_IMPL";

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f32 {
    10_000.0
}

fn default_max_position_embeddings() -> usize {
    2048
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

fn default_initializer_range() -> f64 {
    0.02
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlamaConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    /// Key/value heads for grouped-query attention; defaults to `num_attention_heads`.
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    /// Per-head width; defaults to `hidden_size / num_attention_heads`.
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default)]
    pub attention_dropout: f32,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default = "default_initializer_range")]
    pub initializer_range: f64,
    /// Attention backend name (`auto`, `generic`, `cudnn`, `flash`).
    #[serde(default)]
    pub attention_implementation: Option<String>,
    /// Parameter dtype (`float32`, `float16`, `bfloat16`); defaults to `float32`.
    #[serde(default, alias = "torch_dtype")]
    pub dtype: Option<String>,
}

impl LlamaConfig {
    /// Small grouped-query configuration for tests and smoke runs.
    pub fn tiny() -> Self {
        Self {
            vocab_size: 50,
            hidden_size: 32,
            intermediate_size: 64,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            head_dim: None,
            rms_norm_eps: 1e-6,
            rope_theta: default_rope_theta(),
            max_position_embeddings: 128,
            hidden_act: default_hidden_act(),
            attention_dropout: 0.0,
            tie_word_embeddings: false,
            initializer_range: default_initializer_range(),
            attention_implementation: None,
            dtype: None,
        }
    }

    /// Geometry of Llama 3.2 1B. Its `llama3` rope scaling is not modelled.
    pub fn llama_3_2_1b() -> Self {
        Self {
            vocab_size: 128_256,
            hidden_size: 2048,
            intermediate_size: 8192,
            num_hidden_layers: 16,
            num_attention_heads: 32,
            num_key_value_heads: Some(8),
            head_dim: Some(64),
            rms_norm_eps: 1e-5,
            rope_theta: 500_000.0,
            max_position_embeddings: 131_072,
            hidden_act: default_hidden_act(),
            attention_dropout: 0.0,
            tie_word_embeddings: true,
            initializer_range: default_initializer_range(),
            attention_implementation: None,
            dtype: Some("bfloat16".to_string()),
        }
    }

    /// Parses, applies environment overrides and validates.
    pub fn from_json_str(contents: &str) -> Result<Self, ModelError> {
        let mut config: LlamaConfig = serde_json::from_str(contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    /// Applies `LLAMA_ATTENTION_IMPL` when set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = env::var(ATTENTION_IMPL_ENV) {
            log::debug!("{ATTENTION_IMPL_ENV}={value} overrides attention_implementation");
            self.attention_implementation = Some(value);
        }
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or_else(|| self.hidden_size / self.num_attention_heads.max(1))
    }

    pub fn activation(&self) -> Result<ActivationKind, ModelError> {
        self.hidden_act
            .parse()
            .map_err(|err: candle_core::Error| ModelError::config(err.to_string()))
    }

    pub fn implementation(&self) -> Result<Implementation, ModelError> {
        Ok(Implementation::from_name(self.attention_implementation.as_deref())?)
    }

    pub fn candle_dtype(&self) -> Result<DType, ModelError> {
        match self.dtype.as_deref() {
            None => Ok(DType::F32),
            Some(name) => parse_dtype(name).map_err(|err| ModelError::config(err.to_string())),
        }
    }

    /// Checks every structural invariant and reports all violations at once.
    pub fn validate(&self) -> Result<(), ModelError> {
        let mut errors = Vec::new();

        if self.vocab_size == 0 {
            errors.push("vocab_size must be greater than 0".to_string());
        }
        if self.hidden_size == 0 {
            errors.push("hidden_size must be greater than 0".to_string());
        }
        if self.intermediate_size == 0 {
            errors.push("intermediate_size must be greater than 0".to_string());
        }
        if self.num_hidden_layers == 0 {
            errors.push("num_hidden_layers must be greater than 0".to_string());
        }
        if self.num_attention_heads == 0 {
            errors.push("num_attention_heads must be greater than 0".to_string());
        } else {
            if self.head_dim.is_none() && self.hidden_size % self.num_attention_heads != 0 {
                errors.push(format!(
                    "hidden_size ({}) must be divisible by num_attention_heads ({})",
                    self.hidden_size, self.num_attention_heads
                ));
            }
            let kv = self.num_kv_heads();
            if kv == 0 || self.num_attention_heads % kv != 0 {
                errors.push(format!(
                    "num_attention_heads ({}) must be a multiple of num_key_value_heads ({kv})",
                    self.num_attention_heads
                ));
            }
            let head_dim = self.head_dim();
            if head_dim == 0 || head_dim % 2 != 0 {
                errors.push(format!("head_dim ({head_dim}) must be even and non-zero"));
            }
        }
        if self.max_position_embeddings == 0 {
            errors.push("max_position_embeddings must be greater than 0".to_string());
        }
        if !(self.rms_norm_eps > 0.0) {
            errors.push("rms_norm_eps must be positive".to_string());
        }
        if !(self.rope_theta > 0.0) {
            errors.push("rope_theta must be positive".to_string());
        }
        if !(0.0..1.0).contains(&self.attention_dropout) {
            errors.push("attention_dropout must be in [0, 1)".to_string());
        }
        if let Err(err) = self.activation() {
            errors.push(err.to_string());
        }
        if let Err(err) = self.implementation() {
            errors.push(err.to_string());
        }
        if let Err(err) = self.candle_dtype() {
            errors.push(err.to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ModelError::Config(errors))
        }
    }
}
