//! Error type for model construction, forward passes and checkpoint import.

use attention::AttentionError;
use layers::LayerError;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {}", .0.join("; "))]
    Config(Vec<String>),
    /// Forward passes are restricted to a single sequence.
    #[error("forward requires batch size 1, got {0}")]
    BatchSize(usize),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Attention(#[from] AttentionError),
    /// Parameter store failures; a checkpoint shape mismatch lands here.
    #[error(transparent)]
    Param(#[from] LayerError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl ModelError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(vec![message.into()])
    }
}
