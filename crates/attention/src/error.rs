//! Error types emitted by the attention function and module.

use layers::LayerError;

/// Attention-specific error category.
#[derive(Debug, thiserror::Error)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// The selected backend cannot run on this device / dtype / geometry.
    #[error("attention backend `{backend}` unavailable: {reason}")]
    BackendUnavailable { backend: &'static str, reason: String },
    /// An implementation name that is not one of the accepted spellings.
    #[error("unknown attention implementation `{0}` (expected one of: auto, generic, cudnn, flash)")]
    UnknownBackend(String),
    #[error("dropout rate must be in [0, 1), got {0}")]
    InvalidDropout(f32),
    #[error("invalid attention config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Param(#[from] LayerError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        AttentionError::InvalidShape {
            context: context.into(),
        }
    }
}
