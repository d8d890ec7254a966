//! Llama-style decoder-only language model.
//!
//! [`LlamaForCausalLM`] composes token embeddings, a stack of pre-norm
//! [`DecoderBlock`]s with rotary grouped-query attention, a final RMS norm and
//! an output projection that is either tied to the embedding table or owns a
//! separate `lm_head.kernel`. Forward passes accept a single sequence.
//!
//! Pretrained HF weights are imported with [`convert_weights_from_hf`] (or the
//! [`CheckpointImport`] capability), which consumes `(key, tensor)` pairs once
//! and in order.

pub mod block;
pub mod capabilities;
pub mod config;
pub mod convert;
pub mod error;
pub mod model;

pub use block::DecoderBlock;
pub use capabilities::{CheckpointImport, Generate};
pub use config::{LlamaConfig, ATTENTION_IMPL_ENV};
pub use convert::{convert_weights_from_hf, CheckpointKey, ImportReport};
pub use error::ModelError;
pub use model::{ForwardOptions, LlamaForCausalLM, OutputProjection};
