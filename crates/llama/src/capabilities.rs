//! Capabilities the causal language model exposes to callers.

use candle_core::{DType, Tensor};

use crate::{
    convert::{self, ImportReport},
    error::ModelError,
    model::{ForwardOptions, LlamaForCausalLM},
};

/// Accepts a stream of externally named tensors and writes them into the
/// parameter store.
pub trait CheckpointImport {
    fn convert_weights_from_hf<I>(&mut self, weights: I) -> Result<ImportReport, ModelError>
    where
        I: IntoIterator<Item = (String, Tensor)>;
}

/// Produces logits for the token following a prompt.
pub trait Generate {
    /// `f32` logits `[vocab]` for the position after `input_ids`.
    fn next_token_logits(&self, input_ids: &[u32]) -> Result<Tensor, ModelError>;

    /// Highest scoring next token.
    fn greedy_next_token(&self, input_ids: &[u32]) -> Result<u32, ModelError> {
        let logits = self.next_token_logits(input_ids)?;
        Ok(logits.argmax(0)?.to_scalar::<u32>()?)
    }
}

impl CheckpointImport for LlamaForCausalLM {
    fn convert_weights_from_hf<I>(&mut self, weights: I) -> Result<ImportReport, ModelError>
    where
        I: IntoIterator<Item = (String, Tensor)>,
    {
        convert::convert_weights_from_hf(self, weights)
    }
}

impl Generate for LlamaForCausalLM {
    fn next_token_logits(&self, input_ids: &[u32]) -> Result<Tensor, ModelError> {
        if input_ids.is_empty() {
            return Err(ModelError::InvalidInput("prompt must not be empty".into()));
        }
        let ids = Tensor::new(input_ids, self.device())?.unsqueeze(0)?;
        let logits = self.forward(&ids, None, &ForwardOptions::deterministic())?;
        let last = logits.get(0)?.get(input_ids.len() - 1)?;
        Ok(last.to_dtype(DType::F32)?)
    }
}
