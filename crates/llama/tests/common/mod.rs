#![allow(dead_code)]

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use llama::{LlamaConfig, LlamaForCausalLM};
use layers::RngKey;

pub fn tiny_model(seed: u64) -> Result<LlamaForCausalLM> {
    Ok(LlamaForCausalLM::new(LlamaConfig::tiny(), &Device::Cpu, RngKey::new(seed))?)
}

pub fn tied_model(seed: u64) -> Result<LlamaForCausalLM> {
    let config = LlamaConfig {
        tie_word_embeddings: true,
        ..LlamaConfig::tiny()
    };
    Ok(LlamaForCausalLM::new(config, &Device::Cpu, RngKey::new(seed))?)
}

/// Re-exports a model's parameters under HF names and orientation.
pub fn hf_checkpoint(model: &LlamaForCausalLM) -> Result<Vec<(String, Tensor)>> {
    let mut entries = Vec::new();
    for (path, tensor) in model.params().snapshot()? {
        let entry = if path == "embed_tokens.embedding" {
            ("model.embed_tokens.weight".to_string(), tensor)
        } else if path == "lm_head.kernel" {
            ("lm_head.weight".to_string(), tensor.t()?.contiguous()?)
        } else if let Some(stem) = path.strip_suffix(".kernel") {
            let stem = stem.replace(".attention.", ".self_attn.");
            (format!("model.{stem}.weight"), tensor.t()?.contiguous()?)
        } else {
            (format!("model.{path}"), tensor)
        };
        entries.push(entry);
    }
    Ok(entries)
}

pub fn ids(values: &[u32]) -> Result<Tensor> {
    Ok(Tensor::new(values, &Device::Cpu)?.unsqueeze(0)?)
}

pub fn mask(values: &[u8]) -> Result<Tensor> {
    Ok(Tensor::new(values, &Device::Cpu)?.unsqueeze(0)?)
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    let a = a.to_dtype(DType::F32)?;
    let b = b.to_dtype(DType::F32)?;
    Ok(a.sub(&b)?.abs()?.max_all()?.to_scalar::<f32>()?)
}
