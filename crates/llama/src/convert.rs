//! Import of HF-layout Llama checkpoints.
//!
//! Checkpoint keys look like `model.layers.3.self_attn.q_proj.weight` and
//! projection matrices are stored `[out, in]`. Internal kernels are `[in, out]`,
//! so projections are transposed on the way in while norm vectors are copied
//! unchanged. Keys the model has no leaf for are skipped with a warning.

use candle_core::{DType, Tensor};
use layers::LayerError;

use crate::{
    error::ModelError,
    model::{LlamaForCausalLM, EMBED_LEAF, LM_HEAD_LEAF},
};

const FINAL_NORM_LEAF: &str = "norm.weight";

/// Where a checkpoint key lands in the parameter store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointKey {
    /// A per-layer leaf; `transpose` is set for projection matrices.
    Layer {
        index: usize,
        target: String,
        transpose: bool,
    },
    Embedding,
    FinalNorm,
    LmHead,
    Unrecognized,
}

impl CheckpointKey {
    /// Maps a dotted checkpoint key, with or without the leading `model.`.
    pub fn parse(key: &str) -> Self {
        let key = key.strip_prefix("model.").unwrap_or(key);
        let segments: Vec<&str> = key.split('.').collect();
        match segments.as_slice() {
            ["layers", index, rest @ ..] => match index.parse::<usize>() {
                Ok(index) => Self::parse_layer(index, rest),
                Err(_) => Self::Unrecognized,
            },
            ["embed_tokens", "weight"] => Self::Embedding,
            ["norm", "weight"] => Self::FinalNorm,
            ["lm_head", "weight"] => Self::LmHead,
            _ => Self::Unrecognized,
        }
    }

    fn parse_layer(index: usize, rest: &[&str]) -> Self {
        match rest {
            [component @ ("self_attn" | "mlp"), projection, "weight"] => {
                let component = if *component == "self_attn" {
                    "attention"
                } else {
                    component
                };
                Self::Layer {
                    index,
                    target: format!("layers.{index}.{component}.{projection}.kernel"),
                    transpose: true,
                }
            }
            [norm, "weight"] => Self::Layer {
                index,
                target: format!("layers.{index}.{norm}.weight"),
                transpose: false,
            },
            _ => Self::Unrecognized,
        }
    }

    /// Internal leaf path, if the key maps onto one directly.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Layer { target, .. } => Some(target),
            Self::Embedding => Some(EMBED_LEAF),
            Self::FinalNorm => Some(FINAL_NORM_LEAF),
            Self::LmHead => Some(LM_HEAD_LEAF),
            Self::Unrecognized => None,
        }
    }
}

/// Outcome of [`convert_weights_from_hf`], in checkpoint order except that
/// `lm_head` is always reported last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub assigned: Vec<String>,
    pub skipped: Vec<String>,
    /// `lm_head` keys that replaced a different value tied from `embed_tokens`.
    pub tie_overrides: Vec<String>,
}

impl ImportReport {
    fn skip(&mut self, key: String, reason: &str) {
        log::warn!("skipping checkpoint key {key}: {reason}");
        self.skipped.push(key);
    }
}

/// Streams `(key, tensor)` pairs into `model`'s parameter store.
///
/// `lm_head` is resolved after the stream ends, against the final embedding,
/// so the outcome does not depend on key order. Any shape mismatch aborts the
/// import with [`LayerError::ShapeMismatch`]; leaves written before the failure
/// keep their new values.
pub fn convert_weights_from_hf<I>(
    model: &mut LlamaForCausalLM,
    weights: I,
) -> Result<ImportReport, ModelError>
where
    I: IntoIterator<Item = (String, Tensor)>,
{
    let mut report = ImportReport::default();
    let mut embedding_seen = false;
    let mut pending_lm_head: Option<(String, Tensor)> = None;

    for (key, tensor) in weights {
        let mapped = CheckpointKey::parse(&key);
        match &mapped {
            CheckpointKey::Layer {
                target, transpose, ..
            } => {
                if !model.params().contains(target) {
                    report.skip(key, "model has no matching parameter");
                    continue;
                }
                let value = if *transpose { tensor.t()? } else { tensor };
                model.params().assign(target, &value)?;
                log::debug!("{key} -> {target}");
            }
            CheckpointKey::Embedding => {
                model.params().assign(EMBED_LEAF, &tensor)?;
                embedding_seen = true;
                if model.is_tied() {
                    log::debug!("{key} -> {EMBED_LEAF}");
                } else {
                    model.params().assign(LM_HEAD_LEAF, &tensor.t()?)?;
                    log::debug!("{key} -> {EMBED_LEAF}, {LM_HEAD_LEAF} (tied)");
                }
            }
            CheckpointKey::FinalNorm => {
                model.params().assign(FINAL_NORM_LEAF, &tensor)?;
                log::debug!("{key} -> {FINAL_NORM_LEAF}");
            }
            CheckpointKey::LmHead => {
                let kernel = tensor.t()?;
                let expected = [model.config().hidden_size, model.config().vocab_size];
                if kernel.dims() != expected {
                    return Err(LayerError::ShapeMismatch {
                        path: LM_HEAD_LEAF.to_string(),
                        expected: expected.to_vec(),
                        actual: kernel.dims().to_vec(),
                    }
                    .into());
                }
                pending_lm_head = Some((key, kernel));
                continue;
            }
            CheckpointKey::Unrecognized => {
                report.skip(key, "unrecognized key");
                continue;
            }
        }
        report.assigned.push(key);
    }

    if let Some((key, kernel)) = pending_lm_head {
        let differs = tensors_differ(&model.embedding_kernel()?, &kernel)?;
        if differs && embedding_seen {
            log::warn!("{key} disagrees with the tied embedding; using the checkpoint value");
            report.tie_overrides.push(key.clone());
        }
        if !model.is_tied() {
            model.params().assign(LM_HEAD_LEAF, &kernel)?;
            log::debug!("{key} -> {LM_HEAD_LEAF}");
        } else if differs {
            model.untie(&kernel)?;
            log::debug!("{key} -> {LM_HEAD_LEAF} (untied)");
        } else {
            log::debug!("{key} matches the embedding; output stays tied");
        }
        report.assigned.push(key);
    }

    log::info!(
        "checkpoint import: {} assigned, {} skipped, {} tie overrides",
        report.assigned.len(),
        report.skipped.len(),
        report.tie_overrides.len()
    );
    Ok(report)
}

fn tensors_differ(a: &Tensor, b: &Tensor) -> candle_core::Result<bool> {
    let a = a.to_dtype(DType::F32)?;
    let b = b.to_dtype(DType::F32)?;
    let max = a.sub(&b)?.abs()?.max_all()?.to_scalar::<f32>()?;
    Ok(max > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_attention_projections_with_transpose() {
        assert_eq!(
            CheckpointKey::parse("model.layers.3.self_attn.q_proj.weight"),
            CheckpointKey::Layer {
                index: 3,
                target: "layers.3.attention.q_proj.kernel".into(),
                transpose: true,
            }
        );
        assert_eq!(
            CheckpointKey::parse("layers.0.mlp.down_proj.weight").target(),
            Some("layers.0.mlp.down_proj.kernel")
        );
    }

    #[test]
    fn maps_norms_without_transpose() {
        assert_eq!(
            CheckpointKey::parse("model.layers.1.post_attention_layernorm.weight"),
            CheckpointKey::Layer {
                index: 1,
                target: "layers.1.post_attention_layernorm.weight".into(),
                transpose: false,
            }
        );
        assert_eq!(CheckpointKey::parse("model.norm.weight"), CheckpointKey::FinalNorm);
    }

    #[test]
    fn top_level_keys() {
        assert_eq!(CheckpointKey::parse("model.embed_tokens.weight"), CheckpointKey::Embedding);
        assert_eq!(CheckpointKey::parse("lm_head.weight"), CheckpointKey::LmHead);
        assert_eq!(CheckpointKey::LmHead.target(), Some("lm_head.kernel"));
    }

    #[test]
    fn unknown_shapes_of_keys_are_unrecognized() {
        for key in [
            "model.vision_tower.weight",
            "model.layers.x.self_attn.q_proj.weight",
            "model.layers.0.self_attn.q_proj.bias.extra",
            "model.embed_tokens.scale",
            "",
        ] {
            assert_eq!(CheckpointKey::parse(key), CheckpointKey::Unrecognized, "{key}");
        }
    }
}
