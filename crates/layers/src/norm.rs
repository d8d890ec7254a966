//! Root-mean-square normalisation.
//!
//! Inputs of any rank are normalised along the last axis:
//! `y = x / sqrt(mean(x^2) + eps) * weight`. There is no mean subtraction and
//! no bias. Statistics are computed in [`PrecisionPolicy::reduction`] and the
//! output is cast back to the storage dtype.

use candle_core::{DType, Device, Result, Tensor, Var, D};

use crate::{checks, dtypes::PrecisionPolicy, params::ParamStore, LayerError};

/// Configuration for [`RmsNorm`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the mean square.
    pub epsilon: f64,
}

impl NormConfig {
    pub fn new(hidden_size: usize, epsilon: f64) -> Self {
        Self {
            hidden_size,
            epsilon,
        }
    }
}

/// RMS normalisation with a learned per-feature scale (`{path}.weight`).
#[derive(Debug, Clone)]
pub struct RmsNorm {
    config: NormConfig,
    weight: Var,
}

impl RmsNorm {
    /// Registers `{path}.weight` initialised to ones.
    pub fn new(
        config: NormConfig,
        store: &mut ParamStore,
        path: &str,
        device: &Device,
        dtype: DType,
    ) -> std::result::Result<Self, LayerError> {
        let ones = Tensor::ones(config.hidden_size, dtype, device)?;
        let weight = store.register(format!("{path}.weight"), ones)?;
        Ok(Self { config, weight })
    }

    /// Wraps an existing weight without registering it.
    pub fn from_weight(config: NormConfig, weight: Var) -> Result<Self> {
        checks::expect_shape("norm.weight", weight.as_tensor(), &[config.hidden_size])?;
        checks::expect_dtype_in("norm.weight", weight.as_tensor(), &checks::FLOAT_DTYPES)?;
        Ok(Self { config, weight })
    }

    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let last = hidden.dims().last().copied().unwrap_or(0);
        if last != self.config.hidden_size {
            candle_core::bail!(
                "rms_norm expected trailing dim {} got {:?}",
                self.config.hidden_size,
                hidden.dims()
            );
        }

        let compute = policy.cast_for_reduction(hidden)?;
        let mean_square = compute.sqr()?.mean_keepdim(D::Minus1)?;
        let denom = (mean_square + self.config.epsilon)?.sqrt()?;
        let normalized = compute.broadcast_div(&denom)?;

        let weight = self.weight.as_tensor().to_dtype(normalized.dtype())?;
        let scaled = normalized.broadcast_mul(&weight)?;
        policy.cast_to_storage(&scaled)
    }
}
