//! Activation catalogue for gated feed-forward stacks.
//!
//! Activations consume tensors of any layout and return tensors with identical
//! layout. Each implementation promotes inputs to the compute dtype requested
//! by [`PrecisionPolicy`] before evaluating the non-linearity, then casts the
//! result back to the storage dtype.
//!
//! # Built-in formulas
//!
//! * **SiLU / Swish** computes `x * sigmoid(x)` via the fused kernel exposed by
//!   Candle. This is the Llama gate activation.
//! * **GELU** uses the erf form `0.5 * x * (1 + erf(x / sqrt(2)))`.
//! * **GELU (tanh)** is the `gelu_new` approximation used by GPT style models.

use std::str::FromStr;

use candle_core::{Error, Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Identifies a supported non-linearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationKind {
    #[default]
    Silu,
    Gelu,
    GeluTanh,
    Relu,
}

impl ActivationKind {
    /// Applies the activation using the precision rules in `policy`.
    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let compute = policy.cast_for_matmul(input)?;
        let output = match self {
            ActivationKind::Silu => compute.silu()?,
            ActivationKind::Gelu => compute.gelu_erf()?,
            ActivationKind::GeluTanh => compute.gelu()?,
            ActivationKind::Relu => compute.relu()?,
        };
        policy.cast_to_storage(&output)
    }

    /// Canonical HF `hidden_act` spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationKind::Silu => "silu",
            ActivationKind::Gelu => "gelu",
            ActivationKind::GeluTanh => "gelu_new",
            ActivationKind::Relu => "relu",
        }
    }
}

impl FromStr for ActivationKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "silu" | "swish" | "swiglu" => Ok(ActivationKind::Silu),
            "gelu" => Ok(ActivationKind::Gelu),
            "gelu_new" | "gelu_pytorch_tanh" | "gelu_tanh" => Ok(ActivationKind::GeluTanh),
            "relu" => Ok(ActivationKind::Relu),
            other => Err(Error::Msg(format!("unsupported activation `{other}`"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::f64::consts::SQRT_2;

    #[test]
    fn silu_matches_swish_reference() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-3.0f32, -1.0, 0.0, 0.5, 2.0], (5,), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let output = ActivationKind::Silu.forward(&input, &policy)?;

        let one = Tensor::ones_like(&input)?;
        let sigmoid = one.broadcast_div(&(one.clone() + input.affine(-1.0, 0.0)?.exp()?)?)?;
        let reference = input.mul(&sigmoid)?;
        let diff = output.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 5e-6);
        Ok(())
    }

    #[test]
    fn gelu_matches_erf_formula() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-2.5f32, -0.5, 0.0, 1.0, 3.0], (5,), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let output = ActivationKind::Gelu.forward(&input, &policy)?;
        let term = input.affine(1.0 / SQRT_2, 0.0)?.erf()?;
        let reference = input
            .affine(0.5, 0.0)?
            .mul(&(Tensor::ones_like(&term)? + term)?)?;
        let diff = output.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 5e-6);
        Ok(())
    }

    #[test]
    fn parses_hf_spellings() {
        assert_eq!("silu".parse::<ActivationKind>().unwrap(), ActivationKind::Silu);
        assert_eq!(
            "gelu_pytorch_tanh".parse::<ActivationKind>().unwrap(),
            ActivationKind::GeluTanh
        );
        assert!("tanh".parse::<ActivationKind>().is_err());
    }
}
