//! Gated position-wise feed-forward block.
//!
//! Hidden states shaped `(batch, seq, hidden)` go through two parallel
//! projections to `intermediate_size`; the activated gate branch multiplies the
//! linear branch elementwise and `down_proj` contracts back to `hidden`:
//! `down_proj(act(gate_proj(x)) * up_proj(x))`.

use candle_core::{DType, Device, Result, Tensor};

use crate::{
    activations::ActivationKind,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
    params::ParamStore,
    rng::RngKey,
    LayerError,
};

/// Configuration for [`FeedForward`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedForwardConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub activation: ActivationKind,
}

/// SwiGLU-style feed-forward network with `gate_proj`, `up_proj` and `down_proj`.
#[derive(Debug, Clone)]
pub struct FeedForward {
    config: FeedForwardConfig,
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl FeedForward {
    pub fn new(
        config: FeedForwardConfig,
        store: &mut ParamStore,
        path: &str,
        init: &LinearInit,
        key: RngKey,
        device: &Device,
        dtype: DType,
    ) -> std::result::Result<Self, LayerError> {
        let keys = key.split_n(3);
        let widen = LinearConfig::new(config.hidden_size, config.intermediate_size);
        let gate_proj = Linear::new(
            widen.clone(),
            store,
            &format!("{path}.gate_proj"),
            init,
            keys[0],
            device,
            dtype,
        )?;
        let up_proj = Linear::new(
            widen,
            store,
            &format!("{path}.up_proj"),
            init,
            keys[1],
            device,
            dtype,
        )?;
        let down_proj = Linear::new(
            LinearConfig::new(config.intermediate_size, config.hidden_size),
            store,
            &format!("{path}.down_proj"),
            init,
            keys[2],
            device,
            dtype,
        )?;
        Ok(Self {
            config,
            gate_proj,
            up_proj,
            down_proj,
        })
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let gate = self.gate_proj.forward(hidden, policy)?;
        let gate = self.config.activation.forward(&gate, policy)?;
        let up = self.up_proj.forward(hidden, policy)?;
        let gated = policy.cast_for_matmul(&gate)?.mul(&policy.cast_for_matmul(&up)?)?;
        self.down_proj.forward(&gated, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gated_forward_matches_manual_composition() -> std::result::Result<(), LayerError> {
        let device = Device::Cpu;
        let mut store = ParamStore::new();
        let config = FeedForwardConfig {
            hidden_size: 2,
            intermediate_size: 3,
            activation: ActivationKind::Silu,
        };
        let ff = FeedForward::new(
            config,
            &mut store,
            "mlp",
            &LinearInit::XavierUniform,
            RngKey::new(4),
            &device,
            DType::F32,
        )?;
        let names: Vec<_> = store.names().collect();
        assert_eq!(
            names,
            vec!["mlp.down_proj.kernel", "mlp.gate_proj.kernel", "mlp.up_proj.kernel"]
        );

        let x = Tensor::from_vec(vec![0.5f32, -1.0, 2.0, 0.25], (1, 2, 2), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let out = ff.forward(&x, &policy)?;
        assert_eq!(out.dims(), &[1, 2, 2]);

        let flat = x.reshape((2, 2))?;
        let gate = flat.matmul(&store.value("mlp.gate_proj.kernel")?)?.silu()?;
        let up = flat.matmul(&store.value("mlp.up_proj.kernel")?)?;
        let expected = gate
            .mul(&up)?
            .matmul(&store.value("mlp.down_proj.kernel")?)?
            .reshape((1, 2, 2))?;
        let diff = out
            .sub(&expected)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }
}
