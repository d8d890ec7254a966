//! Dense projections.
//!
//! Kernels are stored `[in_features, out_features]` so that the forward pass is
//! a plain `x · kernel`. Checkpoints that ship `[out, in]` matrices must be
//! transposed before assignment. Inputs may be `(batch, seq, in)` or
//! `(rows, in)`; outputs keep the leading dimensions. Matmuls run in
//! [`PrecisionPolicy::compute`] and results are cast back to storage.

use candle_core::{DType, Device, Error, Result, Tensor, Var};

use crate::{checks, dtypes::PrecisionPolicy, params::ParamStore, rng::RngKey, LayerError};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    pub in_features: usize,
    pub out_features: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Bias-free projection, as used throughout Llama.
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self {
            in_features,
            out_features,
            bias: false,
        }
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }
}

/// Supported kernel initialisation policies.
#[derive(Debug, Clone, PartialEq)]
pub enum LinearInit {
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Xavier/Glorot normal initialisation.
    XavierNormal,
    /// Zero-mean normal with a fixed standard deviation (HF `initializer_range`).
    Normal { std: f64 },
    /// Kaiming/He uniform initialisation.
    KaimingUniform { negative_slope: f64 },
}

impl LinearInit {
    /// Samples a `[in, out]` kernel in `f32` and casts it to `dtype`.
    pub fn sample(
        &self,
        shape: (usize, usize),
        key: RngKey,
        device: &Device,
        dtype: DType,
    ) -> Result<Tensor> {
        let (fan_in, fan_out) = (shape.0 as f64, shape.1 as f64);
        let kernel = match self {
            LinearInit::XavierUniform => {
                let bound = (6.0 / (fan_in + fan_out)).sqrt() as f32;
                key.uniform(-bound, bound, shape, device)?
            }
            LinearInit::XavierNormal => {
                let std = (2.0 / (fan_in + fan_out)).sqrt() as f32;
                key.normal(0.0, std, shape, device)?
            }
            LinearInit::Normal { std } => key.normal(0.0, *std as f32, shape, device)?,
            LinearInit::KaimingUniform { negative_slope } => {
                let gain = (2.0 / (1.0 + negative_slope.powi(2))).sqrt();
                let bound = (3.0f64.sqrt() * gain / fan_in.sqrt()) as f32;
                key.uniform(-bound, bound, shape, device)?
            }
        };
        if dtype == DType::F32 {
            Ok(kernel)
        } else {
            kernel.to_dtype(dtype)
        }
    }
}

/// Dense affine projection whose parameters live in a [`ParamStore`].
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    kernel: Var,
    bias: Option<Var>,
}

impl Linear {
    /// Registers `{path}.kernel` (and `{path}.bias`) initialised with `init`.
    pub fn new(
        config: LinearConfig,
        store: &mut ParamStore,
        path: &str,
        init: &LinearInit,
        key: RngKey,
        device: &Device,
        dtype: DType,
    ) -> std::result::Result<Self, LayerError> {
        let kernel = init.sample(
            (config.in_features, config.out_features),
            key,
            device,
            dtype,
        )?;
        let kernel = store.register(format!("{path}.kernel"), kernel)?;
        let bias = if config.bias {
            let zeros = Tensor::zeros(config.out_features, dtype, device)?;
            Some(store.register(format!("{path}.bias"), zeros)?)
        } else {
            None
        };
        Ok(Self {
            config,
            kernel,
            bias,
        })
    }

    /// Wraps existing parameters without registering them anywhere.
    pub fn from_parts(config: LinearConfig, kernel: Var, bias: Option<Var>) -> Result<Self> {
        checks::expect_shape(
            "linear.kernel",
            kernel.as_tensor(),
            &[config.in_features, config.out_features],
        )?;
        checks::expect_dtype_in("linear.kernel", kernel.as_tensor(), &checks::FLOAT_DTYPES)?;
        match (config.bias, &bias) {
            (true, Some(b)) => checks::expect_shape("linear.bias", b.as_tensor(), &[config.out_features])?,
            (false, Some(_)) => return Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => return Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => {}
        }
        Ok(Self {
            config,
            kernel,
            bias,
        })
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// Current kernel value, `[in, out]`.
    pub fn kernel(&self) -> &Tensor {
        self.kernel.as_tensor()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref().map(Var::as_tensor)
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let input = policy.cast_for_matmul(hidden)?;
        let kernel = policy.cast_for_matmul(self.kernel.as_tensor())?;

        let mut output = match input.dims() {
            [batch, seq, in_dim] if *in_dim == self.config.in_features => {
                let flat = input.reshape((batch * seq, *in_dim))?;
                flat.matmul(&kernel)?
                    .reshape((*batch, *seq, self.config.out_features))?
            }
            [_, in_dim] if *in_dim == self.config.in_features => input.matmul(&kernel)?,
            dims => {
                return Err(Error::Msg(format!(
                    "linear expects input shaped [B, T, {0}] or [T, {0}], got {dims:?}",
                    self.config.in_features
                )))
            }
        };

        if let Some(bias) = &self.bias {
            let bias = policy.cast_for_matmul(bias.as_tensor())?;
            output = output.broadcast_add(&bias)?;
        }

        policy.cast_to_storage(&output)
    }
}
