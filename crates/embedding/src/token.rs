//! Token embedding table with an optional tied readout.

use candle_core::{bail, DType, Device, Error, Result, Tensor, Var};
use layers::{LayerError, ParamStore, PrecisionPolicy, RngKey};

/// Configuration for building a token embedding table.
#[derive(Debug, Clone)]
pub struct TokenEmbeddingConfig {
    /// Size of the vocabulary (number of distinct tokens).
    pub vocab_size: usize,
    /// Dimensionality of each embedding vector.
    pub hidden_dim: usize,
    /// Standard deviation of the `N(0, std^2)` initialiser.
    pub init_std: f64,
    /// Storage dtype used for the underlying parameters and outputs.
    pub dtype: DType,
    /// Device hosting the parameters.
    pub device: Device,
}

/// Learnable `[vocab_size, hidden_dim]` table registered as `{path}.embedding`.
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    config: TokenEmbeddingConfig,
    weight: Var,
    policy: PrecisionPolicy,
}

impl TokenEmbedding {
    pub fn new(
        config: TokenEmbeddingConfig,
        store: &mut ParamStore,
        path: &str,
        key: RngKey,
    ) -> std::result::Result<Self, LayerError> {
        if config.vocab_size == 0 || config.hidden_dim == 0 {
            return Err(Error::Msg(format!(
                "token embedding requires non-zero dims, got vocab_size={} hidden_dim={}",
                config.vocab_size, config.hidden_dim
            ))
            .into());
        }

        let initial = key
            .normal(
                0.0,
                config.init_std as f32,
                (config.vocab_size, config.hidden_dim),
                &config.device,
            )?
            .to_dtype(config.dtype)?;
        let weight = store.register(format!("{path}.embedding"), initial)?;
        let policy = PrecisionPolicy::from_parameter_dtype(config.dtype);

        Ok(Self {
            config,
            weight,
            policy,
        })
    }

    pub fn config(&self) -> &TokenEmbeddingConfig {
        &self.config
    }

    /// Current table value, `[vocab_size, hidden_dim]`.
    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    /// Looks up embeddings for integer token ids shaped `(batch, seq)`.
    ///
    /// Outputs follow the `(batch, seq, hidden)` layout in the storage dtype.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        let (batch, seq) = match token_ids.dims() {
            [batch, seq] if *batch > 0 && *seq > 0 => (*batch, *seq),
            [_, _] => bail!("token_ids must have non-zero batch and seq dimensions"),
            dims => bail!("token_ids must be shaped [batch, seq], got {dims:?}"),
        };
        if !token_ids.dtype().is_int() {
            bail!(
                "token_ids expected integer dtype but received {:?}",
                token_ids.dtype()
            );
        }

        let flat = token_ids.to_dtype(DType::I64)?.flatten_all()?;
        self.ensure_id_range(&flat)?;

        let gathered = self.weight.as_tensor().index_select(&flat, 0)?;
        gathered.reshape((batch, seq, self.config.hidden_dim))
    }

    /// Tied readout: `hidden · tableᵀ`, producing `(batch, seq, vocab_size)` logits.
    pub fn attend(&self, hidden: &Tensor) -> Result<Tensor> {
        let (batch, seq, hidden_dim) = hidden.dims3()?;
        if hidden_dim != self.config.hidden_dim {
            bail!(
                "attend expected hidden dim {} but received {}",
                self.config.hidden_dim,
                hidden_dim
            );
        }

        let input = self.policy.cast_for_matmul(hidden)?;
        let table = self.policy.cast_for_matmul(self.weight.as_tensor())?;
        let logits = input
            .reshape((batch * seq, hidden_dim))?
            .matmul(&table.t()?)?
            .reshape((batch, seq, self.config.vocab_size))?;
        self.policy.cast_to_storage(&logits)
    }

    fn ensure_id_range(&self, flat_ids: &Tensor) -> Result<()> {
        let min_id = flat_ids.min_all()?.to_scalar::<i64>()?;
        if min_id < 0 {
            bail!("encountered negative token id {min_id}");
        }
        let max_id = flat_ids.max_all()?.to_scalar::<i64>()?;
        let vocab = self.config.vocab_size as i64;
        if max_id >= vocab {
            bail!("token id {max_id} exceeds vocab size {vocab}");
        }
        Ok(())
    }
}
