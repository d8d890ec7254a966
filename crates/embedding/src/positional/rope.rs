//! Rotary positional embedding.
//!
//! Uses the non-interleaved "rotate-half" layout of HF Llama checkpoints: the
//! rotated slice of every head is split into two contiguous halves `(x1, x2)`
//! and mapped to `x * cos + concat(-x2, x1) * sin`, where the angle tables
//! repeat `pos * inv_freq` across both halves.

use candle_core::{bail, DType, Device, Result, Tensor, D};

/// Configuration for building rotary positional embeddings.
#[derive(Debug, Clone, PartialEq)]
pub struct RopeConfig {
    /// Per-head dimensionality of the representations being rotated.
    pub head_dim: usize,
    /// Base angle parameter θ controlling the frequency spectrum.
    pub rope_theta: f32,
    /// Optional override for how many leading dimensions to rotate; `None` rotates the full head.
    pub rotate_dim: Option<usize>,
}

impl Default for RopeConfig {
    fn default() -> Self {
        Self {
            head_dim: 0,
            rope_theta: 10_000.0,
            rotate_dim: None,
        }
    }
}

impl RopeConfig {
    pub fn new(head_dim: usize, rope_theta: f32) -> Self {
        Self {
            head_dim,
            rope_theta,
            rotate_dim: None,
        }
    }

    pub fn effective_rotate_dim(&self) -> usize {
        self.rotate_dim.unwrap_or(self.head_dim)
    }
}

/// Precomputed inverse frequencies for one head geometry.
#[derive(Debug, Clone)]
pub struct Rope {
    config: RopeConfig,
    inv_freq: Tensor,
}

impl Rope {
    pub fn new(config: RopeConfig, device: &Device) -> Result<Self> {
        let rotate_dim = config.effective_rotate_dim();
        if rotate_dim < 2 || rotate_dim % 2 != 0 {
            bail!("rotate_dim must be even and at least 2, got {rotate_dim}");
        }
        if rotate_dim > config.head_dim {
            bail!(
                "invalid rotate_dim {} for head_dim {}",
                rotate_dim,
                config.head_dim
            );
        }
        if !(config.rope_theta > 0.0) {
            bail!("rope_theta must be positive, got {}", config.rope_theta);
        }

        let base = config.rope_theta as f64;
        let inv_freq: Vec<f32> = (0..rotate_dim / 2)
            .map(|idx| base.powf(-((2 * idx) as f64) / rotate_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, rotate_dim / 2, device)?;
        log::debug!(
            "rope tables: head_dim={} rotate_dim={} theta={}",
            config.head_dim,
            rotate_dim,
            config.rope_theta
        );
        Ok(Self { config, inv_freq })
    }

    pub fn config(&self) -> &RopeConfig {
        &self.config
    }

    /// Builds `(sin, cos)` tables for explicit position ids.
    ///
    /// `positions` is an integer tensor shaped `[seq]` or `[batch, seq]`. The
    /// returned f32 tables are shaped `[batch, 1, seq, rotate_dim]` (batch is 1
    /// for rank-1 positions) so they broadcast over heads.
    pub fn sin_cos(&self, positions: &Tensor) -> Result<(Tensor, Tensor)> {
        if !positions.dtype().is_int() {
            bail!(
                "positions expected integer dtype but received {:?}",
                positions.dtype()
            );
        }
        let positions = match positions.rank() {
            1 => positions.unsqueeze(0)?,
            2 => positions.clone(),
            rank => bail!("positions must be rank 1 or 2, got rank {rank}"),
        };
        let (batch, seq) = positions.dims2()?;
        let half = self.inv_freq.dims1()?;

        let positions = positions.to_dtype(DType::F32)?.unsqueeze(D::Minus1)?;
        let inv_freq = self.inv_freq.reshape((1, 1, half))?;
        let freqs = positions.broadcast_mul(&inv_freq)?;
        let angles = Tensor::cat(&[&freqs, &freqs], D::Minus1)?.reshape((
            batch,
            1,
            seq,
            2 * half,
        ))?;
        Ok((angles.sin()?, angles.cos()?))
    }

    /// Rotates query and key tensors shaped `[batch, heads, seq, head_dim]`.
    ///
    /// Query and key may carry different head counts (grouped-query attention).
    /// Outputs mirror the dtype of the inputs; the rotation runs in f32.
    pub fn apply(&self, q: &Tensor, k: &Tensor, positions: &Tensor) -> Result<(Tensor, Tensor)> {
        let (sin, cos) = self.sin_cos(positions)?;
        Ok((self.rotate(q, &sin, &cos)?, self.rotate(k, &sin, &cos)?))
    }

    fn rotate(&self, tensor: &Tensor, sin: &Tensor, cos: &Tensor) -> Result<Tensor> {
        let (batch, _heads, seq, head_dim) = tensor.dims4()?;
        if head_dim != self.config.head_dim {
            bail!(
                "rope configured for head_dim {} but received {}",
                self.config.head_dim,
                head_dim
            );
        }
        let (table_batch, _, table_seq, rotate_dim) = cos.dims4()?;
        if table_seq != seq || (table_batch != batch && table_batch != 1) {
            bail!(
                "rope tables {:?} do not match input {:?}",
                cos.dims(),
                tensor.dims()
            );
        }

        let dtype = tensor.dtype();
        let main = tensor.narrow(3, 0, rotate_dim)?.to_dtype(DType::F32)?;
        let rotated = main
            .broadcast_mul(cos)?
            .add(&rotate_half(&main)?.broadcast_mul(sin)?)?
            .to_dtype(dtype)?;

        if rotate_dim == head_dim {
            rotated.contiguous()
        } else {
            let tail = tensor.narrow(3, rotate_dim, head_dim - rotate_dim)?;
            Tensor::cat(&[&rotated, &tail], 3)?.contiguous()
        }
    }
}

/// `concat(-x2, x1)` over the last axis.
pub fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let last = x.dim(D::Minus1)?;
    let half = last / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, last - half)?;
    Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequential(dims: (usize, usize, usize, usize), device: &Device) -> Result<Tensor> {
        let total = dims.0 * dims.1 * dims.2 * dims.3;
        let data: Vec<f32> = (0..total).map(|i| (i as f32 * 0.37).sin()).collect();
        Tensor::from_vec(data, dims, device)
    }

    #[test]
    fn position_zero_is_identity() -> Result<()> {
        let device = Device::Cpu;
        let rope = Rope::new(RopeConfig::new(8, 10_000.0), &device)?;
        let q = sequential((1, 2, 1, 8), &device)?;
        let positions = Tensor::new(&[0u32], &device)?;
        let (rq, rk) = rope.apply(&q, &q, &positions)?;
        let diff = rq.sub(&q)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        let diff = rk.sub(&q)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn matches_scalar_rotate_half_reference() -> Result<()> {
        let device = Device::Cpu;
        let head_dim = 8;
        let theta = 10_000.0f32;
        let rope = Rope::new(RopeConfig::new(head_dim, theta), &device)?;
        let q = sequential((1, 1, 3, head_dim), &device)?;
        let positions = Tensor::new(&[2u32, 5, 9], &device)?;
        let (rq, _) = rope.apply(&q, &q, &positions)?;

        let input = q.flatten_all()?.to_vec1::<f32>()?;
        let output = rq.flatten_all()?.to_vec1::<f32>()?;
        let half = head_dim / 2;
        for (t, pos) in [2.0f64, 5.0, 9.0].iter().enumerate() {
            let row = &input[t * head_dim..(t + 1) * head_dim];
            for j in 0..half {
                let inv = (theta as f64).powf(-((2 * j) as f64) / head_dim as f64);
                let (s, c) = ((pos * inv).sin() as f32, (pos * inv).cos() as f32);
                let first = row[j] * c - row[j + half] * s;
                let second = row[j + half] * c + row[j] * s;
                assert!((output[t * head_dim + j] - first).abs() < 1e-5);
                assert!((output[t * head_dim + j + half] - second).abs() < 1e-5);
            }
        }
        Ok(())
    }

    #[test]
    fn rotation_preserves_norm() -> Result<()> {
        let device = Device::Cpu;
        let rope = Rope::new(RopeConfig::new(16, 500_000.0), &device)?;
        let k = sequential((1, 2, 4, 16), &device)?;
        let positions = Tensor::arange(0u32, 4, &device)?;
        let (_, rk) = rope.apply(&k, &k, &positions)?;
        let before = k.sqr()?.sum(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
        let after = rk.sqr()?.sum(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
        for (a, b) in before.iter().zip(after.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
        Ok(())
    }

    #[test]
    fn rejects_odd_rotate_dim() {
        let config = RopeConfig {
            head_dim: 8,
            rope_theta: 10_000.0,
            rotate_dim: Some(3),
        };
        assert!(Rope::new(config, &Device::Cpu).is_err());
    }
}
