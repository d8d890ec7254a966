//! Explicit random-state keys.
//!
//! Every operation that needs randomness (parameter initialisation, attention
//! dropout) receives an [`RngKey`] from its caller. Keys are plain values: the
//! same key always yields the same samples, and child keys are derived
//! deterministically with [`RngKey::split`] or [`RngKey::fold_in`]. Nothing in
//! this workspace reads process-wide RNG state.

use candle_core::{Device, Result, Shape, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Deterministic random-state token threaded through every stochastic call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RngKey(u64);

impl RngKey {
    /// Creates a root key from a seed.
    pub fn new(seed: u64) -> Self {
        Self(mix(seed))
    }

    /// Raw key state, useful for logging reproducibility information.
    pub fn state(&self) -> u64 {
        self.0
    }

    /// Derives two independent keys. The receiver should not be reused afterwards.
    pub fn split(self) -> (RngKey, RngKey) {
        (self.fold_in(0), self.fold_in(1))
    }

    /// Derives `n` independent keys.
    pub fn split_n(self, n: usize) -> Vec<RngKey> {
        (0..n as u64).map(|idx| self.fold_in(idx)).collect()
    }

    /// Derives a key bound to `data` (a layer index, a step counter, ...).
    pub fn fold_in(self, data: u64) -> RngKey {
        RngKey(mix(self.0 ^ mix(data.wrapping_add(GOLDEN_GAMMA))))
    }

    /// Derives a key bound to a parameter path or component name.
    pub fn fold_in_str(self, name: &str) -> RngKey {
        // FNV-1a keeps the derivation stable across platforms and releases.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in name.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        self.fold_in(hash)
    }

    fn generator(self) -> StdRng {
        StdRng::seed_from_u64(self.0)
    }

    /// Samples an `f32` tensor uniformly from `[lo, hi)`.
    pub fn uniform<S: Into<Shape>>(
        self,
        lo: f32,
        hi: f32,
        shape: S,
        device: &Device,
    ) -> Result<Tensor> {
        let shape = shape.into();
        if !(lo < hi) {
            candle_core::bail!("uniform sampling requires lo < hi, got [{lo}, {hi})");
        }
        let mut rng = self.generator();
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| rng.gen_range(lo..hi))
            .collect();
        Tensor::from_vec(data, shape, device)
    }

    /// Samples an `f32` tensor from `N(mean, std^2)`.
    pub fn normal<S: Into<Shape>>(
        self,
        mean: f32,
        std: f32,
        shape: S,
        device: &Device,
    ) -> Result<Tensor> {
        let shape = shape.into();
        let dist = Normal::new(mean, std).map_err(|err| {
            candle_core::Error::Msg(format!("invalid normal distribution ({mean}, {std}): {err}"))
        })?;
        let mut rng = self.generator();
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| dist.sample(&mut rng))
            .collect();
        Tensor::from_vec(data, shape, device)
    }

    /// Samples a Bernoulli keep mask holding `1.0` with probability `keep_prob`.
    pub fn keep_mask<S: Into<Shape>>(
        self,
        keep_prob: f32,
        shape: S,
        device: &Device,
    ) -> Result<Tensor> {
        if !(0.0..=1.0).contains(&keep_prob) {
            candle_core::bail!("keep probability must be in [0, 1], got {keep_prob}");
        }
        let shape = shape.into();
        let mut rng = self.generator();
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| if rng.gen::<f32>() < keep_prob { 1.0 } else { 0.0 })
            .collect();
        Tensor::from_vec(data, shape, device)
    }
}

const GOLDEN_GAMMA: u64 = 0x9e37_79b9_7f4a_7c15;

/// splitmix64 finaliser.
fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(GOLDEN_GAMMA);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
