//! Building blocks for the Llama decoder.
//!
//! The crate hosts the parameter store shared by every component, explicit RNG
//! keys, and the dense, normalisation and feed-forward layers assembled from
//! Candle primitives.

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod params;
pub mod rng;

use thiserror::Error;

pub use dtypes::PrecisionPolicy;
pub use params::ParamStore;
pub use rng::RngKey;

/// Errors raised while building or mutating the parameter collection.
#[derive(Debug, Error)]
pub enum LayerError {
    /// A parameter with the same path was registered twice.
    #[error("parameter `{0}` is already registered")]
    DuplicateParameter(String),
    /// The path does not name a leaf of the collection.
    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),
    /// The incoming tensor does not match the leaf shape.
    #[error("shape mismatch for `{path}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        path: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    /// Failure reported by the tensor backend.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}
