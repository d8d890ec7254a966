//! Embedding crate
//!
//! Token embedding tables and rotary positional encoding for the Llama decoder.

pub mod positional;
pub mod token;

pub use positional::rope::{Rope, RopeConfig};
pub use token::{TokenEmbedding, TokenEmbeddingConfig};
