//! Positional encodings injected into attention queries and keys.

pub mod rope;
