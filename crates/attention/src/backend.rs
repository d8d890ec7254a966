//! Attention implementation selector.
//!
//! Names are normalised once, before dispatch: both fused spellings collapse to
//! [`Implementation::Fused`] (canonical name `cudnn`).

use std::fmt;
use std::str::FromStr;

use crate::error::AttentionError;

/// Which kernel family evaluates the attention weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Implementation {
    /// Let the runtime pick: fused when the inputs qualify, generic otherwise.
    #[default]
    Unspecified,
    /// Portable kernel composed from primitive tensor ops.
    Generic,
    /// Hardware-oriented fused softmax kernel. Never falls back.
    Fused,
}

impl Implementation {
    /// Parses an optional name; `None` maps to [`Implementation::Unspecified`].
    pub fn from_name(name: Option<&str>) -> Result<Self, AttentionError> {
        match name {
            None => Ok(Implementation::Unspecified),
            Some(name) => name.parse(),
        }
    }

    /// Canonical spelling, `None` for [`Implementation::Unspecified`].
    pub fn canonical_name(&self) -> Option<&'static str> {
        match self {
            Implementation::Unspecified => None,
            Implementation::Generic => Some("generic"),
            Implementation::Fused => Some("cudnn"),
        }
    }
}

impl FromStr for Implementation {
    type Err = AttentionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "auto" | "none" | "unspecified" => Ok(Implementation::Unspecified),
            "generic" | "xla" | "reference" => Ok(Implementation::Generic),
            "cudnn" | "flash" => Ok(Implementation::Fused),
            other => Err(AttentionError::UnknownBackend(other.to_string())),
        }
    }
}

impl fmt::Display for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical_name().unwrap_or("unspecified"))
    }
}
