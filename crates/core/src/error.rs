//! Identifier validation errors.

use thiserror::Error;

/// An identifier could not be constructed from its raw value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("{kind} must not be empty")]
    Empty { kind: &'static str },

    #[error("invalid {kind}: {reason}")]
    Malformed { kind: &'static str, reason: String },
}
