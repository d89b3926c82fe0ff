//! Error types for the Rollcall engine.

use crate::MutationId;
use thiserror::Error;

/// All possible errors from the Rollcall engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("entity id mismatch: payload has '{payload}', write targets '{target}'")]
    IdMismatch { payload: String, target: String },

    // Queue errors
    #[error("mutation not found: {0}")]
    MutationNotFound(MutationId),

    #[error("mutation {id} is {actual}, expected {expected}")]
    InvalidMutationState {
        id: MutationId,
        expected: String,
        actual: String,
    },
}

impl Error {
    /// Whether this error describes a malformed payload rather than engine state.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::UnknownEntityType(_)
                | Error::InvalidPayload(_)
                | Error::MissingRequiredField(_)
                | Error::TypeMismatch { .. }
                | Error::IdMismatch { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
