//! Error types for the drydock state store.

use drydock_core::{FleetError, InvalidTransition};
use thiserror::Error;

/// Result type alias for repository operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

impl From<StateError> for FleetError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(what) => FleetError::NotFound(what),
            StateError::Validation(msg) => FleetError::Validation(msg),
            StateError::InvalidTransition(t) => FleetError::InvalidTransition(t),
            other => FleetError::Integrity(other.to_string()),
        }
    }
}
