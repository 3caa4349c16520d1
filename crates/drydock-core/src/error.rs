//! Fleet-wide error taxonomy.
//!
//! Every crate keeps its own error enum; each converts into [`FleetError`]
//! so callers can classify any failure the same way.

use std::fmt;

use thiserror::Error;

use crate::types::NodeState;

/// A requested state change that is not in the transition table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition {from} -> {to}{}", reason_suffix(.reason))]
pub struct InvalidTransition {
    pub from: NodeState,
    pub to: NodeState,
    pub reason: Option<String>,
}

fn reason_suffix(reason: &Option<String>) -> String {
    match reason {
        Some(r) => format!(" ({r})"),
        None => String::new(),
    }
}

/// How a remote operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteFailureKind {
    /// The command ran and exited non-zero.
    Failure,
    /// The command did not finish within its deadline.
    Timeout,
    /// The host could not be reached at all.
    Unreachable,
}

impl fmt::Display for RemoteFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RemoteFailureKind::Failure => "failure",
            RemoteFailureKind::Timeout => "timeout",
            RemoteFailureKind::Unreachable => "unreachable",
        })
    }
}

/// The five failure classes every operation reports against.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FleetError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("remote execution {kind}: {message}")]
    RemoteExecution {
        kind: RemoteFailureKind,
        message: String,
    },

    #[error("integrity failure: {0}")]
    Integrity(String),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type FleetResult<T> = Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_message() {
        let err = InvalidTransition {
            from: NodeState::Unknown,
            to: NodeState::Online,
            reason: Some("skip enrollment".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "invalid transition UNKNOWN -> ONLINE (skip enrollment)"
        );

        let bare = InvalidTransition {
            reason: None,
            ..err
        };
        assert_eq!(bare.to_string(), "invalid transition UNKNOWN -> ONLINE");
    }

    #[test]
    fn remote_failure_message_names_kind() {
        let err = FleetError::RemoteExecution {
            kind: RemoteFailureKind::Timeout,
            message: "systemctl restart redis".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "remote execution timeout: systemctl restart redis"
        );
    }
}
