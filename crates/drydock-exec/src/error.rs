//! Executor error types.

use std::time::Duration;

use drydock_core::{FleetError, RemoteFailureKind};
use thiserror::Error;

/// Failures that prevented a command from producing an exit status.
///
/// A command that runs and exits non-zero is not an error at this layer;
/// it comes back as a [`crate::CommandOutput`] for the caller to judge.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecError {
    #[error("command on {host} timed out after {after:?}")]
    Timeout { host: String, after: Duration },

    #[error("host {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },
}

impl ExecError {
    pub fn kind(&self) -> RemoteFailureKind {
        match self {
            ExecError::Timeout { .. } => RemoteFailureKind::Timeout,
            ExecError::Unreachable { .. } => RemoteFailureKind::Unreachable,
            ExecError::Spawn { .. } => RemoteFailureKind::Failure,
        }
    }
}

impl From<ExecError> for FleetError {
    fn from(err: ExecError) -> Self {
        FleetError::RemoteExecution {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
