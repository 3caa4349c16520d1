//! Stateful-service errors.

use drydock_core::{FleetError, RemoteFailureKind};
use drydock_exec::ExecError;
use drydock_state::StateError;
use thiserror::Error;

pub type StatefulResult<T> = Result<T, StatefulError>;

#[derive(Debug, Error)]
pub enum StatefulError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("{kind} {id} is {state}, cannot {action}")]
    InvalidState {
        kind: &'static str,
        id: String,
        state: String,
        action: &'static str,
    },

    #[error("`{command}` failed on {node} (exit {exit_code}): {output}")]
    Command {
        node: String,
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("integrity failure: {0}")]
    Integrity(String),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl From<StatefulError> for FleetError {
    fn from(err: StatefulError) -> Self {
        match err {
            StatefulError::NotFound(what) => FleetError::NotFound(what),
            StatefulError::Integrity(msg) => FleetError::Integrity(msg),
            StatefulError::Exec(e) => e.into(),
            StatefulError::State(e) => e.into(),
            e @ StatefulError::Command { .. } => FleetError::RemoteExecution {
                kind: RemoteFailureKind::Failure,
                message: e.to_string(),
            },
            e @ StatefulError::Timeout(_) => FleetError::RemoteExecution {
                kind: RemoteFailureKind::Timeout,
                message: e.to_string(),
            },
            e @ (StatefulError::Validation(_) | StatefulError::InvalidState { .. }) => {
                FleetError::Validation(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_into_fleet_taxonomy() {
        let checksum: FleetError = StatefulError::Integrity("checksum mismatch".into()).into();
        assert_eq!(checksum, FleetError::Integrity("checksum mismatch".into()));

        let sync: FleetError = StatefulError::Timeout("replication r1 not synced".into()).into();
        assert!(matches!(
            sync,
            FleetError::RemoteExecution {
                kind: RemoteFailureKind::Timeout,
                ..
            }
        ));

        let state: FleetError = StatefulError::InvalidState {
            kind: "backup",
            id: "bk-1".into(),
            state: "FAILED".into(),
            action: "restore",
        }
        .into();
        assert_eq!(
            state,
            FleetError::Validation("backup bk-1 is FAILED, cannot restore".into())
        );
    }
}
