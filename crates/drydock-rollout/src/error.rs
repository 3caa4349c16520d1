//! Rollout errors.

use drydock_core::{FleetError, RemoteFailureKind};
use drydock_exec::ExecError;
use drydock_state::StateError;
use thiserror::Error;

use crate::context::DeploymentStatus;

pub type RolloutResult<T> = Result<T, RolloutError>;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("deployment {id} is {status}, cannot {action}")]
    InvalidStatus {
        id: String,
        status: DeploymentStatus,
        action: &'static str,
    },

    #[error("node {node} is claimed by {owner}")]
    Claimed { node: String, owner: String },

    #[error("{0}")]
    Capacity(String),

    #[error("playbook {playbook} failed on {node} (exit {exit_code}): {output}")]
    Playbook {
        node: String,
        playbook: String,
        exit_code: i32,
        output: String,
    },

    #[error("health check failed on {node} after {attempts} attempts: {reason}")]
    HealthCheck {
        node: String,
        attempts: u32,
        reason: String,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl From<RolloutError> for FleetError {
    fn from(err: RolloutError) -> Self {
        match err {
            RolloutError::NotFound(what) => FleetError::NotFound(what),
            RolloutError::State(e) => e.into(),
            RolloutError::Exec(e) => e.into(),
            e @ RolloutError::Playbook { .. } => FleetError::RemoteExecution {
                kind: RemoteFailureKind::Failure,
                message: e.to_string(),
            },
            e @ RolloutError::HealthCheck { .. } => FleetError::Integrity(e.to_string()),
            e @ (RolloutError::Validation(_)
            | RolloutError::InvalidStatus { .. }
            | RolloutError::Claimed { .. }
            | RolloutError::Capacity(_)) => FleetError::Validation(e.to_string()),
        }
    }
}
