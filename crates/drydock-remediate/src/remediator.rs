//! Service restarts and reachability probes with an attempt history.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use drydock_core::clock::epoch_secs;
use drydock_core::config::RemediationConfig;
use drydock_core::{FleetError, Node, NodeId};
use drydock_exec::{CommandExecutor, ExecError, SshTarget};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error, PartialEq)]
pub enum RemediationError {
    #[error("invalid service name: {0:?}")]
    InvalidService(String),
}

impl From<RemediationError> for FleetError {
    fn from(err: RemediationError) -> Self {
        FleetError::Validation(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    RestartService,
    RestartAllServices,
    HealthCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemediationOutcome {
    Success,
    Failure,
    Timeout,
    Unreachable,
}

impl fmt::Display for RemediationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RemediationOutcome::Success => "SUCCESS",
            RemediationOutcome::Failure => "FAILURE",
            RemediationOutcome::Timeout => "TIMEOUT",
            RemediationOutcome::Unreachable => "UNREACHABLE",
        })
    }
}

/// Immutable record of one remediation action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationAttempt {
    pub node_id: NodeId,
    pub node_name: String,
    pub action: RemediationAction,
    pub result: RemediationOutcome,
    /// Unix timestamp (seconds) when the action started.
    pub timestamp: u64,
    pub duration_ms: u64,
    pub details: serde_json::Value,
    pub error: Option<String>,
}

impl RemediationAttempt {
    pub fn succeeded(&self) -> bool {
        self.result == RemediationOutcome::Success
    }
}

/// Executes remediation actions and remembers them.
///
/// Cloning shares the history.
#[derive(Clone)]
pub struct Remediator {
    executor: Arc<dyn CommandExecutor>,
    restart_timeout: Duration,
    history_limit: usize,
    history: Arc<Mutex<VecDeque<RemediationAttempt>>>,
}

impl Remediator {
    pub fn new(executor: Arc<dyn CommandExecutor>, config: &RemediationConfig) -> Self {
        Self {
            executor,
            restart_timeout: config.restart_timeout(),
            history_limit: config.history_limit.max(1),
            history: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn history_guard(&self) -> MutexGuard<'_, VecDeque<RemediationAttempt>> {
        self.history.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn record(&self, attempt: &RemediationAttempt) {
        match attempt.result {
            RemediationOutcome::Success => info!(
                node_id = %attempt.node_id,
                action = ?attempt.action,
                duration_ms = attempt.duration_ms,
                "remediation succeeded"
            ),
            result => warn!(
                node_id = %attempt.node_id,
                action = ?attempt.action,
                %result,
                error = attempt.error.as_deref().unwrap_or(""),
                "remediation did not succeed"
            ),
        }

        let mut history = self.history_guard();
        while history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(attempt.clone());
    }

    /// Restart one service with `systemctl restart`.
    pub async fn restart_service(
        &self,
        node: &Node,
        service: &str,
    ) -> Result<RemediationAttempt, RemediationError> {
        validate_service(service)?;
        let attempt = self
            .restart(node, service, RemediationAction::RestartService)
            .await;
        self.record(&attempt);
        Ok(attempt)
    }

    /// Restart `services` in order, stopping at the first one that does not
    /// come back.
    ///
    /// Returns the attempts made, so a failure on the second of three
    /// services yields two attempts.
    pub async fn restart_all_services(
        &self,
        node: &Node,
        services: &[String],
    ) -> Result<Vec<RemediationAttempt>, RemediationError> {
        for service in services {
            validate_service(service)?;
        }

        let mut attempts = Vec::with_capacity(services.len());
        for service in services {
            let attempt = self
                .restart(node, service, RemediationAction::RestartAllServices)
                .await;
            self.record(&attempt);
            let ok = attempt.succeeded();
            attempts.push(attempt);
            if !ok {
                warn!(node_id = %node.id, %service, "stopping multi-service restart at first failure");
                break;
            }
        }
        Ok(attempts)
    }

    /// TCP probe of the node's SSH port.
    pub async fn check_node_reachable(&self, node: &Node) -> RemediationAttempt {
        let timestamp = epoch_secs();
        let started = Instant::now();
        let reachable = self
            .executor
            .check_connectivity(&node.address, node.ssh_port)
            .await;

        let attempt = RemediationAttempt {
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            action: RemediationAction::HealthCheck,
            result: if reachable {
                RemediationOutcome::Success
            } else {
                RemediationOutcome::Unreachable
            },
            timestamp,
            duration_ms: started.elapsed().as_millis() as u64,
            details: json!({ "address": node.address, "port": node.ssh_port }),
            error: (!reachable).then(|| format!("{}:{} not reachable", node.address, node.ssh_port)),
        };
        self.record(&attempt);
        attempt
    }

    async fn restart(
        &self,
        node: &Node,
        service: &str,
        action: RemediationAction,
    ) -> RemediationAttempt {
        let timestamp = epoch_secs();
        let started = Instant::now();
        let command = format!("systemctl restart {service}");
        let outcome = self
            .executor
            .execute_timeout(&SshTarget::from(node), &command, self.restart_timeout)
            .await;
        let elapsed = started.elapsed();

        let (result, exit_code, error) = match outcome {
            Ok(_) if elapsed > self.restart_timeout => (
                RemediationOutcome::Timeout,
                None,
                Some(format!("restart took {elapsed:?}, limit {:?}", self.restart_timeout)),
            ),
            Ok(out) if out.success() => (RemediationOutcome::Success, Some(out.exit_code), None),
            Ok(out) => (
                RemediationOutcome::Failure,
                Some(out.exit_code),
                Some(out.error_text()),
            ),
            Err(e @ ExecError::Timeout { .. }) => (RemediationOutcome::Timeout, None, Some(e.to_string())),
            Err(e @ ExecError::Unreachable { .. }) => {
                (RemediationOutcome::Unreachable, None, Some(e.to_string()))
            }
            Err(e) => (RemediationOutcome::Failure, None, Some(e.to_string())),
        };

        RemediationAttempt {
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            action,
            result,
            timestamp,
            duration_ms: elapsed.as_millis() as u64,
            details: json!({ "service": service, "exit_code": exit_code }),
            error,
        }
    }

    // ── History ───────────────────────────────────────────────────

    /// Attempts against one node, oldest first.
    pub fn history(&self, node_id: &str) -> Vec<RemediationAttempt> {
        self.history_guard()
            .iter()
            .filter(|a| a.node_id == node_id)
            .cloned()
            .collect()
    }

    /// The `limit` most recent attempts across all nodes, newest first.
    pub fn recent(&self, limit: usize) -> Vec<RemediationAttempt> {
        self.history_guard().iter().rev().take(limit).cloned().collect()
    }

    /// Forget one node's attempts, or everything with `None`.
    pub fn clear_history(&self, node_id: Option<&str>) {
        let mut history = self.history_guard();
        match node_id {
            Some(id) => history.retain(|a| a.node_id != id),
            None => history.clear(),
        }
    }
}

/// Service names go straight into a shell command line.
fn validate_service(service: &str) -> Result<(), RemediationError> {
    let ok = !service.is_empty()
        && service
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_.@:".contains(c));
    if ok {
        Ok(())
    } else {
        Err(RemediationError::InvalidService(service.to_string()))
    }
}
