//! Post-deployment health verification.
//!
//! A node is healthy when its SSH port accepts connections and every
//! health check declared on its role passes. Probes repeat at a fixed
//! interval until one passes, the retry budget runs out, or the overall
//! deadline expires. Running out is a failed check, not an error.

use drydock_core::config::HealthPollConfig;
use drydock_core::{HealthCheck, Node};
use drydock_exec::{CommandExecutor, SshTarget, shell_quote};
use tracing::debug;

use crate::error::{RolloutError, RolloutResult};

/// Probe `node` until healthy. Returns the attempt that passed.
pub async fn verify_node_health(
    executor: &dyn CommandExecutor,
    node: &Node,
    checks: &[HealthCheck],
    poll: &HealthPollConfig,
) -> RolloutResult<u32> {
    let max_retries = poll.max_retries.max(1);
    let mut attempts = 0;
    let mut last_reason = String::from("no probe completed");

    let polling = async {
        loop {
            attempts += 1;
            match probe(executor, node, checks).await {
                Ok(()) => return Ok(attempts),
                Err(reason) => {
                    debug!(node_id = %node.id, attempt = attempts, %reason, "health probe failed");
                    last_reason = reason;
                }
            }
            if attempts >= max_retries {
                return Err(());
            }
            tokio::time::sleep(poll.poll_interval()).await;
        }
    };

    let outcome = tokio::time::timeout(poll.timeout(), polling).await;
    match outcome {
        Ok(Ok(attempt)) => Ok(attempt),
        Ok(Err(())) => Err(RolloutError::HealthCheck {
            node: node.name.clone(),
            attempts,
            reason: last_reason,
        }),
        Err(_) => Err(RolloutError::HealthCheck {
            node: node.name.clone(),
            attempts,
            reason: format!("timed out after {:?} ({last_reason})", poll.timeout()),
        }),
    }
}

/// One pass over every check. The first failure is the reason.
async fn probe(
    executor: &dyn CommandExecutor,
    node: &Node,
    checks: &[HealthCheck],
) -> Result<(), String> {
    if !executor.check_connectivity(&node.address, node.ssh_port).await {
        return Err(format!("ssh port {} unreachable", node.ssh_port));
    }

    let target = SshTarget::from(node);
    for check in checks {
        match check {
            HealthCheck::Tcp { port } => {
                if !executor.check_connectivity(&node.address, *port).await {
                    return Err(format!("tcp port {port} closed"));
                }
            }
            HealthCheck::Systemd { service } => {
                let command = format!("systemctl is-active {}", shell_quote(service));
                let out = executor.execute(&target, &command).await.map_err(|e| e.to_string())?;
                if out.stdout.trim() != "active" {
                    return Err(format!("{service} is {}", out.stdout.trim()));
                }
            }
            HealthCheck::Command { command } => {
                let out = executor.execute(&target, command).await.map_err(|e| e.to_string())?;
                if !out.success() {
                    return Err(format!("`{command}` exited {}: {}", out.exit_code, out.error_text()));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    use drydock_core::NodeState;
    use drydock_exec::{CommandOutput, Reply, ScriptedExecutor};

    fn node() -> Node {
        Node {
            id: "node-1".to_string(),
            name: "cache-01".to_string(),
            address: "10.0.0.1".to_string(),
            ssh_port: 22,
            ssh_user: "root".to_string(),
            state: NodeState::MaintenanceRecovering,
            role: Some("cache".to_string()),
            borrowed_from: None,
            capabilities: BTreeSet::new(),
            consecutive_failures: 0,
            last_heartbeat: None,
            last_health_check: None,
            health: None,
            state_changed_at: 0,
            created_at: 0,
        }
    }

    fn fast_poll(max_retries: u32) -> HealthPollConfig {
        HealthPollConfig {
            poll_interval_ms: 5,
            max_retries,
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn passes_when_all_checks_pass() {
        let exec = ScriptedExecutor::new();
        exec.on("is-active", Reply::ok("active\n"));
        let checks = vec![
            HealthCheck::Systemd {
                service: "redis-server".to_string(),
            },
            HealthCheck::Command {
                command: "redis-cli ping".to_string(),
            },
        ];

        let attempt = verify_node_health(&exec, &node(), &checks, &fast_poll(3))
            .await
            .unwrap();
        assert_eq!(attempt, 1);
        assert!(exec.ran("10.0.0.1", "systemctl is-active redis-server"));
    }

    #[tokio::test]
    async fn retries_until_healthy() {
        let exec = ScriptedExecutor::new();
        exec.on_sequence(
            None,
            "is-active",
            vec![
                Reply::ok("activating\n"),
                Reply::ok("activating\n"),
                Reply::ok("active\n"),
            ],
        );
        let checks = vec![HealthCheck::Systemd {
            service: "nginx".to_string(),
        }];

        let attempt = verify_node_health(&exec, &node(), &checks, &fast_poll(5))
            .await
            .unwrap();
        assert_eq!(attempt, 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_with_reason() {
        let exec = ScriptedExecutor::new();
        exec.on(
            "curl",
            Reply::Output(CommandOutput::failed(7, "connection refused")),
        );
        let checks = vec![HealthCheck::Command {
            command: "curl -fs localhost:8080/health".to_string(),
        }];

        let err = verify_node_health(&exec, &node(), &checks, &fast_poll(3))
            .await
            .unwrap_err();
        match err {
            RolloutError::HealthCheck { attempts, reason, .. } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("connection refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unreachable_node_fails() {
        let exec = ScriptedExecutor::new();
        exec.set_unreachable("10.0.0.1", true);
        let err = verify_node_health(&exec, &node(), &[], &fast_poll(2))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unreachable"));
    }

    #[tokio::test]
    async fn overall_deadline_bounds_polling() {
        let exec = ScriptedExecutor::new();
        exec.on("is-active", Reply::ok("inactive\n"));
        let checks = vec![HealthCheck::Systemd {
            service: "redis".to_string(),
        }];
        let poll = HealthPollConfig {
            poll_interval_ms: 50,
            max_retries: 1000,
            timeout_secs: 0,
        };

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            verify_node_health(&exec, &node(), &checks, &poll),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(RolloutError::HealthCheck { .. })));
    }
}
