//! Deployment records: the context, its steps, and their statuses.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use drydock_core::clock::{epoch_secs, next_sequence};
use drydock_core::{Node, NodeId, RoleName};
use serde::{Deserialize, Serialize};

use crate::error::RolloutError;

/// Which rollout strategy a deployment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Sequential,
    BlueGreen,
    MaintenanceWindow,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Sequential => "sequential",
            StrategyKind::BlueGreen => "blue_green",
            StrategyKind::MaintenanceWindow => "maintenance_window",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = RolloutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "sequential" | "rolling" => Ok(StrategyKind::Sequential),
            "blue_green" | "bluegreen" => Ok(StrategyKind::BlueGreen),
            "maintenance_window" | "maintenance" => Ok(StrategyKind::MaintenanceWindow),
            _ => Err(RolloutError::Validation(format!("unknown strategy: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Queued,
    Running,
    Paused,
    Success,
    Failed,
    RolledBack,
    Cancelled,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Success
                | DeploymentStatus::Failed
                | DeploymentStatus::RolledBack
                | DeploymentStatus::Cancelled
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeploymentStatus::Queued => "QUEUED",
            DeploymentStatus::Running => "RUNNING",
            DeploymentStatus::Paused => "PAUSED",
            DeploymentStatus::Success => "SUCCESS",
            DeploymentStatus::Failed => "FAILED",
            DeploymentStatus::RolledBack => "ROLLED_BACK",
            DeploymentStatus::Cancelled => "CANCELLED",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Drain,
    HealthCheck,
    ExecutePlaybook,
    Verify,
    Recover,
    Rollback,
    /// Blue-green: hand the role to a green node.
    Switch,
    /// Blue-green: clear the role from a blue node.
    Decommission,
}

/// One unit of work against one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub step_type: StepType,
    pub node_id: NodeId,
    pub node_name: String,
    pub description: String,
    pub started_at: u64,
    pub completed_at: Option<u64>,
    /// `None` while the step is running.
    pub success: Option<bool>,
    pub error: Option<String>,
}

/// Green-set bookkeeping for a blue-green deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlueGreenState {
    pub green: Vec<NodeId>,
    /// Borrowed green node -> the donor role it goes back to.
    pub borrowed: BTreeMap<NodeId, RoleName>,
    /// Green nodes that completed the switch.
    pub switched: Vec<NodeId>,
    /// Blue nodes whose role was cleared.
    pub decommissioned: Vec<NodeId>,
}

/// One rollout attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentContext {
    pub id: String,
    pub strategy: StrategyKind,
    pub role: RoleName,
    /// Target nodes, in processing order.
    pub nodes: Vec<NodeId>,
    pub playbook: Option<String>,
    pub params: BTreeMap<String, String>,
    pub steps: Vec<DeploymentStep>,
    pub status: DeploymentStatus,
    pub created_at: u64,
    /// Creation order within this process; breaks `created_at` ties.
    #[serde(default)]
    pub sequence: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    /// First failure cause.
    pub error: Option<String>,
    pub rollback_triggered: bool,
    /// Targets that finished successfully, in completion order.
    #[serde(default)]
    pub completed_nodes: Vec<NodeId>,
    #[serde(default)]
    pub blue_green: Option<BlueGreenState>,
}

impl DeploymentContext {
    pub fn new(
        id: String,
        strategy: StrategyKind,
        role: &str,
        nodes: Vec<NodeId>,
        playbook: Option<String>,
        params: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id,
            strategy,
            role: role.to_string(),
            nodes,
            playbook,
            params,
            steps: Vec::new(),
            status: DeploymentStatus::Queued,
            created_at: epoch_secs(),
            sequence: next_sequence(),
            started_at: None,
            completed_at: None,
            error: None,
            rollback_triggered: false,
            completed_nodes: Vec::new(),
            blue_green: None,
        }
    }

    /// Trigger string recorded on node transitions made by this deployment.
    pub fn trigger(&self) -> String {
        format!("deployment:{}", self.id)
    }

    /// Append a running step and return its index.
    pub fn begin_step(&mut self, step_type: StepType, node: &Node, description: &str) -> usize {
        self.steps.push(DeploymentStep {
            step_type,
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            description: description.to_string(),
            started_at: epoch_secs(),
            completed_at: None,
            success: None,
            error: None,
        });
        self.steps.len() - 1
    }

    pub fn finish_step(&mut self, index: usize, error: Option<String>) {
        if let Some(step) = self.steps.get_mut(index) {
            step.completed_at = Some(epoch_secs());
            step.success = Some(error.is_none());
            step.error = error;
        }
    }

    /// Record the first failure cause; later ones are kept on their steps.
    pub fn fail_with(&mut self, error: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(error.into());
        }
    }

    /// Move to a terminal status and stamp the completion time.
    pub fn finish(&mut self, status: DeploymentStatus) {
        self.status = status;
        self.completed_at = Some(epoch_secs());
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &DeploymentStep> {
        self.steps.iter().filter(|s| s.success == Some(false))
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use drydock_core::NodeState;

    fn node() -> Node {
        Node {
            id: "node-1".to_string(),
            name: "web-01".to_string(),
            address: "10.0.0.1".to_string(),
            ssh_port: 22,
            ssh_user: "root".to_string(),
            state: NodeState::Online,
            role: None,
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

    #[test]
    fn strategy_names_parse() {
        assert_eq!("sequential".parse::<StrategyKind>().unwrap(), StrategyKind::Sequential);
        assert_eq!("blue-green".parse::<StrategyKind>().unwrap(), StrategyKind::BlueGreen);
        assert_eq!(
            "MAINTENANCE_WINDOW".parse::<StrategyKind>().unwrap(),
            StrategyKind::MaintenanceWindow
        );
        assert!(matches!(
            "canary".parse::<StrategyKind>(),
            Err(RolloutError::Validation(_))
        ));
    }

    #[test]
    fn steps_record_outcome() {
        let mut ctx = DeploymentContext::new(
            "d1".to_string(),
            StrategyKind::Sequential,
            "web",
            vec!["node-1".to_string()],
            None,
            BTreeMap::new(),
        );
        let ok = ctx.begin_step(StepType::Drain, &node(), "drain");
        assert_eq!(ctx.steps[ok].success, None);
        ctx.finish_step(ok, None);
        let bad = ctx.begin_step(StepType::ExecutePlaybook, &node(), "playbook");
        ctx.finish_step(bad, Some("exit 2".to_string()));

        assert_eq!(ctx.steps[ok].success, Some(true));
        assert_eq!(ctx.failed_steps().count(), 1);
        assert_eq!(ctx.trigger(), "deployment:d1");
    }

    #[test]
    fn first_error_wins() {
        let mut ctx = DeploymentContext::new(
            "d1".to_string(),
            StrategyKind::Sequential,
            "web",
            Vec::new(),
            None,
            BTreeMap::new(),
        );
        ctx.fail_with("first");
        ctx.fail_with("second");
        assert_eq!(ctx.error.as_deref(), Some("first"));

        ctx.finish(DeploymentStatus::Failed);
        assert!(ctx.status.is_terminal());
        assert!(ctx.completed_at.is_some());
    }

    #[test]
    fn status_serializes_screaming() {
        let json = serde_json::to_string(&DeploymentStatus::RolledBack).unwrap();
        assert_eq!(json, "\"ROLLED_BACK\"");
        assert_eq!(DeploymentStatus::RolledBack.to_string(), "ROLLED_BACK");
    }
}
