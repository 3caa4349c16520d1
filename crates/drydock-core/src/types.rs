//! Domain types shared by every drydock subsystem.
//!
//! Nodes, roles, and the append-only transition log. All types are
//! serializable to/from JSON so the state store can persist them as-is.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FleetError;

/// Unique identifier for a managed node.
pub type NodeId = String;

/// Name of a role (service definition) that can be assigned to a node.
pub type RoleName = String;

// ── Node state ─────────────────────────────────────────────────────

/// Lifecycle state of a node.
///
/// Legal moves between states are owned by [`crate::state_machine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Unknown,
    Pending,
    Enrolling,
    Online,
    Degraded,
    Error,
    MaintenanceDraining,
    MaintenancePlanned,
    MaintenanceImmediate,
    MaintenanceOffline,
    MaintenanceRecovering,
}

impl NodeState {
    /// Every state, in declaration order.
    pub const ALL: [NodeState; 11] = [
        NodeState::Unknown,
        NodeState::Pending,
        NodeState::Enrolling,
        NodeState::Online,
        NodeState::Degraded,
        NodeState::Error,
        NodeState::MaintenanceDraining,
        NodeState::MaintenancePlanned,
        NodeState::MaintenanceImmediate,
        NodeState::MaintenanceOffline,
        NodeState::MaintenanceRecovering,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Unknown => "UNKNOWN",
            NodeState::Pending => "PENDING",
            NodeState::Enrolling => "ENROLLING",
            NodeState::Online => "ONLINE",
            NodeState::Degraded => "DEGRADED",
            NodeState::Error => "ERROR",
            NodeState::MaintenanceDraining => "MAINTENANCE_DRAINING",
            NodeState::MaintenancePlanned => "MAINTENANCE_PLANNED",
            NodeState::MaintenanceImmediate => "MAINTENANCE_IMMEDIATE",
            NodeState::MaintenanceOffline => "MAINTENANCE_OFFLINE",
            NodeState::MaintenanceRecovering => "MAINTENANCE_RECOVERING",
        }
    }

    /// Whether this is one of the `MAINTENANCE_*` sub-states.
    pub fn is_maintenance(&self) -> bool {
        matches!(
            self,
            NodeState::MaintenanceDraining
                | NodeState::MaintenancePlanned
                | NodeState::MaintenanceImmediate
                | NodeState::MaintenanceOffline
                | NodeState::MaintenanceRecovering
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        NodeState::ALL
            .into_iter()
            .find(|state| state.as_str() == wanted)
            .ok_or_else(|| FleetError::Validation(format!("unknown node state: {s}")))
    }
}

// ── Node ──────────────────────────────────────────────────────────

/// A managed machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    /// Address used for SSH and reachability probes.
    pub address: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub state: NodeState,
    /// Role currently assigned to this node, if any.
    pub role: Option<RoleName>,
    /// Set while the node is on loan to a blue-green deployment; holds the
    /// role it must be returned to.
    #[serde(default)]
    pub borrowed_from: Option<RoleName>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Reset to zero on every successful health update.
    pub consecutive_failures: u32,
    /// Unix timestamp (seconds) of the last heartbeat, if one was ever seen.
    pub last_heartbeat: Option<u64>,
    /// Unix timestamp (seconds) of the last health report.
    pub last_health_check: Option<u64>,
    /// Most recent health payload reported by the node.
    #[serde(default)]
    pub health: Option<serde_json::Value>,
    /// Unix timestamp (seconds) of the last state change.
    pub state_changed_at: u64,
    pub created_at: u64,
}

impl Node {
    /// Seconds since the last heartbeat, or `None` if none was ever recorded.
    pub fn heartbeat_age(&self, now: u64) -> Option<u64> {
        self.last_heartbeat.map(|hb| now.saturating_sub(hb))
    }

    /// Whether the node has no role and is not on loan, i.e. a usable spare.
    pub fn is_spare(&self) -> bool {
        self.role.is_none() && self.borrowed_from.is_none()
    }

    pub fn has_capabilities(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }
}

/// Fields supplied when enrolling a new node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewNode {
    pub name: String,
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl NewNode {
    pub fn new(name: &str, address: &str) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            ssh_port: default_ssh_port(),
            ssh_user: default_ssh_user(),
            capabilities: BTreeSet::new(),
        }
    }

    pub fn with_capability(mut self, tag: &str) -> Self {
        self.capabilities.insert(tag.to_string());
        self
    }
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "root".to_string()
}

// ── Role ──────────────────────────────────────────────────────────

/// A named service definition assignable to nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Role {
    pub name: RoleName,
    /// Service units that make up this role, in start order.
    pub services: Vec<String>,
    #[serde(default)]
    pub stateful: bool,
    /// Stateful handler key (e.g. "redis") for stateful roles.
    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub install_playbook: Option<String>,
    #[serde(default)]
    pub purge_playbook: Option<String>,
    #[serde(default)]
    pub health_checks: Vec<HealthCheck>,
}

/// How to decide whether a role is healthy on a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthCheck {
    /// Run a command over SSH; exit code 0 means healthy.
    Command { command: String },
    /// The systemd unit must report `active`.
    Systemd { service: String },
    /// A TCP connect to the node on this port must succeed.
    Tcp { port: u16 },
}

// ── Transitions ───────────────────────────────────────────────────

/// Immutable audit record of a node state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateTransition {
    pub node_id: NodeId,
    pub from: NodeState,
    pub to: NodeState,
    /// Who or what caused the change ("reconciler", "deployment:<id>", ...).
    pub trigger: String,
    pub details: Option<serde_json::Value>,
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: u64,
}
