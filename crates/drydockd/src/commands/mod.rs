//! Operator commands.
//!
//! Each one is an [`Operation`] so it can run either here, against a
//! store this process opened, or inside the running daemon after a trip
//! over the control socket.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::app::App;
use crate::console::Console;

pub mod deploy;
pub mod node;
pub mod role;
pub mod run;
pub mod stateful;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    NodeAdd {
        name: String,
        address: String,
        ssh_port: Option<u16>,
        ssh_user: Option<String>,
        capabilities: Vec<String>,
    },
    NodeList {
        state: Option<String>,
    },
    NodeShow {
        node: String,
        history: usize,
    },
    NodeSetState {
        node: String,
        state: String,
        force: bool,
        reason: Option<String>,
    },
    NodeDelete {
        node: String,
    },
    /// The file is read by the operator's process; only its text travels.
    RoleAdd {
        source: String,
        content: String,
    },
    RoleList,
    Deploy {
        role: String,
        strategy: String,
        nodes: Vec<String>,
        playbook: Option<String>,
        params: BTreeMap<String, String>,
    },
    BackupCreate {
        node: String,
        service_type: Option<String>,
        path: Option<String>,
    },
    BackupRestore {
        node: String,
        path: String,
        checksum: String,
        service_type: Option<String>,
    },
    Replicate {
        primary: String,
        replica: String,
        service_type: Option<String>,
        promote: bool,
    },
    Swap {
        primary: String,
        standby: String,
        service_type: Option<String>,
        playbook: String,
        params: BTreeMap<String, String>,
    },
}

impl Operation {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::NodeAdd { .. } => "node add",
            Operation::NodeList { .. } => "node list",
            Operation::NodeShow { .. } => "node show",
            Operation::NodeSetState { .. } => "node set-state",
            Operation::NodeDelete { .. } => "node delete",
            Operation::RoleAdd { .. } => "role add",
            Operation::RoleList => "role list",
            Operation::Deploy { .. } => "deploy",
            Operation::BackupCreate { .. } => "backup create",
            Operation::BackupRestore { .. } => "backup restore",
            Operation::Replicate { .. } => "replicate",
            Operation::Swap { .. } => "swap",
        }
    }

    pub async fn execute(self, app: &App, out: &Console) -> anyhow::Result<()> {
        match self {
            Operation::NodeAdd {
                name,
                address,
                ssh_port,
                ssh_user,
                capabilities,
            } => node::add(app, out, &name, &address, ssh_port, ssh_user, capabilities),
            Operation::NodeList { state } => node::list(app, out, state.as_deref()),
            Operation::NodeShow { node, history } => node::show(app, out, &node, history),
            Operation::NodeSetState {
                node,
                state,
                force,
                reason,
            } => node::set_state(app, out, &node, &state, force, reason.as_deref()),
            Operation::NodeDelete { node } => node::delete(app, out, &node),
            Operation::RoleAdd { source, content } => role::add(app, out, &source, &content),
            Operation::RoleList => role::list(app, out),
            Operation::Deploy {
                role,
                strategy,
                nodes,
                playbook,
                params,
            } => {
                deploy::deploy(app, out, &role, &strategy, &nodes, playbook.as_deref(), params)
                    .await
            }
            Operation::BackupCreate {
                node,
                service_type,
                path,
            } => {
                stateful::backup_create(app, out, &node, service_type.as_deref(), path.as_deref())
                    .await
            }
            Operation::BackupRestore {
                node,
                path,
                checksum,
                service_type,
            } => {
                stateful::backup_restore(
                    app,
                    out,
                    &node,
                    &path,
                    &checksum,
                    service_type.as_deref(),
                )
                .await
            }
            Operation::Replicate {
                primary,
                replica,
                service_type,
                promote,
            } => {
                stateful::replicate(app, out, &primary, &replica, service_type.as_deref(), promote)
                    .await
            }
            Operation::Swap {
                primary,
                standby,
                service_type,
                playbook,
                params,
            } => {
                stateful::swap(
                    app,
                    out,
                    &primary,
                    &standby,
                    service_type.as_deref(),
                    &playbook,
                    params,
                )
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_travel_as_tagged_json() {
        let op = Operation::Deploy {
            role: "cache".into(),
            strategy: "blue-green".into(),
            nodes: vec!["cache-01".into()],
            playbook: None,
            params: BTreeMap::from([("donor_role".to_string(), "spare".to_string())]),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "deploy");
        assert_eq!(json["params"]["donor_role"], "spare");

        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
        assert_eq!(
            serde_json::to_string(&Operation::RoleList).unwrap(),
            r#"{"op":"role_list"}"#
        );
    }
}
