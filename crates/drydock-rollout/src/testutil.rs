//! Shared fixtures for strategy and orchestrator tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use drydock_core::{DrydockConfig, NewNode, Node, NodeLocks, NodeState, Role};
use drydock_exec::ScriptedExecutor;
use drydock_state::{NodeRepository, StateStore};

use crate::context::{DeploymentContext, StrategyKind};
use crate::fleet::Fleet;

pub struct Harness {
    pub store: StateStore,
    pub exec: ScriptedExecutor,
    pub locks: NodeLocks,
    pub config: DrydockConfig,
    pub fleet: Fleet,
}

/// Millisecond health polling so no test waits on real intervals.
pub fn test_config() -> DrydockConfig {
    let mut config = DrydockConfig::default();
    config.health.poll_interval_ms = 1;
    config.health.max_retries = 3;
    config.health.timeout_secs = 5;
    config
}

pub fn harness() -> Harness {
    let store = StateStore::open_in_memory().unwrap();
    let exec = ScriptedExecutor::new();
    let locks = NodeLocks::new();
    let config = test_config();
    let fleet = Fleet::new(
        Arc::new(store.clone()),
        Arc::new(exec.clone()),
        locks.clone(),
        &config,
    );
    Harness {
        store,
        exec,
        locks,
        config,
        fleet,
    }
}

impl Harness {
    pub fn role(&self, name: &str, capabilities: &[&str]) -> Role {
        let role = Role {
            name: name.to_string(),
            services: vec![format!("{name}.service")],
            stateful: false,
            service_type: None,
            required_capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            install_playbook: None,
            purge_playbook: None,
            health_checks: Vec::new(),
        };
        self.store.put_role(&role).unwrap();
        role
    }

    pub fn online_node(&self, name: &str, role: Option<&str>) -> Node {
        self.online_node_with(name, role, &[])
    }

    pub fn online_node_with(&self, name: &str, role: Option<&str>, capabilities: &[&str]) -> Node {
        let mut new = NewNode::new(name, &format!("{name}.fleet.test"));
        new.capabilities = capabilities.iter().map(|c| c.to_string()).collect::<BTreeSet<_>>();
        let node = self.store.create_node(new).unwrap();
        if role.is_some() {
            self.store.assign_role_to_node(&node.id, role).unwrap();
        }
        self.store
            .update_node_state(&node.id, NodeState::Online, "test", None, false)
            .unwrap()
    }

    pub fn node(&self, id: &str) -> Node {
        self.store.get_node(id).unwrap().unwrap()
    }

    pub fn state(&self, id: &str) -> NodeState {
        self.node(id).state
    }

    pub fn store_state(&self, id: &str, state: NodeState) {
        self.store
            .update_node_state(id, state, "test", None, false)
            .unwrap();
    }
}

pub fn context(
    strategy: StrategyKind,
    role: &str,
    nodes: &[&Node],
    playbook: Option<&str>,
) -> DeploymentContext {
    DeploymentContext::new(
        "dep-test".to_string(),
        strategy,
        role,
        nodes.iter().map(|n| n.id.clone()).collect(),
        playbook.map(str::to_string),
        BTreeMap::new(),
    )
}
