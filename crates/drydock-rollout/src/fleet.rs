//! Shared handles and per-node phases used by every strategy.
//!
//! Each phase appends a [`DeploymentStep`](crate::DeploymentStep), runs,
//! closes the step with its outcome, and publishes the context. Node state
//! is always re-read from the repository rather than taken from the caller.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use drydock_core::config::{BlueGreenConfig, HealthPollConfig, MaintenanceWindowConfig};
use drydock_core::{DrydockConfig, Node, NodeId, NodeLocks, NodeState, Role};
use drydock_exec::{CommandExecutor, SshTarget};
use drydock_state::NodeRepository;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::context::{DeploymentContext, StepType};
use crate::error::{RolloutError, RolloutResult};
use crate::health::verify_node_health;

/// Invoked with the whole context after every step mutation.
pub type ProgressCallback = Arc<dyn Fn(&DeploymentContext) + Send + Sync>;

/// A progress callback that forwards snapshots into an unbounded channel,
/// so slow consumers never hold up a strategy.
pub fn progress_channel() -> (ProgressCallback, mpsc::UnboundedReceiver<DeploymentContext>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: ProgressCallback = Arc::new(move |ctx: &DeploymentContext| {
        // Receiver gone means nobody is listening any more.
        let _ = tx.send(ctx.clone());
    });
    (callback, rx)
}

#[derive(Clone)]
pub struct Fleet {
    pub repo: Arc<dyn NodeRepository>,
    pub executor: Arc<dyn CommandExecutor>,
    pub locks: NodeLocks,
    pub health: HealthPollConfig,
    pub blue_green: BlueGreenConfig,
    pub maintenance_window: MaintenanceWindowConfig,
    progress: Option<ProgressCallback>,
}

impl Fleet {
    pub fn new(
        repo: Arc<dyn NodeRepository>,
        executor: Arc<dyn CommandExecutor>,
        locks: NodeLocks,
        config: &DrydockConfig,
    ) -> Self {
        Self {
            repo,
            executor,
            locks,
            health: config.health.clone(),
            blue_green: config.blue_green.clone(),
            maintenance_window: config.maintenance_window.clone(),
            progress: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn report(&self, ctx: &DeploymentContext) {
        if let Some(cb) = &self.progress {
            cb(ctx);
        }
    }

    // ── Lookups ───────────────────────────────────────────────────

    pub fn node(&self, node_id: &str) -> RolloutResult<Node> {
        self.repo
            .get_node(node_id)?
            .ok_or_else(|| RolloutError::NotFound(format!("node {node_id}")))
    }

    pub fn role(&self, name: &str) -> RolloutResult<Role> {
        self.repo
            .get_role_by_name(name)?
            .ok_or_else(|| RolloutError::NotFound(format!("role {name}")))
    }

    // ── State changes ─────────────────────────────────────────────

    pub fn set_state(&self, trigger: &str, node_id: &str, to: NodeState) -> RolloutResult<Node> {
        Ok(self.repo.update_node_state(node_id, to, trigger, None, true)?)
    }

    /// Move a node without consulting the transition table. Logged by the
    /// state machine.
    pub fn force_state(&self, trigger: &str, node_id: &str, to: NodeState) -> RolloutResult<Node> {
        Ok(self.repo.update_node_state(node_id, to, trigger, None, false)?)
    }

    /// DRAINING/PLANNED/IMMEDIATE -> OFFLINE -> RECOVERING.
    pub fn to_recovering(&self, trigger: &str, node_id: &str) -> RolloutResult<Node> {
        let node = self.node(node_id)?;
        let node = match node.state {
            NodeState::MaintenanceRecovering => return Ok(node),
            NodeState::MaintenanceOffline => node,
            _ => self.set_state(trigger, node_id, NodeState::MaintenanceOffline)?,
        };
        self.set_state(trigger, &node.id, NodeState::MaintenanceRecovering)
    }

    /// Park a node in ERROR after a failed phase.
    pub fn mark_error(&self, trigger: &str, node_id: &str, cause: &RolloutError) {
        error!(%node_id, %trigger, error = %cause, "marking node ERROR");
        let result = match self.set_state(trigger, node_id, NodeState::Error) {
            Err(RolloutError::State(drydock_state::StateError::InvalidTransition(_))) => {
                self.force_state(trigger, node_id, NodeState::Error)
            }
            other => other,
        };
        if let Err(e) = result {
            warn!(%node_id, error = %e, "could not mark node ERROR");
        }
    }

    // ── Steps ─────────────────────────────────────────────────────

    pub fn begin(
        &self,
        ctx: &mut DeploymentContext,
        step_type: StepType,
        node: &Node,
        description: &str,
    ) -> usize {
        let index = ctx.begin_step(step_type, node, description);
        self.report(ctx);
        index
    }

    /// Close step `index` with `result`'s outcome and pass the result on.
    pub fn end<T>(
        &self,
        ctx: &mut DeploymentContext,
        index: usize,
        result: RolloutResult<T>,
    ) -> RolloutResult<T> {
        ctx.finish_step(index, result.as_ref().err().map(ToString::to_string));
        self.report(ctx);
        result
    }

    // ── Remote work ───────────────────────────────────────────────

    /// Extra vars handed to every playbook run of this deployment.
    pub fn playbook_vars(ctx: &DeploymentContext) -> BTreeMap<String, String> {
        let mut vars = ctx.params.clone();
        vars.insert("drydock_role".to_string(), ctx.role.clone());
        vars.insert("drydock_deployment".to_string(), ctx.id.clone());
        vars
    }

    pub async fn run_playbook(
        &self,
        node: &Node,
        playbook: &str,
        vars: &BTreeMap<String, String>,
    ) -> RolloutResult<()> {
        let out = self
            .executor
            .run_playbook(&SshTarget::from(node), playbook, vars)
            .await?;
        if out.success() {
            Ok(())
        } else {
            Err(RolloutError::Playbook {
                node: node.name.clone(),
                playbook: playbook.to_string(),
                exit_code: out.exit_code,
                output: out.error_text(),
            })
        }
    }

    pub async fn verify(&self, node: &Node, role: &Role) -> RolloutResult<u32> {
        verify_node_health(self.executor.as_ref(), node, &role.health_checks, &self.health).await
    }

    /// Verify several nodes concurrently.
    pub async fn verify_many(
        &self,
        nodes: &[Node],
        role: &Role,
    ) -> HashMap<NodeId, RolloutResult<u32>> {
        let mut set = JoinSet::new();
        for node in nodes {
            let fleet = self.clone();
            let node = node.clone();
            let role = role.clone();
            set.spawn(async move {
                let result = fleet.verify(&node, &role).await;
                (node.id, result)
            });
        }
        collect(set, nodes).await
    }

    /// Run the playbook on several nodes concurrently.
    pub async fn run_playbook_many(
        &self,
        nodes: &[Node],
        playbook: &str,
        vars: &BTreeMap<String, String>,
    ) -> HashMap<NodeId, RolloutResult<()>> {
        let mut set = JoinSet::new();
        for node in nodes {
            let fleet = self.clone();
            let node = node.clone();
            let playbook = playbook.to_string();
            let vars = vars.clone();
            set.spawn(async move {
                let result = fleet.run_playbook(&node, &playbook, &vars).await;
                (node.id, result)
            });
        }
        collect(set, nodes).await
    }

    // ── Composite phases ──────────────────────────────────────────

    /// ONLINE/DEGRADED -> MAINTENANCE_DRAINING.
    pub fn drain(&self, ctx: &mut DeploymentContext, node: &Node) -> RolloutResult<Node> {
        let trigger = ctx.trigger();
        let index = self.begin(ctx, StepType::Drain, node, "drain node");
        let result = self.set_state(&trigger, &node.id, NodeState::MaintenanceDraining);
        info!(deployment = %ctx.id, node = %node.name, ok = result.is_ok(), "drain");
        self.end(ctx, index, result)
    }

    /// Run the deployment's playbook, if it has one.
    pub async fn deploy(&self, ctx: &mut DeploymentContext, node: &Node) -> RolloutResult<()> {
        let Some(playbook) = ctx.playbook.clone() else {
            return Ok(());
        };
        let vars = Self::playbook_vars(ctx);
        let index = self.begin(ctx, StepType::ExecutePlaybook, node, &format!("run {playbook}"));
        let result = self.run_playbook(node, &playbook, &vars).await;
        info!(deployment = %ctx.id, node = %node.name, %playbook, ok = result.is_ok(), "playbook");
        self.end(ctx, index, result)
    }

    /// Offline, recovering, health-checked, then ONLINE. A failed health
    /// check leaves the node in ERROR.
    pub async fn recover(
        &self,
        ctx: &mut DeploymentContext,
        node: &Node,
        role: &Role,
    ) -> RolloutResult<()> {
        let trigger = ctx.trigger();
        let index = self.begin(ctx, StepType::Recover, node, "take offline and begin recovery");
        let result = self.to_recovering(&trigger, &node.id);
        if let Err(e) = &result {
            self.mark_error(&trigger, &node.id, e);
        }
        let node = self.end(ctx, index, result)?;
        self.check_and_bring_online(ctx, &node, role).await
    }

    pub async fn check_and_bring_online(
        &self,
        ctx: &mut DeploymentContext,
        node: &Node,
        role: &Role,
    ) -> RolloutResult<()> {
        let trigger = ctx.trigger();
        let index = self.begin(ctx, StepType::HealthCheck, node, "poll health");
        let result = self.verify(node, role).await;
        if let Err(e) = &result {
            self.mark_error(&trigger, &node.id, e);
        }
        self.end(ctx, index, result)?;
        self.bring_online(ctx, node)
    }

    /// MAINTENANCE_RECOVERING -> ONLINE as a verify step.
    pub fn bring_online(&self, ctx: &mut DeploymentContext, node: &Node) -> RolloutResult<()> {
        let trigger = ctx.trigger();
        let index = self.begin(ctx, StepType::Verify, node, "bring online");
        let result = self
            .set_state(&trigger, &node.id, NodeState::Online)
            .map(|n| info!(deployment = %ctx.id, node = %n.name, "node online"));
        self.end(ctx, index, result)
    }

    /// Undo a finished node: back through recovery (bypassing the table,
    /// since ONLINE cannot enter recovery directly), run the rollback
    /// playbook if one was given, and verify.
    pub async fn rollback_node(
        &self,
        ctx: &mut DeploymentContext,
        node: &Node,
        role: &Role,
    ) -> RolloutResult<()> {
        let trigger = ctx.trigger();
        let rollback_playbook = ctx.param("rollback_playbook").map(str::to_string);
        let vars = Self::playbook_vars(ctx);

        let index = self.begin(ctx, StepType::Rollback, node, "roll back node");
        let result = async {
            let node = self.force_state(&trigger, &node.id, NodeState::MaintenanceRecovering)?;
            if let Some(playbook) = &rollback_playbook {
                self.run_playbook(&node, playbook, &vars).await?;
            }
            Ok::<Node, RolloutError>(node)
        }
        .await;
        if let Err(e) = &result {
            self.mark_error(&trigger, &node.id, e);
        }
        let node = self.end(ctx, index, result)?;
        warn!(deployment = %ctx.id, node = %node.name, "node rolled back");
        self.check_and_bring_online(ctx, &node, role).await
    }
}

async fn collect<T: Send + 'static>(
    mut set: JoinSet<(NodeId, RolloutResult<T>)>,
    nodes: &[Node],
) -> HashMap<NodeId, RolloutResult<T>> {
    let mut results = HashMap::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((id, result)) => {
                results.insert(id, result);
            }
            Err(e) => warn!(error = %e, "node task aborted"),
        }
    }
    for node in nodes {
        results
            .entry(node.id.clone())
            .or_insert_with(|| Err(RolloutError::Validation(format!("task for {} aborted", node.name))));
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use drydock_core::NewNode;
    use drydock_exec::ScriptedExecutor;
    use drydock_state::StateStore;

    use crate::context::StrategyKind;

    fn fleet() -> (Fleet, StateStore, ScriptedExecutor) {
        let store = StateStore::open_in_memory().unwrap();
        let exec = ScriptedExecutor::new();
        let mut config = DrydockConfig::default();
        config.health.poll_interval_ms = 1;
        config.health.max_retries = 2;
        let fleet = Fleet::new(
            Arc::new(store.clone()),
            Arc::new(exec.clone()),
            NodeLocks::new(),
            &config,
        );
        (fleet, store, exec)
    }

    fn ctx(nodes: Vec<NodeId>) -> DeploymentContext {
        DeploymentContext::new(
            "d1".to_string(),
            StrategyKind::Sequential,
            "web",
            nodes,
            Some("site.yml".to_string()),
            BTreeMap::from([("version".to_string(), "2".to_string())]),
        )
    }

    fn role() -> Role {
        Role {
            name: "web".to_string(),
            services: vec!["nginx".to_string()],
            stateful: false,
            service_type: None,
            required_capabilities: Default::default(),
            install_playbook: None,
            purge_playbook: None,
            health_checks: Vec::new(),
        }
    }

    #[tokio::test]
    async fn full_node_cycle_records_steps() {
        let (fleet, store, exec) = fleet();
        let node = store.create_node(NewNode::new("web-1", "10.0.0.1")).unwrap();
        let node = store
            .update_node_state(&node.id, NodeState::Online, "test", None, false)
            .unwrap();
        let mut ctx = ctx(vec![node.id.clone()]);

        fleet.drain(&mut ctx, &node).unwrap();
        fleet.deploy(&mut ctx, &node).await.unwrap();
        fleet.recover(&mut ctx, &node, &role()).await.unwrap();

        let types: Vec<_> = ctx.steps.iter().map(|s| s.step_type).collect();
        assert_eq!(
            types,
            vec![
                StepType::Drain,
                StepType::ExecutePlaybook,
                StepType::Recover,
                StepType::HealthCheck,
                StepType::Verify
            ]
        );
        assert!(ctx.steps.iter().all(|s| s.success == Some(true)));
        assert_eq!(store.get_node(&node.id).unwrap().unwrap().state, NodeState::Online);
        assert!(exec.ran("10.0.0.1", "playbook site.yml"));

        let transitions = store.get_state_transitions(&node.id, 10).unwrap();
        assert!(transitions.iter().all(|t| t.trigger == "deployment:d1" || t.trigger == "test"));
    }

    #[tokio::test]
    async fn failed_health_marks_error() {
        let (fleet, store, exec) = fleet();
        let node = store.create_node(NewNode::new("web-1", "10.0.0.1")).unwrap();
        store
            .update_node_state(&node.id, NodeState::MaintenanceDraining, "test", None, false)
            .unwrap();
        exec.set_unreachable("10.0.0.1", true);
        let mut ctx = ctx(vec![node.id.clone()]);

        let err = fleet.recover(&mut ctx, &node, &role()).await.unwrap_err();
        assert!(matches!(err, RolloutError::HealthCheck { .. }));
        assert_eq!(store.get_node(&node.id).unwrap().unwrap().state, NodeState::Error);
        assert_eq!(ctx.failed_steps().count(), 1);
    }

    #[tokio::test]
    async fn failed_recovery_entry_marks_error() {
        let (fleet, store, exec) = fleet();
        let node = store.create_node(NewNode::new("web-1", "10.0.0.1")).unwrap();
        store
            .update_node_state(&node.id, NodeState::Online, "test", None, false)
            .unwrap();
        let node = store
            .update_node_state(&node.id, NodeState::Degraded, "reconciler", None, false)
            .unwrap();
        let mut ctx = ctx(vec![node.id.clone()]);

        let err = fleet.recover(&mut ctx, &node, &role()).await.unwrap_err();

        assert!(matches!(err, RolloutError::State(_)));
        assert_eq!(store.get_node(&node.id).unwrap().unwrap().state, NodeState::Error);
        assert_eq!(ctx.failed_steps().count(), 1);
        assert_eq!(ctx.steps[0].step_type, StepType::Recover);
        assert!(exec.calls().is_empty());
    }

    #[tokio::test]
    async fn progress_channel_sees_every_mutation() {
        let (fleet, store, _exec) = fleet();
        let (callback, mut rx) = progress_channel();
        let fleet = fleet.with_progress(callback);
        let node = store.create_node(NewNode::new("web-1", "10.0.0.1")).unwrap();
        store
            .update_node_state(&node.id, NodeState::Online, "test", None, false)
            .unwrap();
        let mut ctx = ctx(vec![node.id.clone()]);

        fleet.drain(&mut ctx, &node).unwrap();

        let begun = rx.recv().await.unwrap();
        assert_eq!(begun.steps[0].success, None);
        let ended = rx.recv().await.unwrap();
        assert_eq!(ended.steps[0].success, Some(true));
    }
}
