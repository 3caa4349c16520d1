//! Deployment orchestrator — the active-deployment table and its lifecycle.
//!
//! A deployment is created QUEUED, optionally held (PAUSED) and resumed,
//! then executed on a background task through its strategy. While it runs
//! the orchestrator claims every target node in [`NodeLocks`] so the
//! reconciler leaves them alone; claims are released when the strategy
//! returns.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use drydock_core::{DrydockConfig, NodeId, NodeLocks};
use drydock_exec::CommandExecutor;
use drydock_state::NodeRepository;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::blue_green::DONOR_ROLE;
use crate::context::{DeploymentContext, DeploymentStatus, StrategyKind};
use crate::error::{RolloutError, RolloutResult};
use crate::fleet::{Fleet, ProgressCallback};
use crate::maintenance_window::{PARALLEL, parse_bool, scheduled_start};
use crate::strategy::strategy_for;

type DeploymentTable = Arc<RwLock<HashMap<String, DeploymentContext>>>;

#[derive(Clone)]
pub struct Orchestrator {
    repo: Arc<dyn NodeRepository>,
    executor: Arc<dyn CommandExecutor>,
    locks: NodeLocks,
    config: DrydockConfig,
    deployments: DeploymentTable,
    on_progress: Option<ProgressCallback>,
}

impl Orchestrator {
    pub fn new(
        repo: Arc<dyn NodeRepository>,
        executor: Arc<dyn CommandExecutor>,
        locks: NodeLocks,
        config: DrydockConfig,
    ) -> Self {
        Self {
            repo,
            executor,
            locks,
            config,
            deployments: Arc::new(RwLock::new(HashMap::new())),
            on_progress: None,
        }
    }

    /// Receive a snapshot of the context after every step and status change.
    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// A fleet whose progress reports also refresh the deployment table.
    fn fleet(&self) -> Fleet {
        let table = Arc::clone(&self.deployments);
        let user = self.on_progress.clone();
        let progress: ProgressCallback = Arc::new(move |ctx: &DeploymentContext| {
            table
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .insert(ctx.id.clone(), ctx.clone());
            if let Some(cb) = &user {
                cb(ctx);
            }
        });
        Fleet::new(
            Arc::clone(&self.repo),
            Arc::clone(&self.executor),
            self.locks.clone(),
            &self.config,
        )
        .with_progress(progress)
    }

    fn notify(&self, ctx: &DeploymentContext) {
        if let Some(cb) = &self.on_progress {
            cb(ctx);
        }
    }

    // ── Creation ──────────────────────────────────────────────────

    /// Validate and queue a deployment. Nothing is stored on failure.
    ///
    /// The playbook defaults to the role's install playbook.
    pub fn create_deployment(
        &self,
        role: &str,
        nodes: &[NodeId],
        strategy: StrategyKind,
        playbook: Option<&str>,
        params: BTreeMap<String, String>,
    ) -> RolloutResult<DeploymentContext> {
        if nodes.is_empty() {
            return Err(RolloutError::Validation(
                "a deployment needs at least one node".into(),
            ));
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = nodes.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(RolloutError::Validation(format!("node {dup} listed twice")));
        }

        let role = self
            .repo
            .get_role_by_name(role)?
            .ok_or_else(|| RolloutError::NotFound(format!("role {role}")))?;
        for node_id in nodes {
            let node = self
                .repo
                .get_node(node_id)?
                .ok_or_else(|| RolloutError::NotFound(format!("node {node_id}")))?;
            if !node.has_capabilities(&role.required_capabilities) {
                let missing: Vec<_> = role
                    .required_capabilities
                    .difference(&node.capabilities)
                    .cloned()
                    .collect();
                return Err(RolloutError::Validation(format!(
                    "node {} lacks capabilities required by {}: {}",
                    node.name,
                    role.name,
                    missing.join(", ")
                )));
            }
        }

        let id = format!("dep-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let playbook = playbook
            .map(str::to_string)
            .or_else(|| role.install_playbook.clone());
        let ctx = DeploymentContext::new(id, strategy, &role.name, nodes.to_vec(), playbook, params);

        scheduled_start(&ctx)?;
        if let Some(raw) = ctx.param(PARALLEL) {
            parse_bool(PARALLEL, raw)?;
        }
        if let Some(donor) = ctx.param(DONOR_ROLE)
            && self.repo.get_role_by_name(donor)?.is_none()
        {
            return Err(RolloutError::NotFound(format!("role {donor}")));
        }

        info!(
            deployment = %ctx.id,
            role = %ctx.role,
            strategy = %ctx.strategy,
            nodes = ctx.nodes.len(),
            "deployment queued"
        );
        self.deployments
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(ctx.id.clone(), ctx.clone());
        self.notify(&ctx);
        Ok(ctx)
    }

    // ── Queries ───────────────────────────────────────────────────

    pub fn get_deployment(&self, id: &str) -> Option<DeploymentContext> {
        self.deployments
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    /// Oldest first.
    pub fn list_deployments(&self) -> Vec<DeploymentContext> {
        let mut all: Vec<_> = self
            .deployments
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|c| (c.created_at, c.sequence));
        all
    }

    // ── Status changes ────────────────────────────────────────────

    /// Atomically move `id` from one of `allowed` to `to`.
    fn change_status(
        &self,
        id: &str,
        allowed: &[DeploymentStatus],
        to: DeploymentStatus,
        action: &'static str,
    ) -> RolloutResult<DeploymentContext> {
        let ctx = {
            let mut table = self.deployments.write().unwrap_or_else(|p| p.into_inner());
            let ctx = table
                .get_mut(id)
                .ok_or_else(|| RolloutError::NotFound(format!("deployment {id}")))?;
            if !allowed.contains(&ctx.status) {
                return Err(RolloutError::InvalidStatus {
                    id: id.to_string(),
                    status: ctx.status,
                    action,
                });
            }
            if to.is_terminal() {
                ctx.finish(to);
            } else {
                ctx.status = to;
            }
            ctx.clone()
        };
        info!(deployment = %id, status = %to, "deployment {action}");
        self.notify(&ctx);
        Ok(ctx)
    }

    pub fn cancel_deployment(&self, id: &str) -> RolloutResult<DeploymentContext> {
        self.change_status(
            id,
            &[DeploymentStatus::Queued, DeploymentStatus::Paused],
            DeploymentStatus::Cancelled,
            "cancel",
        )
    }

    pub fn pause_deployment(&self, id: &str) -> RolloutResult<DeploymentContext> {
        self.change_status(
            id,
            &[DeploymentStatus::Queued],
            DeploymentStatus::Paused,
            "pause",
        )
    }

    pub fn resume_deployment(&self, id: &str) -> RolloutResult<DeploymentContext> {
        self.change_status(
            id,
            &[DeploymentStatus::Paused],
            DeploymentStatus::Queued,
            "resume",
        )
    }

    // ── Execution ─────────────────────────────────────────────────

    /// Start a QUEUED deployment on a background task.
    ///
    /// The deployment is RUNNING by the time this returns. The handle
    /// resolves to the final context, which is also kept in the table.
    pub fn execute_deployment(&self, id: &str) -> RolloutResult<JoinHandle<DeploymentContext>> {
        let mut ctx = {
            let mut table = self.deployments.write().unwrap_or_else(|p| p.into_inner());
            let ctx = table
                .get_mut(id)
                .ok_or_else(|| RolloutError::NotFound(format!("deployment {id}")))?;
            if ctx.status != DeploymentStatus::Queued {
                return Err(RolloutError::InvalidStatus {
                    id: id.to_string(),
                    status: ctx.status,
                    action: "execute",
                });
            }
            ctx.status = DeploymentStatus::Running;
            ctx.started_at = Some(drydock_core::clock::epoch_secs());
            ctx.clone()
        };
        self.notify(&ctx);

        let fleet = self.fleet();
        let strategy = strategy_for(ctx.strategy);
        Ok(tokio::spawn(async move {
            let owner = ctx.id.clone();
            match claim_all(&fleet.locks, &owner, &ctx.nodes) {
                Ok(()) => {
                    info!(deployment = %owner, strategy = %ctx.strategy, "deployment started");
                    strategy.execute(&mut ctx, &fleet).await;
                    fleet.locks.release_all(&owner);
                }
                Err(e) => {
                    warn!(deployment = %owner, error = %e, "deployment could not claim its nodes");
                    ctx.fail_with(e.to_string());
                    ctx.finish(DeploymentStatus::Failed);
                }
            }
            if !ctx.status.is_terminal() {
                ctx.fail_with(format!("{} strategy ended without a result", ctx.strategy));
                ctx.finish(DeploymentStatus::Failed);
            }
            info!(deployment = %owner, status = %ctx.status, "deployment finished");
            fleet.report(&ctx);
            ctx
        }))
    }

    /// Undo a finished deployment through its strategy.
    ///
    /// Allowed from SUCCESS or FAILED. Runs to completion before returning.
    /// If another deployment holds one of the nodes the status is left as
    /// it was and the claim error is returned.
    pub async fn trigger_rollback(&self, id: &str) -> RolloutResult<DeploymentContext> {
        let previous = self.get_deployment(id).map(|c| c.status);
        let mut ctx = self.change_status(
            id,
            &[DeploymentStatus::Success, DeploymentStatus::Failed],
            DeploymentStatus::Running,
            "roll back",
        )?;

        let fleet = self.fleet();
        let owner = ctx.id.clone();
        let mut touched = ctx.nodes.clone();
        if let Some(state) = &ctx.blue_green {
            touched.extend(state.green.iter().cloned());
        }
        if let Err(e) = claim_all(&fleet.locks, &owner, &touched) {
            warn!(deployment = %owner, error = %e, "rollback could not claim its nodes");
            ctx.status = previous.unwrap_or(DeploymentStatus::Failed);
            fleet.report(&ctx);
            return Err(e);
        }

        warn!(deployment = %owner, "rollback triggered");
        strategy_for(ctx.strategy).rollback(&mut ctx, &fleet).await;
        fleet.locks.release_all(&owner);
        fleet.report(&ctx);
        Ok(ctx)
    }
}

/// Claim every node for `owner`, or none of them.
fn claim_all(locks: &NodeLocks, owner: &str, nodes: &[NodeId]) -> RolloutResult<()> {
    for node_id in nodes {
        if !locks.try_claim(node_id, owner) {
            let holder = locks.owner(node_id).unwrap_or_default();
            locks.release_all(owner);
            return Err(RolloutError::Claimed {
                node: node_id.clone(),
                owner: holder,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use drydock_core::{HealthCheck, NodeState};
    use drydock_exec::{CommandOutput, Reply};

    use crate::context::StepType;
    use crate::fleet::progress_channel;
    use crate::testutil::{Harness, harness};

    fn orchestrator(h: &Harness) -> Orchestrator {
        Orchestrator::new(
            Arc::new(h.store.clone()),
            Arc::new(h.exec.clone()),
            h.locks.clone(),
            h.config.clone(),
        )
    }

    fn ids(nodes: &[&drydock_core::Node]) -> Vec<NodeId> {
        nodes.iter().map(|n| n.id.clone()).collect()
    }

    #[tokio::test]
    async fn create_is_queued_with_role_playbook() {
        let h = harness();
        let mut role = h.role("web", &[]);
        role.install_playbook = Some("web.yml".into());
        drydock_state::NodeRepository::put_role(&h.store, &role).unwrap();
        let a = h.online_node("a", Some("web"));
        let orch = orchestrator(&h);

        let ctx = orch
            .create_deployment("web", &ids(&[&a]), StrategyKind::Sequential, None, BTreeMap::new())
            .unwrap();

        assert!(ctx.id.starts_with("dep-"));
        assert_eq!(ctx.status, DeploymentStatus::Queued);
        assert_eq!(ctx.playbook.as_deref(), Some("web.yml"));
        assert!(ctx.steps.is_empty());
        assert_eq!(orch.get_deployment(&ctx.id).unwrap().status, DeploymentStatus::Queued);
    }

    #[tokio::test]
    async fn create_rejects_bad_requests_without_side_effects() {
        let h = harness();
        h.role("db", &["ssd"]);
        h.role("web", &[]);
        let a = h.online_node("a", None);
        let orch = orchestrator(&h);
        let seq = StrategyKind::Sequential;

        let empty = orch.create_deployment("db", &[], seq, None, BTreeMap::new());
        assert!(matches!(empty, Err(RolloutError::Validation(_))));

        let dup = orch.create_deployment("db", &ids(&[&a, &a]), seq, None, BTreeMap::new());
        assert!(matches!(dup, Err(RolloutError::Validation(_))));

        let no_role = orch.create_deployment("nope", &ids(&[&a]), seq, None, BTreeMap::new());
        assert!(matches!(no_role, Err(RolloutError::NotFound(_))));

        let no_node =
            orch.create_deployment("db", &["node-missing".to_string()], seq, None, BTreeMap::new());
        assert!(matches!(no_node, Err(RolloutError::NotFound(_))));

        let caps = orch.create_deployment("db", &ids(&[&a]), seq, None, BTreeMap::new());
        match caps {
            Err(RolloutError::Validation(msg)) => assert!(msg.contains("ssd")),
            other => panic!("expected capability error, got {other:?}"),
        }

        let params = BTreeMap::from([("scheduled_start".to_string(), "soon".to_string())]);
        let bad_start = orch.create_deployment(
            "web",
            &ids(&[&a]),
            StrategyKind::MaintenanceWindow,
            None,
            params,
        );
        assert!(matches!(bad_start, Err(RolloutError::Validation(_))));

        let params = BTreeMap::from([("donor_role".to_string(), "ghost".to_string())]);
        let bad_donor =
            orch.create_deployment("web", &ids(&[&a]), StrategyKind::BlueGreen, None, params);
        assert!(matches!(bad_donor, Err(RolloutError::NotFound(_))));

        assert!(orch.list_deployments().is_empty());
        assert_eq!(h.state(&a.id), NodeState::Online);
    }

    #[tokio::test]
    async fn execute_runs_in_background_and_records_result() {
        let h = harness();
        h.role("web", &[]);
        let a = h.online_node("a", Some("web"));
        let b = h.online_node("b", Some("web"));
        let (progress, mut rx) = progress_channel();
        let orch = orchestrator(&h).with_progress_callback(progress);

        let ctx = orch
            .create_deployment(
                "web",
                &ids(&[&a, &b]),
                StrategyKind::Sequential,
                Some("site.yml"),
                BTreeMap::new(),
            )
            .unwrap();
        let handle = orch.execute_deployment(&ctx.id).unwrap();
        assert_ne!(orch.get_deployment(&ctx.id).unwrap().status, DeploymentStatus::Queued);

        let done = handle.await.unwrap();
        assert_eq!(done.status, DeploymentStatus::Success);
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());
        assert_eq!(orch.get_deployment(&ctx.id).unwrap().status, DeploymentStatus::Success);
        assert!(!h.locks.is_claimed(&a.id));
        assert!(!h.locks.is_claimed(&b.id));
        assert!(h.exec.ran(&a.address, "playbook site.yml"));

        let mut last = None;
        while let Ok(snapshot) = rx.try_recv() {
            last = Some(snapshot);
        }
        assert_eq!(last.unwrap().status, DeploymentStatus::Success);
    }

    #[tokio::test]
    async fn execute_only_from_queued() {
        let h = harness();
        h.role("web", &[]);
        let a = h.online_node("a", Some("web"));
        let orch = orchestrator(&h);
        let ctx = orch
            .create_deployment("web", &ids(&[&a]), StrategyKind::Sequential, None, BTreeMap::new())
            .unwrap();

        orch.execute_deployment(&ctx.id).unwrap().await.unwrap();

        match orch.execute_deployment(&ctx.id) {
            Err(RolloutError::InvalidStatus { status, action, .. }) => {
                assert_eq!(status, DeploymentStatus::Success);
                assert_eq!(action, "execute");
            }
            other => panic!("expected InvalidStatus, got {:?}", other.map(|_| ())),
        }
        assert!(matches!(
            orch.execute_deployment("dep-unknown"),
            Err(RolloutError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_pause_and_resume() {
        let h = harness();
        h.role("web", &[]);
        let a = h.online_node("a", Some("web"));
        let orch = orchestrator(&h);
        let ctx = orch
            .create_deployment("web", &ids(&[&a]), StrategyKind::Sequential, None, BTreeMap::new())
            .unwrap();

        assert_eq!(orch.pause_deployment(&ctx.id).unwrap().status, DeploymentStatus::Paused);
        assert!(orch.execute_deployment(&ctx.id).is_err());
        assert_eq!(orch.resume_deployment(&ctx.id).unwrap().status, DeploymentStatus::Queued);

        let cancelled = orch.cancel_deployment(&ctx.id).unwrap();
        assert_eq!(cancelled.status, DeploymentStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
        assert!(orch.cancel_deployment(&ctx.id).is_err());
        assert!(orch.execute_deployment(&ctx.id).is_err());
        assert!(h.exec.calls().is_empty());
    }

    #[tokio::test]
    async fn cancel_refused_once_finished() {
        let h = harness();
        h.role("web", &[]);
        let a = h.online_node("a", Some("web"));
        let orch = orchestrator(&h);
        let ctx = orch
            .create_deployment("web", &ids(&[&a]), StrategyKind::Sequential, None, BTreeMap::new())
            .unwrap();
        orch.execute_deployment(&ctx.id).unwrap().await.unwrap();

        assert!(matches!(
            orch.cancel_deployment(&ctx.id),
            Err(RolloutError::InvalidStatus { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_refused_while_running() {
        let h = harness();
        let mut role = h.role("web", &[]);
        role.health_checks = vec![HealthCheck::Command {
            command: "web-ready".to_string(),
        }];
        drydock_state::NodeRepository::put_role(&h.store, &role).unwrap();
        h.exec.on(
            "web-ready",
            Reply::Slow(Duration::from_millis(200), CommandOutput::ok("")),
        );
        let a = h.online_node("a", Some("web"));
        let orch = orchestrator(&h);
        let ctx = orch
            .create_deployment("web", &ids(&[&a]), StrategyKind::Sequential, None, BTreeMap::new())
            .unwrap();

        let handle = orch.execute_deployment(&ctx.id).unwrap();
        match orch.cancel_deployment(&ctx.id) {
            Err(RolloutError::InvalidStatus { status, action, .. }) => {
                assert_eq!(status, DeploymentStatus::Running);
                assert_eq!(action, "cancel");
            }
            other => panic!("expected InvalidStatus, got {other:?}"),
        }
        assert_eq!(orch.get_deployment(&ctx.id).unwrap().status, DeploymentStatus::Running);

        let done = handle.await.unwrap();
        assert_eq!(done.status, DeploymentStatus::Success);
        assert!(done.error.is_none());
        assert_eq!(orch.get_deployment(&ctx.id).unwrap().status, DeploymentStatus::Success);
        assert_eq!(h.state(&a.id), NodeState::Online);
        assert!(h.exec.ran(&a.address, "web-ready"));
    }

    #[tokio::test]
    async fn node_claimed_elsewhere_fails_without_touching_it() {
        let h = harness();
        h.role("web", &[]);
        let a = h.online_node("a", Some("web"));
        let b = h.online_node("b", Some("web"));
        assert!(h.locks.try_claim(&b.id, "dep-other"));
        let orch = orchestrator(&h);
        let ctx = orch
            .create_deployment(
                "web",
                &ids(&[&a, &b]),
                StrategyKind::Sequential,
                Some("site.yml"),
                BTreeMap::new(),
            )
            .unwrap();

        let done = orch.execute_deployment(&ctx.id).unwrap().await.unwrap();

        assert_eq!(done.status, DeploymentStatus::Failed);
        assert!(done.error.as_deref().unwrap().contains("dep-other"));
        assert!(done.steps.is_empty());
        assert_eq!(h.state(&a.id), NodeState::Online);
        assert!(!h.locks.is_claimed(&a.id));
        assert_eq!(h.locks.owner(&b.id).as_deref(), Some("dep-other"));
    }

    #[tokio::test]
    async fn rollback_after_success() {
        let h = harness();
        h.role("web", &[]);
        let a = h.online_node("a", Some("web"));
        let b = h.online_node("b", Some("web"));
        let orch = orchestrator(&h);
        let ctx = orch
            .create_deployment(
                "web",
                &ids(&[&a, &b]),
                StrategyKind::Sequential,
                Some("site.yml"),
                BTreeMap::new(),
            )
            .unwrap();

        assert!(matches!(
            orch.trigger_rollback(&ctx.id).await,
            Err(RolloutError::InvalidStatus { .. })
        ));

        orch.execute_deployment(&ctx.id).unwrap().await.unwrap();
        let rolled = orch.trigger_rollback(&ctx.id).await.unwrap();

        assert_eq!(rolled.status, DeploymentStatus::RolledBack);
        assert!(rolled.rollback_triggered);
        assert_eq!(
            rolled.steps.iter().filter(|s| s.step_type == StepType::Rollback).count(),
            2
        );
        assert_eq!(orch.get_deployment(&ctx.id).unwrap().status, DeploymentStatus::RolledBack);
        assert_eq!(h.state(&a.id), NodeState::Online);
        assert!(!h.locks.is_claimed(&a.id));
    }

    #[tokio::test]
    async fn rollback_refused_while_nodes_are_claimed() {
        let h = harness();
        h.role("web", &[]);
        let a = h.online_node("a", Some("web"));
        let orch = orchestrator(&h);
        let ctx = orch
            .create_deployment("web", &ids(&[&a]), StrategyKind::Sequential, None, BTreeMap::new())
            .unwrap();
        orch.execute_deployment(&ctx.id).unwrap().await.unwrap();
        assert!(h.locks.try_claim(&a.id, "dep-other"));

        let err = orch.trigger_rollback(&ctx.id).await.unwrap_err();

        assert!(matches!(err, RolloutError::Claimed { .. }));
        assert_eq!(orch.get_deployment(&ctx.id).unwrap().status, DeploymentStatus::Success);
    }

    #[tokio::test]
    async fn list_is_oldest_first() {
        let h = harness();
        h.role("web", &[]);
        let a = h.online_node("a", Some("web"));
        let orch = orchestrator(&h);
        let mut created = Vec::new();
        for _ in 0..3 {
            created.push(
                orch.create_deployment(
                    "web",
                    &ids(&[&a]),
                    StrategyKind::Sequential,
                    None,
                    BTreeMap::new(),
                )
                .unwrap(),
            );
        }

        // Force a shared timestamp so only creation order can separate them.
        {
            let mut table = orch.deployments.write().unwrap();
            for ctx in table.values_mut() {
                ctx.created_at = 1_700_000_000;
            }
        }

        let listed: Vec<_> = orch.list_deployments().into_iter().map(|c| c.id).collect();
        let expected: Vec<_> = created.into_iter().map(|c| c.id).collect();
        assert_eq!(listed, expected);
    }
}
