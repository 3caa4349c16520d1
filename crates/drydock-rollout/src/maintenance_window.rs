//! Take every target down together inside one window.

use std::time::Duration;

use async_trait::async_trait;
use drydock_core::clock::epoch_secs;
use drydock_core::{Node, Role};
use tracing::{info, warn};

use crate::context::{DeploymentContext, DeploymentStatus, StepType, StrategyKind};
use crate::error::{RolloutError, RolloutResult};
use crate::fleet::Fleet;
use crate::sequential::rollback_deployment;
use crate::strategy::DeploymentStrategy;

/// Unix seconds to wait for before draining.
pub const SCHEDULED_START: &str = "scheduled_start";
/// Run the playbook on all nodes at once instead of one by one.
pub const PARALLEL: &str = "parallel";

pub fn parse_bool(key: &str, value: &str) -> RolloutResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(RolloutError::Validation(format!(
            "{key} must be a boolean, got {other:?}"
        ))),
    }
}

pub fn scheduled_start(ctx: &DeploymentContext) -> RolloutResult<Option<u64>> {
    ctx.param(SCHEDULED_START)
        .map(|raw| {
            raw.trim().parse::<u64>().map_err(|_| {
                RolloutError::Validation(format!("{SCHEDULED_START} must be unix seconds, got {raw:?}"))
            })
        })
        .transpose()
}

pub struct MaintenanceWindowStrategy;

#[async_trait]
impl DeploymentStrategy for MaintenanceWindowStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::MaintenanceWindow
    }

    async fn execute(&self, ctx: &mut DeploymentContext, fleet: &Fleet) {
        let (role, start, parallel, nodes) = match prepare(ctx, fleet) {
            Ok(prepared) => prepared,
            Err(e) => {
                ctx.fail_with(e.to_string());
                ctx.finish(DeploymentStatus::Failed);
                fleet.report(ctx);
                return;
            }
        };

        if let Some(start) = start {
            let now = epoch_secs();
            if start > now {
                info!(deployment = %ctx.id, wait_secs = start - now, "waiting for maintenance window");
                tokio::time::sleep(Duration::from_secs(start - now)).await;
            }
        }
        info!(deployment = %ctx.id, nodes = nodes.len(), parallel, "maintenance window open");

        let mut drained = Vec::with_capacity(nodes.len());
        for node in &nodes {
            match fleet.drain(ctx, node) {
                Ok(node) => drained.push(node),
                Err(e) => {
                    abort(ctx, fleet, &drained, &role, format!("drain of {} failed: {e}", node.name)).await;
                    return;
                }
            }
        }

        if let Err(e) = run_playbooks(ctx, fleet, &drained, parallel).await {
            abort(ctx, fleet, &drained, &role, e.to_string()).await;
            return;
        }

        let failures = recover_all(ctx, fleet, &drained, &role).await;
        if failures.is_empty() {
            ctx.completed_nodes = drained.iter().map(|n| n.id.clone()).collect();
            ctx.finish(DeploymentStatus::Success);
            info!(deployment = %ctx.id, "maintenance window closed");
        } else {
            ctx.fail_with(format!("recovery failed: {}", failures.join("; ")));
            ctx.finish(DeploymentStatus::Failed);
        }
        fleet.report(ctx);
    }

    async fn rollback(&self, ctx: &mut DeploymentContext, fleet: &Fleet) {
        rollback_deployment(ctx, fleet).await;
    }
}

/// Everything the window needs, checked before any node is touched.
fn prepare(
    ctx: &DeploymentContext,
    fleet: &Fleet,
) -> RolloutResult<(Role, Option<u64>, bool, Vec<Node>)> {
    let role = fleet.role(&ctx.role)?;
    let start = scheduled_start(ctx)?;
    let parallel = match ctx.param(PARALLEL) {
        Some(raw) => parse_bool(PARALLEL, raw)?,
        None => fleet.maintenance_window.parallel,
    };
    let nodes = ctx
        .nodes
        .iter()
        .map(|id| fleet.node(id))
        .collect::<RolloutResult<Vec<_>>>()?;
    Ok((role, start, parallel, nodes))
}

async fn run_playbooks(
    ctx: &mut DeploymentContext,
    fleet: &Fleet,
    nodes: &[Node],
    parallel: bool,
) -> RolloutResult<()> {
    let Some(playbook) = ctx.playbook.clone() else {
        return Ok(());
    };
    if !parallel {
        for node in nodes {
            fleet.deploy(ctx, node).await?;
        }
        return Ok(());
    }

    let vars = Fleet::playbook_vars(ctx);
    let description = format!("run {playbook}");
    let steps: Vec<_> = nodes
        .iter()
        .map(|n| fleet.begin(ctx, StepType::ExecutePlaybook, n, &description))
        .collect();
    let mut results = fleet.run_playbook_many(nodes, &playbook, &vars).await;

    let mut first_error = None;
    for (node, index) in nodes.iter().zip(steps) {
        let result = results
            .remove(&node.id)
            .unwrap_or_else(|| Err(RolloutError::Validation(format!("no result for {}", node.name))));
        if let Err(e) = fleet.end(ctx, index, result) {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Bring every drained node back, checking health concurrently. Returns a
/// description of each node that did not make it.
async fn recover_all(
    ctx: &mut DeploymentContext,
    fleet: &Fleet,
    nodes: &[Node],
    role: &Role,
) -> Vec<String> {
    let trigger = ctx.trigger();
    let mut failures = Vec::new();

    let mut recovering = Vec::with_capacity(nodes.len());
    for node in nodes {
        let index = fleet.begin(ctx, StepType::Recover, node, "take offline and begin recovery");
        let result = fleet.to_recovering(&trigger, &node.id);
        match fleet.end(ctx, index, result) {
            Ok(node) => recovering.push(node),
            Err(e) => failures.push(format!("{}: {e}", node.name)),
        }
    }

    let steps: Vec<_> = recovering
        .iter()
        .map(|n| fleet.begin(ctx, StepType::HealthCheck, n, "poll health"))
        .collect();
    let mut results = fleet.verify_many(&recovering, role).await;

    for (node, index) in recovering.iter().zip(steps) {
        let result = results
            .remove(&node.id)
            .unwrap_or_else(|| Err(RolloutError::Validation(format!("no result for {}", node.name))));
        if let Err(e) = &result {
            fleet.mark_error(&trigger, &node.id, e);
        }
        let outcome = fleet
            .end(ctx, index, result)
            .and_then(|_| fleet.bring_online(ctx, node));
        if let Err(e) = outcome {
            failures.push(format!("{}: {e}", node.name));
        }
    }
    failures
}

/// Give up on the window but never leave drained nodes in maintenance.
async fn abort(
    ctx: &mut DeploymentContext,
    fleet: &Fleet,
    drained: &[Node],
    role: &Role,
    cause: String,
) {
    warn!(deployment = %ctx.id, %cause, "maintenance window aborted");
    ctx.fail_with(cause);
    let failures = recover_all(ctx, fleet, drained, role).await;
    for failure in failures {
        warn!(deployment = %ctx.id, %failure, "node not recovered after abort");
    }
    ctx.finish(DeploymentStatus::Failed);
    fleet.report(ctx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use drydock_core::NodeState;

    use crate::testutil::{context, harness};

    #[test]
    fn bool_params() {
        assert!(parse_bool(PARALLEL, "Yes").unwrap());
        assert!(!parse_bool(PARALLEL, "0").unwrap());
        assert!(parse_bool(PARALLEL, "maybe").is_err());
    }

    #[tokio::test]
    async fn drains_all_before_any_playbook() {
        let h = harness();
        h.role("db", &[]);
        let a = h.online_node("a", Some("db"));
        let b = h.online_node("b", Some("db"));
        let mut ctx = context(StrategyKind::MaintenanceWindow, "db", &[&a, &b], Some("patch.yml"));

        MaintenanceWindowStrategy.execute(&mut ctx, &h.fleet).await;

        assert_eq!(ctx.status, DeploymentStatus::Success);
        let kinds: Vec<_> = ctx.steps.iter().map(|s| s.step_type).collect();
        let last_drain = kinds.iter().rposition(|k| *k == StepType::Drain).unwrap();
        let first_playbook = kinds
            .iter()
            .position(|k| *k == StepType::ExecutePlaybook)
            .unwrap();
        assert!(last_drain < first_playbook);
        assert_eq!(h.state(&a.id), NodeState::Online);
        assert_eq!(h.state(&b.id), NodeState::Online);
    }

    #[tokio::test]
    async fn parallel_playbooks_run_everywhere() {
        let h = harness();
        h.role("db", &[]);
        let a = h.online_node("a", Some("db"));
        let b = h.online_node("b", Some("db"));
        let mut ctx = context(StrategyKind::MaintenanceWindow, "db", &[&a, &b], Some("patch.yml"));
        ctx.params.insert(PARALLEL.to_string(), "true".to_string());

        MaintenanceWindowStrategy.execute(&mut ctx, &h.fleet).await;

        assert_eq!(ctx.status, DeploymentStatus::Success);
        assert!(h.exec.ran(&a.address, "playbook patch.yml"));
        assert!(h.exec.ran(&b.address, "playbook patch.yml"));
        assert_eq!(ctx.completed_nodes.len(), 2);
    }

    #[tokio::test]
    async fn playbook_failure_recovers_every_drained_node() {
        let h = harness();
        h.role("db", &[]);
        let a = h.online_node("a", Some("db"));
        let b = h.online_node("b", Some("db"));
        h.exec.fail_playbooks_on(&b.address);
        let mut ctx = context(StrategyKind::MaintenanceWindow, "db", &[&a, &b], Some("patch.yml"));
        ctx.params.insert(PARALLEL.to_string(), "true".to_string());

        MaintenanceWindowStrategy.execute(&mut ctx, &h.fleet).await;

        assert_eq!(ctx.status, DeploymentStatus::Failed);
        assert!(ctx.error.as_deref().unwrap().contains("patch.yml"));
        assert!(!h.state(&a.id).is_maintenance());
        assert!(!h.state(&b.id).is_maintenance());
        assert!(ctx.completed_nodes.is_empty());
    }

    #[tokio::test]
    async fn unhealthy_node_fails_window() {
        let h = harness();
        h.role("db", &[]);
        let a = h.online_node("a", Some("db"));
        let b = h.online_node("b", Some("db"));
        let mut ctx = context(StrategyKind::MaintenanceWindow, "db", &[&a, &b], None);
        h.exec.set_unreachable(&b.address, true);

        MaintenanceWindowStrategy.execute(&mut ctx, &h.fleet).await;

        assert_eq!(ctx.status, DeploymentStatus::Failed);
        assert_eq!(h.state(&a.id), NodeState::Online);
        assert_eq!(h.state(&b.id), NodeState::Error);
    }

    #[tokio::test]
    async fn past_start_time_runs_immediately() {
        let h = harness();
        h.role("db", &[]);
        let a = h.online_node("a", Some("db"));
        let mut ctx = context(StrategyKind::MaintenanceWindow, "db", &[&a], None);
        ctx.params
            .insert(SCHEDULED_START.to_string(), (epoch_secs() - 10).to_string());

        tokio::time::timeout(
            Duration::from_secs(5),
            MaintenanceWindowStrategy.execute(&mut ctx, &h.fleet),
        )
        .await
        .unwrap();
        assert_eq!(ctx.status, DeploymentStatus::Success);
    }

    #[tokio::test]
    async fn bad_schedule_fails_before_touching_nodes() {
        let h = harness();
        h.role("db", &[]);
        let a = h.online_node("a", Some("db"));
        let mut ctx = context(StrategyKind::MaintenanceWindow, "db", &[&a], None);
        ctx.params
            .insert(SCHEDULED_START.to_string(), "tomorrow".to_string());

        MaintenanceWindowStrategy.execute(&mut ctx, &h.fleet).await;

        assert_eq!(ctx.status, DeploymentStatus::Failed);
        assert!(ctx.steps.is_empty());
        assert_eq!(h.state(&a.id), NodeState::Online);
    }
}
