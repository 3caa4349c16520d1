//! One node at a time, in list order.

use async_trait::async_trait;
use drydock_core::Role;
use tracing::{info, warn};

use crate::context::{DeploymentContext, DeploymentStatus, StrategyKind};
use crate::error::RolloutResult;
use crate::fleet::Fleet;
use crate::strategy::DeploymentStrategy;

/// Drain, run the playbook, recover, verify; then the next node.
///
/// A node that fails is left in ERROR. Nodes that already finished are
/// rolled back newest first and the deployment ends ROLLED_BACK; if none
/// had finished it ends FAILED. Later nodes are never touched.
pub struct SequentialStrategy;

#[async_trait]
impl DeploymentStrategy for SequentialStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Sequential
    }

    async fn execute(&self, ctx: &mut DeploymentContext, fleet: &Fleet) {
        let role = match fleet.role(&ctx.role) {
            Ok(role) => role,
            Err(e) => {
                ctx.fail_with(e.to_string());
                ctx.finish(DeploymentStatus::Failed);
                fleet.report(ctx);
                return;
            }
        };

        for node_id in ctx.nodes.clone() {
            match deploy_node(ctx, fleet, &node_id, &role).await {
                Ok(()) => {
                    ctx.completed_nodes.push(node_id);
                    fleet.report(ctx);
                }
                Err(e) => {
                    warn!(deployment = %ctx.id, %node_id, error = %e, "sequential rollout stopped");
                    ctx.fail_with(format!("node {node_id}: {e}"));
                    if ctx.completed_nodes.is_empty() {
                        ctx.finish(DeploymentStatus::Failed);
                    } else {
                        ctx.rollback_triggered = true;
                        let status = roll_back_completed(ctx, fleet, &role).await;
                        ctx.finish(status);
                    }
                    fleet.report(ctx);
                    return;
                }
            }
        }

        info!(deployment = %ctx.id, nodes = ctx.nodes.len(), "sequential rollout finished");
        ctx.finish(DeploymentStatus::Success);
        fleet.report(ctx);
    }

    async fn rollback(&self, ctx: &mut DeploymentContext, fleet: &Fleet) {
        rollback_deployment(ctx, fleet).await;
    }
}

async fn deploy_node(
    ctx: &mut DeploymentContext,
    fleet: &Fleet,
    node_id: &str,
    role: &Role,
) -> RolloutResult<()> {
    let trigger = ctx.trigger();
    let node = fleet.node(node_id)?;
    let node = fleet.drain(ctx, &node)?;
    if let Err(e) = fleet.deploy(ctx, &node).await {
        fleet.mark_error(&trigger, &node.id, &e);
        return Err(e);
    }
    fleet.recover(ctx, &node, role).await
}

/// Roll back every completed node, newest first.
///
/// Returns ROLLED_BACK if all of them came back, FAILED otherwise.
pub(crate) async fn roll_back_completed(
    ctx: &mut DeploymentContext,
    fleet: &Fleet,
    role: &Role,
) -> DeploymentStatus {
    let mut clean = true;
    let completed: Vec<_> = ctx.completed_nodes.iter().rev().cloned().collect();
    for node_id in completed {
        let result = match fleet.node(&node_id) {
            Ok(node) => fleet.rollback_node(ctx, &node, role).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => ctx.completed_nodes.retain(|id| id != &node_id),
            Err(e) => {
                warn!(deployment = %ctx.id, %node_id, error = %e, "rollback failed");
                ctx.fail_with(format!("rollback of {node_id}: {e}"));
                clean = false;
            }
        }
    }
    if clean {
        DeploymentStatus::RolledBack
    } else {
        DeploymentStatus::Failed
    }
}

/// Operator-triggered rollback shared by the in-place strategies.
pub(crate) async fn rollback_deployment(ctx: &mut DeploymentContext, fleet: &Fleet) {
    ctx.rollback_triggered = true;
    let status = match fleet.role(&ctx.role) {
        Ok(role) => roll_back_completed(ctx, fleet, &role).await,
        Err(e) => {
            ctx.fail_with(e.to_string());
            DeploymentStatus::Failed
        }
    };
    info!(deployment = %ctx.id, %status, "rollback finished");
    ctx.finish(status);
    fleet.report(ctx);
}
