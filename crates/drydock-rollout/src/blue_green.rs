//! Blue-green with borrowed capacity.
//!
//! The targets are blue. An equal number of green nodes is taken from
//! spares first, then borrowed from a donor role. Green nodes are drained,
//! receive the playbook, take over the role and come online; blue nodes
//! then lose the role and stay around idle.
//!
//! Failure before the switch returns every green node to where it came
//! from and leaves blue untouched. Failure part-way through the switch is
//! left for an operator: only an explicit rollback releases the green
//! nodes that already switched.

use std::collections::BTreeSet;

use async_trait::async_trait;
use drydock_core::{Node, NodeState, Role, RoleName};
use tracing::{info, warn};

use crate::context::{BlueGreenState, DeploymentContext, DeploymentStatus, StepType, StrategyKind};
use crate::error::{RolloutError, RolloutResult};
use crate::fleet::Fleet;
use crate::strategy::DeploymentStrategy;

/// Role to borrow from when spares run out; overrides the configured one.
pub const DONOR_ROLE: &str = "donor_role";

pub struct BlueGreenStrategy;

/// A green candidate and, if borrowed, the role it belongs to.
type Green = (Node, Option<RoleName>);

#[async_trait]
impl DeploymentStrategy for BlueGreenStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::BlueGreen
    }

    async fn execute(&self, ctx: &mut DeploymentContext, fleet: &Fleet) {
        let prepared = fleet.role(&ctx.role).and_then(|role| {
            let green = acquire_green(ctx, fleet, &role)?;
            Ok((role, green))
        });
        let (role, green) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(deployment = %ctx.id, error = %e, "blue-green aborted before start");
                ctx.fail_with(e.to_string());
                ctx.finish(DeploymentStatus::Failed);
                fleet.report(ctx);
                return;
            }
        };

        ctx.blue_green = Some(BlueGreenState {
            green: green.iter().map(|(n, _)| n.id.clone()).collect(),
            borrowed: green
                .iter()
                .filter_map(|(n, donor)| donor.clone().map(|d| (n.id.clone(), d)))
                .collect(),
            ..Default::default()
        });
        info!(
            deployment = %ctx.id,
            green = green.len(),
            borrowed = green.iter().filter(|(_, d)| d.is_some()).count(),
            "green nodes acquired"
        );

        if let Err(e) = prepare_green(ctx, fleet, &green).await {
            ctx.fail_with(format!("green preparation failed: {e}"));
            release_unswitched(ctx, fleet).await;
            ctx.finish(DeploymentStatus::Failed);
            fleet.report(ctx);
            return;
        }

        for (node, _) in &green {
            if let Err(e) = switch_node(ctx, fleet, node, &role).await {
                let switched = ctx.blue_green.as_ref().map_or(0, |s| s.switched.len());
                ctx.fail_with(format!(
                    "switch failed on {} after {switched} of {} green nodes; rollback required: {e}",
                    node.name,
                    green.len()
                ));
                if let Some(state) = ctx.blue_green.as_mut() {
                    // The failed node is in ERROR; only untouched nodes go back.
                    state.green.retain(|id| id != &node.id);
                    state.borrowed.remove(&node.id);
                }
                release_unswitched(ctx, fleet).await;
                ctx.finish(DeploymentStatus::Failed);
                fleet.report(ctx);
                return;
            }
        }

        let mut decommission_failed = false;
        for blue_id in ctx.nodes.clone() {
            if let Err(e) = decommission(ctx, fleet, &blue_id) {
                warn!(deployment = %ctx.id, node_id = %blue_id, error = %e, "decommission failed");
                ctx.fail_with(format!("decommission of {blue_id} failed: {e}"));
                decommission_failed = true;
            }
        }

        if decommission_failed {
            ctx.finish(DeploymentStatus::Failed);
        } else {
            ctx.completed_nodes = ctx.nodes.clone();
            ctx.finish(DeploymentStatus::Success);
            info!(deployment = %ctx.id, role = %ctx.role, "blue-green switch complete");
        }
        fleet.report(ctx);
    }

    /// Give the role back to blue and release every switched green node.
    async fn rollback(&self, ctx: &mut DeploymentContext, fleet: &Fleet) {
        ctx.rollback_triggered = true;
        let Some(state) = ctx.blue_green.clone() else {
            ctx.finish(DeploymentStatus::RolledBack);
            fleet.report(ctx);
            return;
        };

        let mut clean = true;
        for blue_id in &state.decommissioned {
            let result = restore_blue(ctx, fleet, blue_id);
            if let Err(e) = result {
                ctx.fail_with(format!("restoring {blue_id} failed: {e}"));
                clean = false;
            } else if let Some(s) = ctx.blue_green.as_mut() {
                s.decommissioned.retain(|id| id != blue_id);
            }
        }
        for green_id in &state.switched {
            let donor = state.borrowed.get(green_id).cloned();
            let result = release_switched(ctx, fleet, green_id, donor.as_deref());
            if let Err(e) = result {
                ctx.fail_with(format!("releasing {green_id} failed: {e}"));
                clean = false;
            } else if let Some(s) = ctx.blue_green.as_mut() {
                s.switched.retain(|id| id != green_id);
            }
        }
        ctx.completed_nodes.clear();

        let status = if clean {
            DeploymentStatus::RolledBack
        } else {
            DeploymentStatus::Failed
        };
        info!(deployment = %ctx.id, %status, "blue-green rollback finished");
        ctx.finish(status);
        fleet.report(ctx);
    }
}

/// Pick one green node per blue node: spares first, then the donor role.
///
/// Nothing is modified; if not enough nodes qualify the deployment fails
/// with nothing to undo.
fn acquire_green(ctx: &DeploymentContext, fleet: &Fleet, role: &Role) -> RolloutResult<Vec<Green>> {
    let needed = ctx.nodes.len();
    let blue: BTreeSet<&str> = ctx.nodes.iter().map(String::as_str).collect();
    let donor = ctx
        .param(DONOR_ROLE)
        .map(str::to_string)
        .or_else(|| fleet.blue_green.donor_role.clone())
        .filter(|d| d != &role.name);

    let eligible = |n: &Node| {
        n.state == NodeState::Online
            && n.borrowed_from.is_none()
            && !blue.contains(n.id.as_str())
            && n.has_capabilities(&role.required_capabilities)
            && fleet.locks.owner(&n.id).is_none_or(|owner| owner == ctx.id)
    };

    let online = fleet.repo.get_all_nodes(Some(NodeState::Online))?;
    let mut green: Vec<Green> = online
        .iter()
        .filter(|&n| n.role.is_none() && eligible(n))
        .take(needed)
        .map(|n| (n.clone(), None))
        .collect();

    if green.len() < needed
        && let Some(donor) = &donor
    {
        let borrowed = online
            .iter()
            .filter(|&n| n.role.as_deref() == Some(donor.as_str()) && eligible(n))
            .take(needed - green.len())
            .map(|n| (n.clone(), Some(donor.clone())));
        green.extend(borrowed);
    }

    if green.len() < needed {
        return Err(RolloutError::Capacity(format!(
            "Unable to acquire green nodes: need {needed}, found {}",
            green.len()
        )));
    }
    for (node, _) in &green {
        if !fleet.locks.try_claim(&node.id, &ctx.id) {
            return Err(RolloutError::Claimed {
                node: node.id.clone(),
                owner: fleet.locks.owner(&node.id).unwrap_or_default(),
            });
        }
    }
    Ok(green)
}

/// Mark borrowed nodes, drain every green node and run the playbook.
async fn prepare_green(ctx: &mut DeploymentContext, fleet: &Fleet, green: &[Green]) -> RolloutResult<()> {
    for (node, donor) in green {
        if let Some(donor) = donor {
            fleet.repo.set_node_borrowed(&node.id, Some(donor))?;
            info!(deployment = %ctx.id, node = %node.name, %donor, "node borrowed");
        }
        fleet.drain(ctx, node)?;
    }
    for (node, _) in green {
        fleet.deploy(ctx, node).await?;
    }
    Ok(())
}

/// Hand the role to a green node and bring it online.
async fn switch_node(ctx: &mut DeploymentContext, fleet: &Fleet, node: &Node, role: &Role) -> RolloutResult<()> {
    let index = fleet.begin(ctx, StepType::Switch, node, &format!("assign role {}", role.name));
    let result = fleet.repo.assign_role_to_node(&node.id, Some(&role.name));
    fleet.end(ctx, index, result.map_err(RolloutError::from))?;

    fleet.recover(ctx, node, role).await?;
    if let Some(state) = ctx.blue_green.as_mut() {
        state.switched.push(node.id.clone());
    }
    fleet.report(ctx);
    Ok(())
}

fn decommission(ctx: &mut DeploymentContext, fleet: &Fleet, blue_id: &str) -> RolloutResult<()> {
    let node = fleet.node(blue_id)?;
    let index = fleet.begin(ctx, StepType::Decommission, &node, "clear role, leave idle");
    let result = fleet.repo.assign_role_to_node(blue_id, None).map_err(RolloutError::from);
    fleet.end(ctx, index, result)?;
    if let Some(state) = ctx.blue_green.as_mut() {
        state.decommissioned.push(blue_id.to_string());
    }
    Ok(())
}

/// Return every green node that has not switched to the spare pool or its
/// donor role, back ONLINE.
async fn release_unswitched(ctx: &mut DeploymentContext, fleet: &Fleet) {
    let Some(state) = ctx.blue_green.clone() else {
        return;
    };
    let trigger = ctx.trigger();
    for green_id in state.green.iter().filter(|id| !state.switched.contains(id)) {
        let Ok(node) = fleet.node(green_id) else {
            continue;
        };
        let donor = state.borrowed.get(green_id);
        let index = fleet.begin(ctx, StepType::Rollback, &node, "release green node");
        let result = (|| {
            match donor {
                Some(donor) => fleet.repo.assign_role_to_node(green_id, Some(donor.as_str()))?,
                None => fleet.repo.set_node_borrowed(green_id, None)?,
            };
            if fleet.node(green_id)?.state.is_maintenance() {
                fleet.to_recovering(&trigger, green_id)?;
                fleet.set_state(&trigger, green_id, NodeState::Online)?;
            }
            Ok::<(), RolloutError>(())
        })();
        if let Err(e) = fleet.end(ctx, index, result) {
            warn!(deployment = %ctx.id, node = %node.name, error = %e, "could not release green node");
        } else {
            info!(deployment = %ctx.id, node = %node.name, donor = ?donor, "green node released");
        }
    }
}

fn release_switched(
    ctx: &mut DeploymentContext,
    fleet: &Fleet,
    green_id: &str,
    donor: Option<&str>,
) -> RolloutResult<()> {
    let node = fleet.node(green_id)?;
    let index = fleet.begin(ctx, StepType::Rollback, &node, "release switched green node");
    let result = fleet
        .repo
        .assign_role_to_node(green_id, donor)
        .map(|_| ())
        .map_err(RolloutError::from);
    fleet.end(ctx, index, result)
}

fn restore_blue(ctx: &mut DeploymentContext, fleet: &Fleet, blue_id: &str) -> RolloutResult<()> {
    let node = fleet.node(blue_id)?;
    let role = ctx.role.clone();
    let index = fleet.begin(ctx, StepType::Rollback, &node, &format!("restore role {role}"));
    let result = fleet
        .repo
        .assign_role_to_node(blue_id, Some(&role))
        .map(|_| ())
        .map_err(RolloutError::from);
    fleet.end(ctx, index, result)
}
