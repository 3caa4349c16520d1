use std::collections::BTreeMap;

use drydock_rollout::{DeploymentContext, DeploymentStatus, DeploymentStep, StrategyKind};
use tokio::sync::broadcast::error::RecvError;

use crate::app::App;
use crate::console::Console;

/// Queue and run a deployment on the shared orchestrator, printing each
/// step as it closes.
pub async fn deploy(
    app: &App,
    out: &Console,
    role: &str,
    strategy: &str,
    nodes: &[String],
    playbook: Option<&str>,
    params: BTreeMap<String, String>,
) -> anyhow::Result<()> {
    let kind: StrategyKind = strategy.parse()?;
    let node_ids = nodes
        .iter()
        .map(|key| app.resolve_node(key).map(|n| n.id))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut rx = app.progress.subscribe();
    let ctx = app
        .orchestrator
        .create_deployment(role, &node_ids, kind, playbook, params)?;
    out.line(format!("✓ Queued {} ({} on {} node(s))", ctx.id, ctx.strategy, ctx.nodes.len()));

    let mut handle = app.orchestrator.execute_deployment(&ctx.id)?;
    let mut printed = 0;
    let finished = loop {
        tokio::select! {
            snapshot = rx.recv() => match snapshot {
                Ok(snapshot) if snapshot.id == ctx.id => {
                    printed = print_new_steps(out, &snapshot, printed);
                }
                // Other deployments, or snapshots we fell behind on; the
                // next one for ours carries every step so far.
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break (&mut handle).await?,
            },
            joined = &mut handle => break joined?,
        }
    };
    print_new_steps(out, &finished, printed);

    match finished.status {
        DeploymentStatus::Success => {
            out.line(format!("✓ Deployment {} succeeded", finished.id));
            Ok(())
        }
        status => anyhow::bail!(
            "deployment {} ended {}: {}",
            finished.id,
            status,
            finished.error.as_deref().unwrap_or("no error recorded")
        ),
    }
}

/// Print steps that closed since the last call, in order; returns the
/// count of leading closed steps.
fn print_new_steps(out: &Console, ctx: &DeploymentContext, printed: usize) -> usize {
    let closed = ctx
        .steps
        .iter()
        .take_while(|s| s.completed_at.is_some())
        .count();
    for step in ctx.steps.iter().take(closed).skip(printed) {
        out.line(format_step(step));
    }
    closed.max(printed)
}

fn format_step(step: &DeploymentStep) -> String {
    let mark = if step.success == Some(true) { "✓" } else { "✗" };
    let mut line = format!(
        "  {mark} {:<16} {:<20} {}",
        format!("{:?}", step.step_type),
        step.node_name,
        step.description
    );
    if let Some(error) = &step.error {
        line.push_str(&format!(" ({error})"));
    }
    line
}
