use std::collections::BTreeMap;
use std::sync::Arc;

use drydock_core::NodeId;
use drydock_exec::SshTarget;
use drydock_stateful::{
    ReplicatedSwapStrategy, ReplicationState, SwapOutcome, UpdateCallback, UpdateFuture,
};
use tracing::{info, warn};

use crate::app::App;
use crate::console::Console;

pub async fn backup_create(
    app: &App,
    out: &Console,
    node: &str,
    service_type: Option<&str>,
    path: Option<&str>,
) -> anyhow::Result<()> {
    let node = app.resolve_node(node)?;
    let service_type = app.service_type_for(&node, service_type)?;

    let backup = app
        .stateful
        .create_backup(&node.id, &service_type, path)
        .await?;
    out.line(format!("✓ Backed up {} on {} ({})", service_type, node.name, backup.id));
    out.line(format!("  Path:   {}", backup.path));
    if let Some(size) = backup.size_bytes {
        out.line(format!("  Size:   {size} bytes"));
    }
    if let Some(checksum) = &backup.checksum {
        out.line(format!("  SHA256: {checksum}"));
    }
    Ok(())
}

/// Restore a file left by an earlier `backup create`, identified by path
/// and the checksum printed back then.
pub async fn backup_restore(
    app: &App,
    out: &Console,
    node: &str,
    path: &str,
    checksum: &str,
    service_type: Option<&str>,
) -> anyhow::Result<()> {
    let node = app.resolve_node(node)?;
    let service_type = app.service_type_for(&node, service_type)?;

    let registered = app
        .stateful
        .register_backup(&node.id, &service_type, path, checksum)?;
    let restored = app.stateful.restore_backup(&registered.id).await?;
    out.line(format!("✓ Restored {} on {} from {}", service_type, node.name, restored.path));
    Ok(())
}

pub async fn replicate(
    app: &App,
    out: &Console,
    primary: &str,
    replica: &str,
    service_type: Option<&str>,
    promote: bool,
) -> anyhow::Result<()> {
    let primary = app.resolve_node(primary)?;
    let replica = app.resolve_node(replica)?;
    let service_type = app.service_type_for(&primary, service_type)?;

    let manager = &app.stateful;
    let ctx = manager
        .setup_replication(&primary.id, &replica.id, &service_type)
        .await?;
    out.line(format!(
        "✓ Replicating {} from {} to {} ({})",
        service_type, primary.name, replica.name, ctx.id
    ));

    let ctx = manager.wait_for_sync_default(&ctx.id).await?;
    out.line(format!("✓ {} in sync ({:.0}%)", replica.name, ctx.progress * 100.0));

    if promote {
        let ctx = manager.promote_replica(&ctx.id).await?;
        debug_assert_eq!(ctx.state, ReplicationState::Promoted);
        out.line(format!("✓ Promoted {} to primary", replica.name));
    }
    Ok(())
}

/// Update a stateful node without downtime: replicate onto `standby`,
/// promote it, then run `playbook` on the original primary.
///
/// Both nodes are claimed for the whole swap so the reconciler and other
/// deployments leave them alone.
pub async fn swap(
    app: &App,
    out: &Console,
    primary: &str,
    standby: &str,
    service_type: Option<&str>,
    playbook: &str,
    params: BTreeMap<String, String>,
) -> anyhow::Result<()> {
    let primary = app.resolve_node(primary)?;
    let standby = app.resolve_node(standby)?;
    let service_type = app.service_type_for(&primary, service_type)?;

    let owner = format!("swap-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
    for node in [&primary, &standby] {
        if !app.locks.try_claim(&node.id, &owner) {
            app.locks.release_all(&owner);
            let holder = app.locks.owner(&node.id).unwrap_or_default();
            anyhow::bail!("node {} is claimed by {holder}", node.name);
        }
    }
    out.line(format!(
        "✓ Swapping {} from {} to {} ({owner})",
        service_type, primary.name, standby.name
    ));

    let strategy = ReplicatedSwapStrategy::new(app.stateful.clone(), &app.config.stateful);
    let update = playbook_update(app, playbook, params);
    let outcome = strategy
        .execute(&primary, &standby, &service_type, update)
        .await;
    app.locks.release_all(&owner);

    match outcome {
        SwapOutcome::Completed { replication, integrity } => {
            out.line(format!("✓ {} promoted ({})", standby.name, replication.id));
            out.line(format!("✓ {} updated with {playbook}", primary.name));
            for (node_id, report) in &integrity {
                let keys = report.details.get("keys").map(|v| v.to_string());
                out.line(format!(
                    "  {node_id}: healthy, keys {}",
                    keys.as_deref().unwrap_or("unknown")
                ));
            }
            Ok(())
        }
        SwapOutcome::PartialUpdateFailed { replication, error } => {
            warn!(replication = %replication.id, %error, "swap needs an operator");
            anyhow::bail!(
                "{} is now primary ({}), but {error}; resolve {} by hand",
                standby.name,
                replication.id,
                primary.name
            )
        }
        SwapOutcome::Failed { error, .. } => {
            anyhow::bail!("swap failed, {} is still primary: {error}", primary.name)
        }
    }
}

/// Run `playbook` on the node the swap hands back once its standby took
/// over. A failed play is the update's failure.
fn playbook_update(app: &App, playbook: &str, params: BTreeMap<String, String>) -> UpdateCallback {
    let repo = app.repo();
    let executor = Arc::clone(&app.executor);
    let playbook = playbook.to_string();
    Arc::new(move |node_id: NodeId| -> UpdateFuture {
        let repo = Arc::clone(&repo);
        let executor = Arc::clone(&executor);
        let playbook = playbook.clone();
        let params = params.clone();
        Box::pin(async move {
            let node = repo
                .get_node(&node_id)
                .map_err(|e| e.to_string())?
                .ok_or_else(|| format!("node {node_id} vanished"))?;
            info!(node = %node.name, %playbook, "updating original primary");
            let result = executor
                .run_playbook(&SshTarget::from(&node), &playbook, &params)
                .await
                .map_err(|e| e.to_string())?;
            if result.success() {
                Ok(())
            } else {
                Err(format!(
                    "{playbook} exited {}: {}",
                    result.exit_code,
                    result.error_text()
                ))
            }
        })
    })
}
