use std::path::Path;
use std::sync::Arc;

use drydock_reconcile::{AlertCallback, AlertLevel, Reconciler, StateChangeCallback};
use drydock_remediate::Remediator;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::app::App;
use crate::control::ControlServer;

/// Run the daemon until Ctrl-C: the reconciler plus the control socket
/// that operator commands are forwarded to. Both share `app`, so
/// deployments and swaps claim nodes in the same table the reconciler
/// checks. The cycle in flight finishes before the process exits.
pub async fn run(app: Arc<App>, socket: &Path) -> anyhow::Result<()> {
    info!(
        data_dir = %app.config.data_dir().display(),
        interval_secs = app.config.reconciler.interval_secs,
        "drydockd starting"
    );

    let server = ControlServer::bind(socket).await?;

    let remediator = Remediator::new(Arc::clone(&app.executor), &app.config.remediation);
    let reconciler = Reconciler::new(
        app.repo(),
        remediator,
        app.locks.clone(),
        app.config.reconciler.clone(),
    )
    .with_state_change_callback(log_state_changes())
    .with_alert_callback(log_alerts());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconcile_rx = shutdown_rx.clone();
    let reconcile_handle = tokio::spawn(async move {
        reconciler.run(reconcile_rx).await;
    });
    let control_handle = tokio::spawn(server.serve(Arc::clone(&app), shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    if let Err(e) = control_handle.await {
        error!(error = %e, "control socket task ended abnormally");
    }
    if let Err(e) = reconcile_handle.await {
        error!(error = %e, "reconciler task ended abnormally");
    }
    info!("drydockd stopped");
    Ok(())
}

fn log_state_changes() -> StateChangeCallback {
    Arc::new(|node_id, from, to| {
        Box::pin(async move {
            info!(node = %node_id, %from, %to, "node state changed");
        })
    })
}

fn log_alerts() -> AlertCallback {
    Arc::new(|node_id, level, details| {
        Box::pin(async move {
            match level {
                AlertLevel::Warning => warn!(node = %node_id, %details, "node degraded"),
                AlertLevel::Critical => {
                    error!(node = %node_id, %details, "node in ERROR; operator action needed")
                }
            }
        })
    })
}
