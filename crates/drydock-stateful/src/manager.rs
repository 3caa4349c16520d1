//! Replication and backup lifecycles on top of per-service handlers.
//!
//! The manager owns the active-replication and active-backup tables.
//! Bad input (unknown node, unknown service type, wrong lifecycle state) is
//! rejected before anything is recorded. Failures of the remote work itself
//! mark the stored record FAILED with the cause and are also returned.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use drydock_core::clock::epoch_secs;
use drydock_core::config::StatefulConfig;
use drydock_core::Node;
use drydock_exec::CommandExecutor;
use drydock_state::NodeRepository;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::context::{BackupContext, BackupState, ReplicationContext, ReplicationState};
use crate::error::{StatefulError, StatefulResult};
use crate::handler::{IntegrityReport, StatefulHandler};
use crate::redis::RedisHandler;

fn short_id(prefix: &str) -> String {
    format!("{prefix}-{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

#[derive(Clone)]
pub struct StatefulServiceManager {
    repo: Arc<dyn NodeRepository>,
    config: StatefulConfig,
    handlers: HashMap<String, Arc<dyn StatefulHandler>>,
    replications: Arc<RwLock<HashMap<String, ReplicationContext>>>,
    backups: Arc<RwLock<HashMap<String, BackupContext>>>,
}

impl StatefulServiceManager {
    /// A manager with the built-in Redis handler registered.
    pub fn new(
        repo: Arc<dyn NodeRepository>,
        executor: Arc<dyn CommandExecutor>,
        config: &StatefulConfig,
    ) -> Self {
        Self {
            repo,
            config: config.clone(),
            handlers: HashMap::new(),
            replications: Arc::new(RwLock::new(HashMap::new())),
            backups: Arc::new(RwLock::new(HashMap::new())),
        }
        .with_handler(Arc::new(RedisHandler::new(executor)))
    }

    /// Register `handler` under its service type, replacing any previous one.
    pub fn with_handler(mut self, handler: Arc<dyn StatefulHandler>) -> Self {
        self.handlers
            .insert(handler.service_type().to_string(), handler);
        self
    }

    pub fn handler(&self, service_type: &str) -> StatefulResult<Arc<dyn StatefulHandler>> {
        self.handlers
            .get(service_type)
            .cloned()
            .ok_or_else(|| StatefulError::Validation(format!("unknown service type: {service_type}")))
    }

    fn node(&self, id: &str) -> StatefulResult<Node> {
        self.repo
            .get_node(id)?
            .ok_or_else(|| StatefulError::NotFound(format!("node {id}")))
    }

    fn store_replication(&self, ctx: &ReplicationContext) {
        self.replications
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(ctx.id.clone(), ctx.clone());
    }

    fn store_backup(&self, ctx: &BackupContext) {
        self.backups
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(ctx.id.clone(), ctx.clone());
    }

    // ── Replication ───────────────────────────────────────────────

    /// Point `replica_id` at `primary_id`. The record starts SYNCING.
    pub async fn setup_replication(
        &self,
        primary_id: &str,
        replica_id: &str,
        service_type: &str,
    ) -> StatefulResult<ReplicationContext> {
        if primary_id == replica_id {
            return Err(StatefulError::Validation(
                "a node cannot replicate from itself".into(),
            ));
        }
        let handler = self.handler(service_type)?;
        let primary = self.node(primary_id)?;
        let replica = self.node(replica_id)?;

        let mut ctx = ReplicationContext::new(short_id("rep"), primary_id, replica_id, service_type);
        self.store_replication(&ctx);

        match handler.setup_replication(&primary, &replica).await {
            Ok(()) => {
                ctx.set_state(ReplicationState::Syncing);
                info!(replication = %ctx.id, primary = %primary.name, replica = %replica.name, "replication started");
                self.store_replication(&ctx);
                Ok(ctx)
            }
            Err(e) => {
                warn!(replication = %ctx.id, error = %e, "replication setup failed");
                ctx.fail(e.to_string());
                self.store_replication(&ctx);
                Err(e)
            }
        }
    }

    /// Poll once and record progress. Returns `(synced, progress)`.
    pub async fn check_sync_status(&self, id: &str) -> StatefulResult<(bool, f64)> {
        let mut ctx = self.replication_in(id, &[ReplicationState::Syncing, ReplicationState::Synced], "check sync")?;
        let handler = self.handler(&ctx.service_type)?;
        let primary = self.node(&ctx.primary_id)?;
        let replica = self.node(&ctx.replica_id)?;

        match handler.check_sync_status(&primary, &replica).await {
            Ok(status) => {
                ctx.progress = status.progress;
                ctx.details.extend(status.details);
                if status.synced {
                    ctx.progress = 1.0;
                    ctx.set_state(ReplicationState::Synced);
                } else {
                    ctx.set_state(ReplicationState::Syncing);
                }
                self.store_replication(&ctx);
                Ok((status.synced, ctx.progress))
            }
            Err(e) => {
                ctx.fail(e.to_string());
                self.store_replication(&ctx);
                Err(e)
            }
        }
    }

    /// Poll until synced. Exceeding `deadline` fails the replication.
    pub async fn wait_for_sync(
        &self,
        id: &str,
        deadline: Duration,
        poll_interval: Duration,
    ) -> StatefulResult<ReplicationContext> {
        let polled = tokio::time::timeout(deadline, async {
            loop {
                let (synced, progress) = self.check_sync_status(id).await?;
                if synced {
                    return Ok::<(), StatefulError>(());
                }
                debug!(replication = %id, progress, "waiting for replica");
                tokio::time::sleep(poll_interval).await;
            }
        })
        .await;

        match polled {
            Ok(Ok(())) => self.require_replication(id),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let mut ctx = self.require_replication(id)?;
                let message = format!(
                    "replication {id} not synced after {deadline:?} (progress {:.2})",
                    ctx.progress
                );
                warn!(replication = %id, "sync timed out");
                ctx.fail(message.clone());
                self.store_replication(&ctx);
                Err(StatefulError::Timeout(message))
            }
        }
    }

    /// Like [`Self::wait_for_sync`] with the configured deadline and interval.
    pub async fn wait_for_sync_default(&self, id: &str) -> StatefulResult<ReplicationContext> {
        self.wait_for_sync(id, self.config.sync_timeout(), self.config.sync_poll_interval())
            .await
    }

    /// Detach a SYNCED replica and confirm it now acts as primary.
    pub async fn promote_replica(&self, id: &str) -> StatefulResult<ReplicationContext> {
        let mut ctx = self.replication_in(id, &[ReplicationState::Synced], "promote")?;
        let handler = self.handler(&ctx.service_type)?;
        let replica = self.node(&ctx.replica_id)?;

        ctx.set_state(ReplicationState::Promoting);
        self.store_replication(&ctx);

        let result = match handler.promote_replica(&replica).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(StatefulError::Integrity(format!(
                "{} does not report the primary role after promotion",
                replica.name
            ))),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                ctx.set_state(ReplicationState::Promoted);
                info!(replication = %id, node = %replica.name, "replica promoted");
                self.store_replication(&ctx);
                Ok(ctx)
            }
            Err(e) => {
                warn!(replication = %id, error = %e, "promotion failed");
                ctx.fail(e.to_string());
                self.store_replication(&ctx);
                Err(e)
            }
        }
    }

    pub fn get_replication(&self, id: &str) -> Option<ReplicationContext> {
        self.replications
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    /// Oldest first.
    pub fn list_replications(&self) -> Vec<ReplicationContext> {
        let mut all: Vec<_> = self
            .replications
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|c| (c.created_at, c.sequence));
        all
    }

    fn require_replication(&self, id: &str) -> StatefulResult<ReplicationContext> {
        self.get_replication(id)
            .ok_or_else(|| StatefulError::NotFound(format!("replication {id}")))
    }

    fn replication_in(
        &self,
        id: &str,
        allowed: &[ReplicationState],
        action: &'static str,
    ) -> StatefulResult<ReplicationContext> {
        let ctx = self.require_replication(id)?;
        if !allowed.contains(&ctx.state) {
            return Err(StatefulError::InvalidState {
                kind: "replication",
                id: id.to_string(),
                state: ctx.state.to_string(),
                action,
            });
        }
        Ok(ctx)
    }

    // ── Backup ────────────────────────────────────────────────────

    /// Back up the service on `node_id`.
    ///
    /// Without a path the file goes to
    /// `<backup_dir>/<service>-<node name>-<unix secs>.<ext>`.
    pub async fn create_backup(
        &self,
        node_id: &str,
        service_type: &str,
        path: Option<&str>,
    ) -> StatefulResult<BackupContext> {
        let handler = self.handler(service_type)?;
        let node = self.node(node_id)?;
        let path = match path {
            Some(p) => p.to_string(),
            None => format!(
                "{}/{service_type}-{}-{}.{}",
                self.config.backup_dir.trim_end_matches('/'),
                node.name,
                epoch_secs(),
                handler.backup_extension()
            ),
        };

        let mut ctx = BackupContext::new(short_id("bk"), node_id, service_type, &path);
        ctx.state = BackupState::InProgress;
        self.store_backup(&ctx);
        info!(backup = %ctx.id, node = %node.name, %path, "backup started");

        match handler
            .create_backup(
                &node,
                &path,
                self.config.backup_timeout(),
                self.config.sync_poll_interval(),
            )
            .await
        {
            Ok(artifact) => {
                ctx.size_bytes = Some(artifact.size_bytes);
                ctx.checksum = Some(artifact.checksum);
                ctx.state = BackupState::Completed;
                ctx.completed_at = Some(epoch_secs());
                info!(backup = %ctx.id, size_bytes = artifact.size_bytes, "backup completed");
                self.store_backup(&ctx);
                Ok(ctx)
            }
            Err(e) => {
                warn!(backup = %ctx.id, error = %e, "backup failed");
                ctx.fail(e.to_string());
                self.store_backup(&ctx);
                Err(e)
            }
        }
    }

    /// Restore a completed backup onto the node it was taken from.
    ///
    /// A file whose checksum no longer matches is an integrity failure and
    /// the service is never stopped.
    pub async fn restore_backup(&self, id: &str) -> StatefulResult<BackupContext> {
        let mut ctx = self
            .get_backup(id)
            .ok_or_else(|| StatefulError::NotFound(format!("backup {id}")))?;
        if !ctx.state.is_restorable() {
            return Err(StatefulError::InvalidState {
                kind: "backup",
                id: id.to_string(),
                state: ctx.state.to_string(),
                action: "restore",
            });
        }
        let handler = self.handler(&ctx.service_type)?;
        let node = self.node(&ctx.node_id)?;
        let checksum = ctx
            .checksum
            .clone()
            .ok_or_else(|| StatefulError::Integrity(format!("backup {id} has no checksum")))?;

        ctx.state = BackupState::Restoring;
        self.store_backup(&ctx);

        match handler.restore_backup(&node, &ctx.path, &checksum).await {
            Ok(()) => {
                ctx.state = BackupState::Restored;
                ctx.restored_at = Some(epoch_secs());
                info!(backup = %id, node = %node.name, "restore completed");
                self.store_backup(&ctx);
                Ok(ctx)
            }
            Err(e) => {
                warn!(backup = %id, error = %e, "restore failed");
                ctx.fail(e.to_string());
                self.store_backup(&ctx);
                Err(e)
            }
        }
    }

    /// Record an artifact produced outside this process (an earlier run, an
    /// operator copy) as a COMPLETED backup so it can be restored.
    pub fn register_backup(
        &self,
        node_id: &str,
        service_type: &str,
        path: &str,
        checksum: &str,
    ) -> StatefulResult<BackupContext> {
        self.handler(service_type)?;
        self.node(node_id)?;
        if checksum.len() != 64 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StatefulError::Validation(format!(
                "checksum must be 64 hex digits, got {checksum:?}"
            )));
        }
        let mut ctx = BackupContext::new(short_id("bk"), node_id, service_type, path);
        ctx.checksum = Some(checksum.to_ascii_lowercase());
        ctx.state = BackupState::Completed;
        ctx.completed_at = Some(ctx.created_at);
        self.store_backup(&ctx);
        Ok(ctx)
    }

    pub fn get_backup(&self, id: &str) -> Option<BackupContext> {
        self.backups
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    /// Oldest first.
    pub fn list_backups(&self) -> Vec<BackupContext> {
        let mut all: Vec<_> = self
            .backups
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|c| (c.created_at, c.sequence));
        all
    }

    // ── Integrity ─────────────────────────────────────────────────

    pub async fn verify_data_integrity(
        &self,
        node_id: &str,
        service_type: &str,
    ) -> StatefulResult<IntegrityReport> {
        let handler = self.handler(service_type)?;
        let node = self.node(node_id)?;
        let mut report = handler.verify_data_integrity(&node).await?;
        report
            .details
            .insert("node".to_string(), json!(node.name));
        if !report.healthy {
            warn!(node = %node.name, details = ?report.details, "data integrity check failed");
        }
        Ok(report)
    }
}
