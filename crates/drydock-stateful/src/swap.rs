//! Zero-downtime update of a stateful node through a standby.
//!
//! Replicate onto the standby, wait for sync, promote it, update the
//! original (now idle) node, then check data on both. Once the standby is
//! promoted nothing is reversed automatically: a failed update leaves the
//! standby as primary and is reported for an operator to resolve.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use drydock_core::config::StatefulConfig;
use drydock_core::{Node, NodeId};
use tracing::{error, info, warn};

use crate::context::ReplicationContext;
use crate::handler::IntegrityReport;
use crate::manager::StatefulServiceManager;

pub type UpdateFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// Applies the update to the original node after the standby took over.
pub type UpdateCallback = Arc<dyn Fn(NodeId) -> UpdateFuture + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum SwapOutcome {
    /// Standby promoted, original updated, both report healthy data.
    Completed {
        replication: ReplicationContext,
        integrity: Vec<(NodeId, IntegrityReport)>,
    },
    /// The standby is primary but the original did not come through the
    /// update cleanly. Needs an operator.
    PartialUpdateFailed {
        replication: ReplicationContext,
        error: String,
    },
    /// Nothing was promoted; the original is still primary.
    Failed {
        replication: Option<ReplicationContext>,
        error: String,
    },
}

impl SwapOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SwapOutcome::Completed { .. })
    }
}

pub struct ReplicatedSwapStrategy {
    manager: StatefulServiceManager,
    sync_timeout: Duration,
    poll_interval: Duration,
}

impl ReplicatedSwapStrategy {
    pub fn new(manager: StatefulServiceManager, config: &StatefulConfig) -> Self {
        Self {
            manager,
            sync_timeout: config.sync_timeout(),
            poll_interval: config.sync_poll_interval(),
        }
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub async fn execute(
        &self,
        primary: &Node,
        standby: &Node,
        service_type: &str,
        update: UpdateCallback,
    ) -> SwapOutcome {
        info!(primary = %primary.name, standby = %standby.name, %service_type, "replicated swap starting");

        let replication = match self
            .manager
            .setup_replication(&primary.id, &standby.id, service_type)
            .await
        {
            Ok(ctx) => ctx,
            Err(e) => {
                return SwapOutcome::Failed {
                    replication: self.latest_for(&standby.id),
                    error: format!("replication setup failed: {e}"),
                };
            }
        };

        if let Err(e) = self
            .manager
            .wait_for_sync(&replication.id, self.sync_timeout, self.poll_interval)
            .await
        {
            warn!(replication = %replication.id, error = %e, "standby never caught up");
            return SwapOutcome::Failed {
                replication: self.manager.get_replication(&replication.id),
                error: format!("sync failed: {e}"),
            };
        }

        let replication = match self.manager.promote_replica(&replication.id).await {
            Ok(ctx) => ctx,
            Err(e) => {
                return SwapOutcome::Failed {
                    replication: self.manager.get_replication(&replication.id),
                    error: format!("promotion failed: {e}"),
                };
            }
        };

        if let Err(e) = update(primary.id.clone()).await {
            error!(
                node = %primary.name,
                standby = %standby.name,
                error = %e,
                "update failed after promotion; standby stays primary"
            );
            return SwapOutcome::PartialUpdateFailed {
                replication,
                error: format!("update of {} failed: {e}", primary.name),
            };
        }

        let mut integrity = Vec::new();
        for node in [standby, primary] {
            match self.manager.verify_data_integrity(&node.id, service_type).await {
                Ok(report) if report.healthy => integrity.push((node.id.clone(), report)),
                Ok(_) => {
                    return SwapOutcome::PartialUpdateFailed {
                        replication,
                        error: format!("data integrity check failed on {}", node.name),
                    };
                }
                Err(e) => {
                    return SwapOutcome::PartialUpdateFailed {
                        replication,
                        error: format!("data integrity check on {} errored: {e}", node.name),
                    };
                }
            }
        }

        info!(primary = %standby.name, updated = %primary.name, "replicated swap complete");
        SwapOutcome::Completed {
            replication,
            integrity,
        }
    }

    fn latest_for(&self, replica_id: &str) -> Option<ReplicationContext> {
        self.manager
            .list_replications()
            .into_iter()
            .rev()
            .find(|r| r.replica_id == replica_id)
    }
}
