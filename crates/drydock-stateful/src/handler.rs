//! Per-service-type replication and backup primitives.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use drydock_core::Node;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StatefulResult;

/// One observation of a replica catching up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub synced: bool,
    pub progress: f64,
    pub details: BTreeMap<String, Value>,
}

/// What a finished backup left on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub size_bytes: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub healthy: bool,
    pub details: BTreeMap<String, Value>,
}

/// Service-specific commands behind the stateful manager.
///
/// Implementations talk to one node at a time and hold no per-operation
/// state; the manager owns the replication and backup records. Every wait
/// is bounded by the deadline the caller passes in.
#[async_trait]
pub trait StatefulHandler: Send + Sync {
    /// Registry key, matched against a role's `service_type`.
    fn service_type(&self) -> &str;

    /// Extension used for default backup file names.
    fn backup_extension(&self) -> &str;

    /// Make `replica` follow `primary`.
    async fn setup_replication(&self, primary: &Node, replica: &Node) -> StatefulResult<()>;

    async fn check_sync_status(&self, primary: &Node, replica: &Node) -> StatefulResult<SyncStatus>;

    /// Detach `replica` from its primary. `Ok(false)` if the node does not
    /// report itself as a primary afterwards.
    async fn promote_replica(&self, replica: &Node) -> StatefulResult<bool>;

    /// Snapshot the service's data and copy it to `path` on the same node.
    /// Size and checksum are taken from the copy.
    async fn create_backup(
        &self,
        node: &Node,
        path: &str,
        deadline: Duration,
        poll_interval: Duration,
    ) -> StatefulResult<BackupArtifact>;

    /// Put the artifact at `path` back in place of the live data.
    ///
    /// The checksum is verified before the service is touched.
    async fn restore_backup(&self, node: &Node, path: &str, checksum: &str) -> StatefulResult<()>;

    async fn verify_data_integrity(&self, node: &Node) -> StatefulResult<IntegrityReport>;
}
