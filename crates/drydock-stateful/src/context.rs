//! Replication and backup records.

use std::collections::BTreeMap;
use std::fmt;

use drydock_core::NodeId;
use drydock_core::clock::{epoch_secs, next_sequence};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Replication ───────────────────────────────────────────────────

/// PENDING → SYNCING → SYNCED → PROMOTING → PROMOTED, or FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationState {
    Pending,
    Syncing,
    Synced,
    Promoting,
    Promoted,
    Failed,
}

impl fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReplicationState::Pending => "PENDING",
            ReplicationState::Syncing => "SYNCING",
            ReplicationState::Synced => "SYNCED",
            ReplicationState::Promoting => "PROMOTING",
            ReplicationState::Promoted => "PROMOTED",
            ReplicationState::Failed => "FAILED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationContext {
    pub id: String,
    pub primary_id: NodeId,
    pub replica_id: NodeId,
    pub service_type: String,
    pub state: ReplicationState,
    /// Fraction of the primary's data the replica holds, 0.0 to 1.0.
    pub progress: f64,
    pub created_at: u64,
    /// Breaks `created_at` ties.
    #[serde(default)]
    pub sequence: u64,
    pub updated_at: u64,
    pub completed_at: Option<u64>,
    pub error: Option<String>,
    #[serde(default)]
    pub details: BTreeMap<String, Value>,
}

impl ReplicationContext {
    pub fn new(id: String, primary_id: &str, replica_id: &str, service_type: &str) -> Self {
        let now = epoch_secs();
        Self {
            id,
            primary_id: primary_id.to_string(),
            replica_id: replica_id.to_string(),
            service_type: service_type.to_string(),
            state: ReplicationState::Pending,
            progress: 0.0,
            created_at: now,
            sequence: next_sequence(),
            updated_at: now,
            completed_at: None,
            error: None,
            details: BTreeMap::new(),
        }
    }

    pub fn set_state(&mut self, state: ReplicationState) {
        self.state = state;
        self.updated_at = epoch_secs();
        if matches!(state, ReplicationState::Promoted | ReplicationState::Failed) {
            self.completed_at = Some(self.updated_at);
        }
    }

    /// FAILED with the first cause kept.
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(error.into());
        }
        self.set_state(ReplicationState::Failed);
    }
}

// ── Backup ────────────────────────────────────────────────────────

/// PENDING → IN_PROGRESS → COMPLETED → RESTORING → RESTORED, or FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupState {
    Pending,
    InProgress,
    Completed,
    Restoring,
    Restored,
    Failed,
}

impl BackupState {
    /// Whether the artifact is known good and can be restored from.
    pub fn is_restorable(&self) -> bool {
        matches!(self, BackupState::Completed | BackupState::Restored)
    }
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackupState::Pending => "PENDING",
            BackupState::InProgress => "IN_PROGRESS",
            BackupState::Completed => "COMPLETED",
            BackupState::Restoring => "RESTORING",
            BackupState::Restored => "RESTORED",
            BackupState::Failed => "FAILED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupContext {
    pub id: String,
    pub node_id: NodeId,
    pub service_type: String,
    pub path: String,
    pub state: BackupState,
    pub size_bytes: Option<u64>,
    /// Hex SHA-256 of the copied artifact.
    pub checksum: Option<String>,
    pub created_at: u64,
    #[serde(default)]
    pub sequence: u64,
    pub completed_at: Option<u64>,
    pub restored_at: Option<u64>,
    pub error: Option<String>,
}

impl BackupContext {
    pub fn new(id: String, node_id: &str, service_type: &str, path: &str) -> Self {
        Self {
            id,
            node_id: node_id.to_string(),
            service_type: service_type.to_string(),
            path: path.to_string(),
            state: BackupState::Pending,
            size_bytes: None,
            checksum: None,
            created_at: epoch_secs(),
            sequence: next_sequence(),
            completed_at: None,
            restored_at: None,
            error: None,
        }
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(error.into());
        }
        self.state = BackupState::Failed;
        if self.completed_at.is_none() {
            self.completed_at = Some(epoch_secs());
        }
    }
}
