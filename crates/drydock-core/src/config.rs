//! drydock.toml configuration parser.
//!
//! Every section is optional; omitted keys fall back to defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DrydockConfig {
    pub data_dir: Option<PathBuf>,
    pub reconciler: ReconcilerConfig,
    pub health: HealthPollConfig,
    pub ssh: SshConfig,
    pub playbooks: PlaybookConfig,
    pub blue_green: BlueGreenConfig,
    pub maintenance_window: MaintenanceWindowConfig,
    pub stateful: StatefulConfig,
    pub remediation: RemediationConfig,
}

/// Drift detection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub interval_secs: u64,
    /// Heartbeat age after which an ONLINE node is DEGRADED.
    pub stale_threshold_secs: u64,
    /// Heartbeat age after which a DEGRADED node may be escalated to ERROR.
    pub critical_threshold_secs: u64,
    /// Failed remediation attempts before escalation.
    pub retry_limit: u32,
    /// Upper bound on evaluating a single node within a cycle.
    pub node_timeout_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            stale_threshold_secs: 60,
            critical_threshold_secs: 300,
            retry_limit: 3,
            node_timeout_secs: 60,
        }
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }
}

/// Health verification used by deployments after a node is recovered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPollConfig {
    pub poll_interval_ms: u64,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for HealthPollConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            max_retries: 12,
            timeout_secs: 120,
        }
    }
}

impl HealthPollConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
    pub port: u16,
    pub key_path: Option<PathBuf>,
    pub command_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: 22,
            key_path: None,
            command_timeout_secs: 60,
            connect_timeout_secs: 10,
        }
    }
}

impl SshConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybookConfig {
    /// Automation binary invoked with `-i <host>, <playbook>`.
    pub command: String,
    pub timeout_secs: u64,
}

impl Default for PlaybookConfig {
    fn default() -> Self {
        Self {
            command: "ansible-playbook".to_string(),
            timeout_secs: 1800,
        }
    }
}

impl PlaybookConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BlueGreenConfig {
    /// Role whose ONLINE nodes may be borrowed when spares run out.
    pub donor_role: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MaintenanceWindowConfig {
    /// Run playbooks across all drained nodes at once.
    pub parallel: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatefulConfig {
    pub sync_timeout_secs: u64,
    pub sync_poll_interval_ms: u64,
    pub backup_timeout_secs: u64,
    pub backup_dir: String,
}

impl Default for StatefulConfig {
    fn default() -> Self {
        Self {
            sync_timeout_secs: 300,
            sync_poll_interval_ms: 2000,
            backup_timeout_secs: 600,
            backup_dir: "/var/backups/drydock".to_string(),
        }
    }
}

impl StatefulConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn sync_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sync_poll_interval_ms)
    }

    pub fn backup_timeout(&self) -> Duration {
        Duration::from_secs(self.backup_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemediationConfig {
    /// Attempts kept in memory before the oldest are evicted.
    pub history_limit: usize,
    pub restart_timeout_secs: u64,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            restart_timeout_secs: 60,
        }
    }
}

impl RemediationConfig {
    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_secs)
    }
}

impl DrydockConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DrydockConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/var/lib/drydock"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: DrydockConfig = toml::from_str("").unwrap();
        assert_eq!(config.reconciler.stale_threshold_secs, 60);
        assert_eq!(config.reconciler.critical_threshold_secs, 300);
        assert_eq!(config.reconciler.retry_limit, 3);
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.data_dir(), PathBuf::from("/var/lib/drydock"));
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let toml_str = r#"
data_dir = "/srv/drydock"

[reconciler]
interval_secs = 10

[blue_green]
donor_role = "batch"
"#;
        let config: DrydockConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.reconciler.interval(), Duration::from_secs(10));
        assert_eq!(config.reconciler.stale_threshold_secs, 60);
        assert_eq!(config.blue_green.donor_role.as_deref(), Some("batch"));
        assert_eq!(config.data_dir(), PathBuf::from("/srv/drydock"));
    }

    #[test]
    fn renders_back_to_toml() {
        let rendered = DrydockConfig::default().to_toml_string().unwrap();
        assert!(rendered.contains("[reconciler]"));
        assert!(rendered.contains("ansible-playbook"));
    }
}
