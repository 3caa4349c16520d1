//! Redis handler, driven through `redis-cli` on the node.
//!
//! # Commands
//!
//! ```text
//! replicate   REPLICAOF <primary> <port>
//! sync        INFO replication on both sides: master_link_status,
//!             master_sync_in_progress, slave_repl_offset / master_repl_offset
//! promote     REPLICAOF NO ONE, then INFO replication must say role:master
//! backup      BGSAVE, poll INFO persistence until rdb_bgsave_in_progress:0,
//!             cp dump.rdb <path>, stat + sha256sum on <path>
//! restore     sha256sum <path>, systemctl stop, cp, chown, systemctl start, PING
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use drydock_core::Node;
use drydock_exec::{CommandExecutor, SshTarget, shell_quote};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::{StatefulError, StatefulResult};
use crate::handler::{BackupArtifact, IntegrityReport, StatefulHandler, SyncStatus};

pub const SERVICE_TYPE: &str = "redis";

const DEFAULT_PORT: u16 = 6379;
const DEFAULT_UNIT: &str = "redis-server";
const DEFAULT_DATA_FILE: &str = "/var/lib/redis/dump.rdb";
const DEFAULT_OWNER: &str = "redis:redis";

pub struct RedisHandler {
    executor: Arc<dyn CommandExecutor>,
    port: u16,
    unit: String,
    data_file: String,
    owner: String,
}

impl RedisHandler {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            port: DEFAULT_PORT,
            unit: DEFAULT_UNIT.to_string(),
            data_file: DEFAULT_DATA_FILE.to_string(),
            owner: DEFAULT_OWNER.to_string(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_data_file(mut self, path: &str) -> Self {
        self.data_file = path.to_string();
        self
    }

    // ── Command plumbing ──────────────────────────────────────────

    /// Run a shell command; non-zero exit is an error.
    async fn run(&self, node: &Node, command: &str) -> StatefulResult<String> {
        let out = self.executor.execute(&SshTarget::from(node), command).await?;
        if !out.success() {
            return Err(StatefulError::Command {
                node: node.name.clone(),
                command: command.to_string(),
                exit_code: out.exit_code,
                output: out.error_text(),
            });
        }
        Ok(out.stdout)
    }

    /// Run a `redis-cli` command. Error replies count as failures even
    /// though redis-cli exits 0 for them.
    async fn cli(&self, node: &Node, args: &str) -> StatefulResult<String> {
        let command = format!("redis-cli -p {} {args}", self.port);
        let reply = self.run(node, &command).await?;
        let trimmed = reply.trim();
        if trimmed.starts_with("ERR") || trimmed.starts_with("(error)") {
            return Err(StatefulError::Command {
                node: node.name.clone(),
                command,
                exit_code: 0,
                output: trimmed.to_string(),
            });
        }
        Ok(reply)
    }

    async fn info(&self, node: &Node, section: &str) -> StatefulResult<HashMap<String, String>> {
        let text = self.cli(node, &format!("INFO {section}")).await?;
        Ok(parse_info(&text))
    }

    async fn checksum(&self, node: &Node, path: &str) -> StatefulResult<String> {
        let out = self.run(node, &format!("sha256sum {}", shell_quote(path))).await?;
        let digest = out.split_whitespace().next().unwrap_or_default();
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StatefulError::Integrity(format!(
                "unreadable checksum for {path} on {}: {out:?}",
                node.name
            )));
        }
        Ok(digest.to_ascii_lowercase())
    }

    /// Wait for the background save started by BGSAVE to finish.
    async fn wait_for_bgsave(&self, node: &Node, poll_interval: Duration) -> StatefulResult<()> {
        loop {
            let info = self.info(node, "persistence").await?;
            if info.get("rdb_bgsave_in_progress").map(String::as_str) != Some("1") {
                if info.get("rdb_last_bgsave_status").map(String::as_str) == Some("err") {
                    return Err(StatefulError::Command {
                        node: node.name.clone(),
                        command: "BGSAVE".to_string(),
                        exit_code: 0,
                        output: "rdb_last_bgsave_status:err".to_string(),
                    });
                }
                return Ok(());
            }
            debug!(node = %node.name, "background save in progress");
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn replace_data_and_start(&self, node: &Node, path: &str) -> StatefulResult<()> {
        let data_file = shell_quote(&self.data_file);
        self.run(node, &format!("cp {} {data_file}", shell_quote(path)))
            .await?;
        self.run(node, &format!("chown {} {data_file}", shell_quote(&self.owner)))
            .await?;
        self.run(node, &format!("systemctl start {}", self.unit)).await?;
        let pong = self.cli(node, "PING").await?;
        if pong.trim() != "PONG" {
            return Err(StatefulError::Integrity(format!(
                "{} did not answer PING after restore: {:?}",
                node.name,
                pong.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StatefulHandler for RedisHandler {
    fn service_type(&self) -> &str {
        SERVICE_TYPE
    }

    fn backup_extension(&self) -> &str {
        "rdb"
    }

    async fn setup_replication(&self, primary: &Node, replica: &Node) -> StatefulResult<()> {
        let reply = self
            .cli(replica, &format!("REPLICAOF {} {}", primary.address, self.port))
            .await?;
        if !reply.contains("OK") {
            return Err(StatefulError::Command {
                node: replica.name.clone(),
                command: "REPLICAOF".to_string(),
                exit_code: 0,
                output: reply.trim().to_string(),
            });
        }
        info!(primary = %primary.name, replica = %replica.name, "replication configured");
        Ok(())
    }

    async fn check_sync_status(&self, primary: &Node, replica: &Node) -> StatefulResult<SyncStatus> {
        let theirs = self.info(replica, "replication").await?;
        let ours = self.info(primary, "replication").await?;

        let link_up = theirs.get("master_link_status").map(String::as_str) == Some("up");
        let in_progress = theirs.get("master_sync_in_progress").map(String::as_str) == Some("1");
        let primary_offset = number(&ours, "master_repl_offset");
        let replica_offset = number(&theirs, "slave_repl_offset");

        let progress = if in_progress {
            let total = number(&theirs, "master_sync_total_bytes");
            let read = number(&theirs, "master_sync_read_bytes");
            if total > 0 { read as f64 / total as f64 } else { 0.0 }
        } else if primary_offset == 0 {
            if link_up { 1.0 } else { 0.0 }
        } else {
            replica_offset as f64 / primary_offset as f64
        };
        let synced = link_up && !in_progress && replica_offset >= primary_offset;

        let details = BTreeMap::from([
            ("link_status".to_string(), json!(theirs.get("master_link_status"))),
            ("sync_in_progress".to_string(), json!(in_progress)),
            ("primary_offset".to_string(), json!(primary_offset)),
            ("replica_offset".to_string(), json!(replica_offset)),
        ]);
        Ok(SyncStatus {
            synced,
            progress: progress.clamp(0.0, 1.0),
            details,
        })
    }

    async fn promote_replica(&self, replica: &Node) -> StatefulResult<bool> {
        self.cli(replica, "REPLICAOF NO ONE").await?;
        let info = self.info(replica, "replication").await?;
        let role = info.get("role").map(String::as_str).unwrap_or("unknown");
        if role != "master" {
            warn!(node = %replica.name, %role, "promotion not reflected in replication role");
            return Ok(false);
        }
        info!(node = %replica.name, "replica promoted");
        Ok(true)
    }

    async fn create_backup(
        &self,
        node: &Node,
        path: &str,
        deadline: Duration,
        poll_interval: Duration,
    ) -> StatefulResult<BackupArtifact> {
        self.cli(node, "BGSAVE").await?;
        tokio::time::timeout(deadline, self.wait_for_bgsave(node, poll_interval))
            .await
            .map_err(|_| {
                StatefulError::Timeout(format!(
                    "background save on {} still running after {deadline:?}",
                    node.name
                ))
            })??;

        let target = shell_quote(path);
        if let Some((dir, _)) = path.rsplit_once('/')
            && !dir.is_empty()
        {
            self.run(node, &format!("mkdir -p {}", shell_quote(dir))).await?;
        }
        self.run(node, &format!("cp {} {target}", shell_quote(&self.data_file)))
            .await?;

        let size = self.run(node, &format!("stat -c %s {target}")).await?;
        let size_bytes = size.trim().parse::<u64>().map_err(|_| {
            StatefulError::Integrity(format!("unreadable size for {path}: {:?}", size.trim()))
        })?;
        let checksum = self.checksum(node, path).await?;

        info!(node = %node.name, %path, size_bytes, "backup written");
        Ok(BackupArtifact {
            size_bytes,
            checksum,
        })
    }

    async fn restore_backup(&self, node: &Node, path: &str, checksum: &str) -> StatefulResult<()> {
        let actual = self.checksum(node, path).await?;
        if !actual.eq_ignore_ascii_case(checksum) {
            return Err(StatefulError::Integrity(format!(
                "checksum mismatch for {path} on {}: expected {checksum}, found {actual}",
                node.name
            )));
        }

        self.run(node, &format!("systemctl stop {}", self.unit)).await?;
        if let Err(e) = self.replace_data_and_start(node, path).await {
            warn!(node = %node.name, error = %e, "restore failed; starting service again");
            if let Err(start) = self.run(node, &format!("systemctl start {}", self.unit)).await {
                warn!(node = %node.name, error = %start, "service did not restart after failed restore");
            }
            return Err(e);
        }
        info!(node = %node.name, %path, "backup restored");
        Ok(())
    }

    async fn verify_data_integrity(&self, node: &Node) -> StatefulResult<IntegrityReport> {
        let mut details = BTreeMap::new();

        let ping = self.cli(node, "PING").await?;
        let alive = ping.trim() == "PONG";
        details.insert("ping".to_string(), json!(ping.trim()));

        let persistence = self.info(node, "persistence").await?;
        let bgsave = persistence
            .get("rdb_last_bgsave_status")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        details.insert("rdb_last_bgsave_status".to_string(), json!(bgsave));

        let dbsize = self.cli(node, "DBSIZE").await?;
        let keys = dbsize
            .trim()
            .trim_start_matches("(integer)")
            .trim()
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or(Value::Null);
        details.insert("keys".to_string(), keys);

        Ok(IntegrityReport {
            healthy: alive && bgsave != "err",
            details,
        })
    }
}

/// `key:value` lines of an INFO reply; section headers and blanks skipped.
fn parse_info(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn number(info: &HashMap<String, String>, key: &str) -> u64 {
    info.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
}
