//! Shared handles for every operation: configuration, the state store,
//! the command executor, and the services built on them.
//!
//! One `App` per process. The daemon builds it once and serves every
//! operator request from it, so the reconciler, deployments and swaps
//! all see the same node claims.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use drydock_core::{DrydockConfig, Node, NodeLocks, Role};
use drydock_exec::{CommandExecutor, Reply, ScriptedExecutor, SshExecutor};
use drydock_rollout::{DeploymentContext, Orchestrator, ProgressCallback};
use drydock_state::{NodeRepository, StateStore};
use drydock_stateful::StatefulServiceManager;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// File name of the redb database inside the data directory.
pub const DB_FILE: &str = "drydock.redb";

/// Digest of empty input, reported for every dry-run backup.
const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Deployment snapshots buffered per subscriber before it starts lagging.
const PROGRESS_BUFFER: usize = 256;

/// The config file (or defaults) with the `--data-dir` override applied.
pub fn load_config(
    config_path: Option<&Path>,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<DrydockConfig> {
    let mut config = match config_path {
        Some(path) => DrydockConfig::from_file(path)?,
        None => DrydockConfig::default(),
    };
    if data_dir.is_some() {
        config.data_dir = data_dir;
    }
    Ok(config)
}

pub struct App {
    pub config: DrydockConfig,
    pub store: StateStore,
    pub executor: Arc<dyn CommandExecutor>,
    pub locks: NodeLocks,
    pub orchestrator: Orchestrator,
    pub stateful: StatefulServiceManager,
    /// Every deployment snapshot the orchestrator reports.
    pub progress: broadcast::Sender<DeploymentContext>,
}

impl App {
    /// Open the state store under the data directory and build the
    /// services on top of it. The store is exclusive to this process.
    pub fn open(config: DrydockConfig, dry_run: bool) -> anyhow::Result<Self> {
        let executor: Arc<dyn CommandExecutor> = if dry_run {
            warn!("dry run: remote commands are simulated");
            Arc::new(dry_run_executor())
        } else {
            Arc::new(SshExecutor::new(config.ssh.clone(), config.playbooks.clone()))
        };
        Self::with_executor(config, executor)
    }

    pub fn with_executor(
        config: DrydockConfig,
        executor: Arc<dyn CommandExecutor>,
    ) -> anyhow::Result<Self> {
        let dir = config.data_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating data directory {}", dir.display()))?;
        let db_path = dir.join(DB_FILE);
        let store = StateStore::open(&db_path)
            .with_context(|| format!("opening state store {}", db_path.display()))?;
        info!(path = %db_path.display(), "state store opened");

        let locks = NodeLocks::new();
        let (progress, _) = broadcast::channel(PROGRESS_BUFFER);
        let forward = progress.clone();
        let on_progress: ProgressCallback = Arc::new(move |ctx: &DeploymentContext| {
            // No subscribers is fine.
            let _ = forward.send(ctx.clone());
        });
        let repo: Arc<dyn NodeRepository> = Arc::new(store.clone());
        let orchestrator = Orchestrator::new(
            Arc::clone(&repo),
            Arc::clone(&executor),
            locks.clone(),
            config.clone(),
        )
        .with_progress_callback(on_progress);
        let stateful = StatefulServiceManager::new(repo, Arc::clone(&executor), &config.stateful);

        Ok(Self {
            config,
            store,
            executor,
            locks,
            orchestrator,
            stateful,
            progress,
        })
    }

    pub fn repo(&self) -> Arc<dyn NodeRepository> {
        Arc::new(self.store.clone())
    }

    /// Look a node up by id first, then by name.
    pub fn resolve_node(&self, key: &str) -> anyhow::Result<Node> {
        if let Some(node) = self.store.get_node(key)? {
            return Ok(node);
        }
        self.store
            .get_node_by_name(key)?
            .with_context(|| format!("no node with id or name {key:?}"))
    }

    pub fn resolve_role(&self, name: &str) -> anyhow::Result<Role> {
        self.store
            .get_role_by_name(name)?
            .with_context(|| format!("no role named {name:?}"))
    }

    /// The explicit service type, or the one declared by the node's role.
    pub fn service_type_for(&self, node: &Node, explicit: Option<&str>) -> anyhow::Result<String> {
        if let Some(service_type) = explicit {
            return Ok(service_type.to_string());
        }
        let role_name = node
            .role
            .as_deref()
            .with_context(|| format!("node {} has no role; pass --service-type", node.name))?;
        let role = self.resolve_role(role_name)?;
        role.service_type
            .with_context(|| format!("role {} declares no service_type; pass --service-type", role.name))
    }
}

/// An executor that answers the commands the built-in flows issue as if
/// every host were healthy and idle.
pub fn dry_run_executor() -> ScriptedExecutor {
    let exec = ScriptedExecutor::new();
    exec.on("PING", Reply::ok("PONG\n"))
        .on("REPLICAOF", Reply::ok("OK\n"))
        .on(
            "INFO replication",
            Reply::ok(
                "role:master\nmaster_link_status:up\nmaster_sync_in_progress:0\n\
                 master_repl_offset:0\nslave_repl_offset:0\n",
            ),
        )
        .on("INFO persistence", Reply::ok("rdb_bgsave_in_progress:0\nrdb_last_bgsave_status:ok\n"))
        .on("DBSIZE", Reply::ok("(integer) 0\n"))
        .on("systemctl is-active", Reply::ok("active\n"))
        .on("cp ", Reply::ok(""))
        .on("stat -c", Reply::ok("0\n"))
        .on("sha256sum", Reply::ok(&format!("{EMPTY_SHA256}  -\n")));
    exec
}

#[cfg(test)]
mod tests {
    use super::*;
    use drydock_core::NewNode;

    fn app_in(dir: &Path) -> App {
        App::open(load_config(None, Some(dir.to_path_buf())).unwrap(), true).unwrap()
    }

    #[test]
    fn opens_store_under_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let _app = app_in(dir.path());
        assert!(dir.path().join(DB_FILE).exists());
    }

    #[test]
    fn second_open_of_same_store_fails() {
        let dir = tempfile::tempdir().unwrap();
        let _daemon = app_in(dir.path());

        let second = App::open(load_config(None, Some(dir.path().to_path_buf())).unwrap(), true);
        assert!(second.is_err());
    }

    #[test]
    fn data_dir_flag_overrides_config() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("drydock.toml");
        std::fs::write(&file, "data_dir = \"/var/lib/elsewhere\"\n").unwrap();

        let from_file = load_config(Some(&file), None).unwrap();
        assert_eq!(from_file.data_dir(), PathBuf::from("/var/lib/elsewhere"));
        let overridden = load_config(Some(&file), Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(overridden.data_dir(), dir.path());
    }

    #[test]
    fn resolves_nodes_by_id_or_name() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_in(dir.path());
        let node = app
            .store
            .create_node(NewNode::new("cache-01", "10.0.0.11"))
            .unwrap();

        assert_eq!(app.resolve_node(&node.id).unwrap().id, node.id);
        assert_eq!(app.resolve_node("cache-01").unwrap().id, node.id);
        assert!(app.resolve_node("cache-99").is_err());
    }

    #[test]
    fn service_type_comes_from_role_unless_given() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_in(dir.path());
        let role = Role {
            name: "cache".into(),
            services: vec!["redis-server".into()],
            stateful: true,
            service_type: Some("redis".into()),
            required_capabilities: Default::default(),
            install_playbook: None,
            purge_playbook: None,
            health_checks: Vec::new(),
        };
        app.store.put_role(&role).unwrap();
        let node = app
            .store
            .create_node(NewNode::new("cache-01", "10.0.0.11"))
            .unwrap();
        assert!(app.service_type_for(&node, None).is_err());

        app.store.assign_role_to_node(&node.id, Some("cache")).unwrap();
        let node = app.resolve_node("cache-01").unwrap();
        assert_eq!(app.service_type_for(&node, None).unwrap(), "redis");
        assert_eq!(app.service_type_for(&node, Some("other")).unwrap(), "other");
    }
}
