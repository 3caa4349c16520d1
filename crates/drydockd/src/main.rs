//! drydockd — the drydock control-plane daemon.
//!
//! One binary for the long-running daemon and the operator commands:
//! - Node and role registration (redb state store)
//! - Deployments (sequential, maintenance window, blue-green)
//! - Redis replication, checksummed backups and replicated swaps
//!
//! While `run` is up it owns the state store; the other subcommands reach
//! it over a Unix socket in the data directory. Without a daemon they open
//! the store themselves.
//!
//! # Usage
//!
//! ```text
//! drydockd --config /etc/drydock/drydock.toml run
//! drydockd node add --name cache-01 --address 10.0.0.11 --capability ssd
//! drydockd deploy --role cache --strategy sequential --nodes cache-01,cache-02
//! drydockd --dry-run deploy --role cache --strategy blue-green --nodes cache-01
//! drydockd swap --primary cache-01 --standby cache-02 --playbook redis-upgrade.yml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod app;
mod commands;
mod console;
mod control;

use app::App;
use commands::Operation;
use console::Console;

const DEFAULT_LOG_FILTER: &str = "info,drydockd=debug,drydock=debug";

#[derive(Parser)]
#[command(
    name = "drydockd",
    about = "Drydock — fleet lifecycle control plane",
    version,
    propagate_version = true
)]
struct Cli {
    /// Configuration file (defaults apply when omitted).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the state database; overrides `data_dir`.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Simulate remote commands instead of connecting to hosts.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Log as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (reconciler and control socket) until Ctrl-C.
    Run,
    /// Manage nodes.
    Node {
        #[command(subcommand)]
        action: NodeAction,
    },
    /// Manage roles.
    Role {
        #[command(subcommand)]
        action: RoleAction,
    },
    /// Create and run a deployment, printing each step as it completes.
    Deploy {
        #[arg(long)]
        role: String,
        /// sequential, maintenance-window or blue-green.
        #[arg(long, default_value = "sequential")]
        strategy: String,
        /// Target nodes by id or name, comma separated.
        #[arg(long, value_delimiter = ',', required = true)]
        nodes: Vec<String>,
        /// Playbook to run; defaults to the role's install playbook.
        #[arg(long)]
        playbook: Option<String>,
        /// Strategy parameter or playbook variable, as key=value.
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Back up or restore stateful service data.
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },
    /// Replicate a stateful service onto another node.
    Replicate {
        #[arg(long)]
        primary: String,
        #[arg(long)]
        replica: String,
        /// Handler to use; defaults to the primary's role service type.
        #[arg(long)]
        service_type: Option<String>,
        /// Promote the replica once it is in sync.
        #[arg(long)]
        promote: bool,
    },
    /// Update a stateful node through a standby: replicate, promote the
    /// standby, then run the playbook on the original primary.
    Swap {
        #[arg(long)]
        primary: String,
        #[arg(long)]
        standby: String,
        #[arg(long)]
        playbook: String,
        /// Handler to use; defaults to the primary's role service type.
        #[arg(long)]
        service_type: Option<String>,
        /// Playbook variable, as key=value.
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
}

#[derive(Subcommand)]
enum NodeAction {
    /// Register a node in state UNKNOWN.
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        address: String,
        #[arg(long)]
        ssh_port: Option<u16>,
        #[arg(long)]
        ssh_user: Option<String>,
        /// Capability tag; repeatable.
        #[arg(long = "capability")]
        capabilities: Vec<String>,
    },
    /// List nodes, optionally only those in one state.
    List {
        #[arg(long)]
        state: Option<String>,
    },
    /// Show a node and its recent transitions.
    Show {
        node: String,
        #[arg(long, default_value = "10")]
        history: usize,
    },
    /// Move a node to another state.
    SetState {
        node: String,
        state: String,
        /// Skip transition validation (logged).
        #[arg(long)]
        force: bool,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Delete a node in UNKNOWN or ERROR.
    Delete { node: String },
}

#[derive(Subcommand)]
enum RoleAction {
    /// Register or replace a role from a TOML file.
    Add { file: PathBuf },
    List,
}

#[derive(Subcommand)]
enum BackupAction {
    /// Snapshot a node's service data.
    Create {
        #[arg(long)]
        node: String,
        #[arg(long)]
        service_type: Option<String>,
        /// Destination on the node; defaults under the backup directory.
        #[arg(long)]
        path: Option<String>,
    },
    /// Restore a backup file after verifying its checksum.
    Restore {
        #[arg(long)]
        node: String,
        #[arg(long)]
        path: String,
        #[arg(long)]
        checksum: String,
        #[arg(long)]
        service_type: Option<String>,
    },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

impl Command {
    /// The operation this subcommand asks for; `None` for `run`.
    fn into_operation(self) -> anyhow::Result<Option<Operation>> {
        let op = match self {
            Command::Run => return Ok(None),
            Command::Node { action } => match action {
                NodeAction::Add {
                    name,
                    address,
                    ssh_port,
                    ssh_user,
                    capabilities,
                } => Operation::NodeAdd {
                    name,
                    address,
                    ssh_port,
                    ssh_user,
                    capabilities,
                },
                NodeAction::List { state } => Operation::NodeList { state },
                NodeAction::Show { node, history } => Operation::NodeShow { node, history },
                NodeAction::SetState {
                    node,
                    state,
                    force,
                    reason,
                } => Operation::NodeSetState {
                    node,
                    state,
                    force,
                    reason,
                },
                NodeAction::Delete { node } => Operation::NodeDelete { node },
            },
            Command::Role { action } => match action {
                RoleAction::Add { file } => Operation::RoleAdd {
                    content: commands::role::read_file(&file)?,
                    source: file.display().to_string(),
                },
                RoleAction::List => Operation::RoleList,
            },
            Command::Deploy {
                role,
                strategy,
                nodes,
                playbook,
                params,
            } => Operation::Deploy {
                role,
                strategy,
                nodes,
                playbook,
                params: params.into_iter().collect(),
            },
            Command::Backup { action } => match action {
                BackupAction::Create {
                    node,
                    service_type,
                    path,
                } => Operation::BackupCreate {
                    node,
                    service_type,
                    path,
                },
                BackupAction::Restore {
                    node,
                    path,
                    checksum,
                    service_type,
                } => Operation::BackupRestore {
                    node,
                    path,
                    checksum,
                    service_type,
                },
            },
            Command::Replicate {
                primary,
                replica,
                service_type,
                promote,
            } => Operation::Replicate {
                primary,
                replica,
                service_type,
                promote,
            },
            Command::Swap {
                primary,
                standby,
                playbook,
                service_type,
                params,
            } => Operation::Swap {
                primary,
                standby,
                service_type,
                playbook,
                params: params.into_iter().collect(),
            },
        };
        Ok(Some(op))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = app::load_config(cli.config.as_deref(), cli.data_dir)?;
    let socket = control::socket_path(&config);

    let Some(op) = cli.command.into_operation()? else {
        let app = Arc::new(App::open(config, cli.dry_run)?);
        return commands::run::run(app, &socket).await;
    };

    // A running daemon holds the store and the node claims; hand it the work.
    if let Some(stream) = control::connect(&socket).await {
        if cli.dry_run {
            anyhow::bail!(
                "drydockd is running on {}; stop it to use --dry-run against this data directory",
                socket.display()
            );
        }
        info!(socket = %socket.display(), operation = op.name(), "forwarding to running daemon");
        return control::request(stream, &op, &Console::Stdout).await;
    }

    let app = App::open(config, cli.dry_run)?;
    op.execute(&app, &Console::Stdout).await
}
