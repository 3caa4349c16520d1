//! Local control socket.
//!
//! The daemon owns the state store and the node claims, so operator
//! commands issued while it runs are forwarded to it instead of opening
//! the store themselves. One request per connection: the client writes a
//! JSON [`Operation`] line, the daemon answers with [`Frame`] lines, the
//! last of which is `done`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use drydock_core::DrydockConfig;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::app::App;
use crate::commands::Operation;
use crate::console::Console;

/// File name of the socket inside the data directory.
pub const SOCKET_FILE: &str = "drydockd.sock";

pub fn socket_path(config: &DrydockConfig) -> PathBuf {
    config.data_dir().join(SOCKET_FILE)
}

/// One line of the daemon's reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frame {
    Line(String),
    Done { error: Option<String> },
}

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Bind `path`, clearing a socket left behind by a daemon that died.
    /// A socket that still answers belongs to a live daemon and is left
    /// alone.
    pub async fn bind(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            if UnixStream::connect(path).await.is_ok() {
                anyhow::bail!("another drydockd is already serving {}", path.display());
            }
            tokio::fs::remove_file(path)
                .await
                .with_context(|| format!("removing stale socket {}", path.display()))?;
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("binding control socket {}", path.display()))?;
        info!(path = %path.display(), "control socket listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Serve requests until `shutdown` flips. Requests already accepted
    /// keep running on their own tasks.
    pub async fn serve(self, app: Arc<App>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let app = Arc::clone(&app);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(app, stream).await {
                                warn!(error = %e, "control request failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "control socket accept failed"),
                },
                _ = shutdown.changed() => break,
            }
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(error = %e, "control socket already gone");
        }
        info!("control socket closed");
    }
}

async fn handle_connection(app: Arc<App>, stream: UnixStream) -> anyhow::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut request = String::new();
    reader.read_line(&mut request).await?;

    let op: Operation = match serde_json::from_str(request.trim()) {
        Ok(op) => op,
        Err(e) => {
            let error = Some(format!("bad control request: {e}"));
            write_frame(&mut write, &Frame::Done { error }).await?;
            return Ok(());
        }
    };
    let name = op.name();
    info!(operation = name, "control request");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let console = Console::Remote(tx);
    let task = tokio::spawn(async move { op.execute(&app, &console).await });

    // The channel closes when the operation drops its console.
    while let Some(line) = rx.recv().await {
        write_frame(&mut write, &Frame::Line(line)).await?;
    }
    let error = match task.await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(format!("{e:#}")),
        Err(e) => Some(format!("{name} aborted: {e}")),
    };
    if let Some(error) = &error {
        warn!(operation = name, %error, "control request ended with an error");
    }
    write_frame(&mut write, &Frame::Done { error }).await
}

async fn write_frame(write: &mut OwnedWriteHalf, frame: &Frame) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    write.write_all(line.as_bytes()).await?;
    Ok(())
}

/// A connection to the running daemon, or `None` when nothing answers at
/// `path`.
pub async fn connect(path: &Path) -> Option<UnixStream> {
    UnixStream::connect(path).await.ok()
}

/// Send `op` over `stream` and relay the daemon's output to `out`. The
/// daemon's error, if any, becomes this call's error.
pub async fn request(stream: UnixStream, op: &Operation, out: &Console) -> anyhow::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut body = serde_json::to_string(op)?;
    body.push('\n');
    write.write_all(body.as_bytes()).await?;

    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        let frame: Frame = serde_json::from_str(&line)
            .with_context(|| format!("unreadable reply from drydockd: {line:?}"))?;
        match frame {
            Frame::Line(text) => out.line(text),
            Frame::Done { error: None } => return Ok(()),
            Frame::Done { error: Some(error) } => anyhow::bail!(error),
        }
    }
    anyhow::bail!("drydockd closed the connection before {} finished", op.name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use drydock_core::{NewNode, NodeState};
    use drydock_state::NodeRepository;

    use crate::app::load_config;

    async fn daemon(dir: &Path) -> (Arc<App>, PathBuf, watch::Sender<bool>) {
        let mut config = load_config(None, Some(dir.to_path_buf())).unwrap();
        config.health.poll_interval_ms = 1;
        let app = Arc::new(App::open(config, true).unwrap());
        let path = socket_path(&app.config);
        let server = ControlServer::bind(&path).await.unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(server.serve(Arc::clone(&app), rx));
        (app, path, tx)
    }

    async fn send(path: &Path, op: Operation) -> (anyhow::Result<()>, Vec<String>) {
        let stream = connect(path).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = request(stream, &op, &Console::Remote(tx)).await;
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        (result, lines)
    }

    #[tokio::test]
    async fn operations_run_inside_the_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let (app, path, _shutdown) = daemon(dir.path()).await;

        let (result, lines) = send(
            &path,
            Operation::NodeAdd {
                name: "cache-01".into(),
                address: "10.0.0.11".into(),
                ssh_port: None,
                ssh_user: None,
                capabilities: vec!["ssd".into()],
            },
        )
        .await;

        result.unwrap();
        assert!(lines[0].starts_with("✓ Registered cache-01"));
        let node = app.resolve_node("cache-01").unwrap();
        assert!(node.capabilities.contains("ssd"));
    }

    #[tokio::test]
    async fn deploy_through_socket_uses_daemon_claims() {
        let dir = tempfile::tempdir().unwrap();
        let (app, path, _shutdown) = daemon(dir.path()).await;
        let role = "name = \"web\"\nservices = [\"nginx\"]\ninstall_playbook = \"web.yml\"\n";
        send(
            &path,
            Operation::RoleAdd {
                source: "web.toml".into(),
                content: role.into(),
            },
        )
        .await
        .0
        .unwrap();
        let node = app
            .store
            .create_node(NewNode::new("web-01", "web-01.fleet.test"))
            .unwrap();
        app.store.assign_role_to_node(&node.id, Some("web")).unwrap();
        app.store
            .update_node_state(&node.id, NodeState::Online, "test", None, false)
            .unwrap();
        let deploy = Operation::Deploy {
            role: "web".into(),
            strategy: "sequential".into(),
            nodes: vec!["web-01".into()],
            playbook: None,
            params: BTreeMap::new(),
        };

        // A claim held inside the daemon blocks a deployment sent from outside.
        assert!(app.locks.try_claim(&node.id, "reconciler"));
        let (result, _) = send(&path, deploy.clone()).await;
        assert!(result.unwrap_err().to_string().contains("claimed by reconciler"));

        app.locks.release_all("reconciler");
        let (result, lines) = send(&path, deploy).await;
        result.unwrap();
        assert!(lines.last().unwrap().contains("succeeded"));
        assert_eq!(app.orchestrator.list_deployments().len(), 2);
        assert_eq!(app.resolve_node("web-01").unwrap().state, NodeState::Online);
    }

    #[tokio::test]
    async fn errors_come_back_to_the_caller() {
        let dir = tempfile::tempdir().unwrap();
        let (_app, path, _shutdown) = daemon(dir.path()).await;

        let (result, lines) = send(&path, Operation::NodeDelete { node: "ghost".into() }).await;

        assert!(lines.is_empty());
        assert!(result.unwrap_err().to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn live_socket_is_not_stolen_and_stale_one_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let (_app, path, shutdown) = daemon(dir.path()).await;

        assert!(ControlServer::bind(&path).await.is_err());

        shutdown.send(true).unwrap();
        for _ in 0..100 {
            if !path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!path.exists());
        assert!(connect(&path).await.is_none());

        // A socket file nobody listens on, as left by a crashed daemon.
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());
        let _server = ControlServer::bind(&path).await.unwrap();
        assert!(connect(&path).await.is_some());
    }
}
