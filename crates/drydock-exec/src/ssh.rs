//! OpenSSH-backed executor.
//!
//! Shells out to the system `ssh` client in batch mode, and to the
//! configured playbook runner for playbooks. Every invocation is bounded by
//! a deadline and killed if it overruns.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use drydock_core::config::{PlaybookConfig, SshConfig};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::error::ExecError;
use crate::executor::{CommandExecutor, CommandOutput, SshTarget};

/// Exit status the OpenSSH client reserves for its own failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

#[derive(Debug, Clone)]
pub struct SshExecutor {
    ssh: SshConfig,
    playbooks: PlaybookConfig,
}

impl SshExecutor {
    pub fn new(ssh: SshConfig, playbooks: PlaybookConfig) -> Self {
        Self { ssh, playbooks }
    }

    /// Arguments for `ssh` up to (not including) the remote command.
    fn ssh_args(&self, target: &SshTarget) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.ssh.connect_timeout_secs),
            "-p".to_string(),
            target.port.to_string(),
        ];
        if let Some(key) = &self.ssh.key_path {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push(format!("{}@{}", target.user, target.host));
        args
    }

    fn playbook_args(
        &self,
        target: &SshTarget,
        playbook: &str,
        extra_vars: &BTreeMap<String, String>,
    ) -> Vec<String> {
        // Trailing comma makes the inventory an inline host list.
        let mut args = vec![
            "-i".to_string(),
            format!("{},", target.host),
            "-u".to_string(),
            target.user.clone(),
            "-e".to_string(),
            format!("ansible_port={}", target.port),
        ];
        if let Some(key) = &self.ssh.key_path {
            args.push("--private-key".to_string());
            args.push(key.display().to_string());
        }
        for (k, v) in extra_vars {
            args.push("-e".to_string());
            args.push(format!("{k}={v}"));
        }
        args.push(playbook.to_string());
        args
    }
}

/// Run a local program to completion under a deadline.
async fn run_process(
    program: &str,
    args: &[String],
    host: &str,
    timeout: Duration,
) -> Result<CommandOutput, ExecError> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExecError::Spawn {
            program: program.to_string(),
            reason: e.to_string(),
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(ExecError::Spawn {
                program: program.to_string(),
                reason: e.to_string(),
            });
        }
        Err(_) => {
            warn!(%program, %host, ?timeout, "command timed out");
            return Err(ExecError::Timeout {
                host: host.to_string(),
                after: timeout,
            });
        }
    };

    Ok(CommandOutput {
        // Killed by a signal: no exit code.
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[async_trait]
impl CommandExecutor for SshExecutor {
    fn command_timeout(&self) -> Duration {
        self.ssh.command_timeout()
    }

    #[instrument(skip(self, target), fields(target = %target))]
    async fn execute_timeout(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError> {
        let mut args = self.ssh_args(target);
        args.push("--".to_string());
        args.push(command.to_string());

        let output = run_process("ssh", &args, &target.host, timeout).await?;
        if output.exit_code == SSH_CONNECTION_FAILURE {
            return Err(ExecError::Unreachable {
                host: target.host.clone(),
                reason: output.error_text(),
            });
        }
        debug!(exit_code = output.exit_code, "remote command finished");
        Ok(output)
    }

    async fn check_connectivity(&self, host: &str, port: u16) -> bool {
        let connect = tokio::net::TcpStream::connect((host, port));
        match tokio::time::timeout(self.ssh.connect_timeout(), connect).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(%host, port, error = %e, "connectivity probe failed");
                false
            }
            Err(_) => {
                debug!(%host, port, "connectivity probe timed out");
                false
            }
        }
    }

    #[instrument(skip(self, target, extra_vars), fields(target = %target))]
    async fn run_playbook(
        &self,
        target: &SshTarget,
        playbook: &str,
        extra_vars: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, ExecError> {
        let args = self.playbook_args(target, playbook, extra_vars);
        let output = run_process(
            &self.playbooks.command,
            &args,
            &target.host,
            self.playbooks.timeout(),
        )
        .await?;
        debug!(exit_code = output.exit_code, "playbook finished");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn executor_with_key() -> SshExecutor {
        SshExecutor::new(
            SshConfig {
                key_path: Some(PathBuf::from("/etc/drydock/id_ed25519")),
                ..Default::default()
            },
            PlaybookConfig::default(),
        )
    }

    #[test]
    fn ssh_args_include_port_key_and_destination() {
        let exec = executor_with_key();
        let args = exec.ssh_args(&SshTarget::new("10.0.0.5", "deploy", 2222));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
        assert!(args.windows(2).any(|w| w == ["-i", "/etc/drydock/id_ed25519"]));
        assert_eq!(args.last().unwrap(), "deploy@10.0.0.5");
    }

    #[test]
    fn playbook_args_inline_inventory_and_vars() {
        let exec = executor_with_key();
        let mut vars = BTreeMap::new();
        vars.insert("version".to_string(), "7.2".to_string());
        let args = exec.playbook_args(
            &SshTarget::new("10.0.0.5", "root", 22),
            "playbooks/redis.yml",
            &vars,
        );
        assert!(args.windows(2).any(|w| w == ["-i", "10.0.0.5,"]));
        assert!(args.windows(2).any(|w| w == ["-e", "version=7.2"]));
        assert_eq!(args.last().unwrap(), "playbooks/redis.yml");
    }

    #[tokio::test]
    async fn connectivity_to_closed_port_is_false() {
        let exec = SshExecutor::new(
            SshConfig {
                connect_timeout_secs: 1,
                ..Default::default()
            },
            PlaybookConfig::default(),
        );
        assert!(!exec.check_connectivity("127.0.0.1", 1).await);
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let err = run_process(
            "drydock-definitely-not-a-binary",
            &[],
            "localhost",
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
