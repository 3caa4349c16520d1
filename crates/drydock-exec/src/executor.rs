//! The command-execution interface.
//!
//! Everything the control plane does to a host goes through
//! [`CommandExecutor`]: shell commands over SSH, TCP reachability probes,
//! and playbook runs.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use drydock_core::Node;

use crate::error::ExecError;

/// Where and as whom to run a command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
}

impl SshTarget {
    pub fn new(host: &str, user: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            user: user.to_string(),
            port,
        }
    }
}

impl From<&Node> for SshTarget {
    fn from(node: &Node) -> Self {
        Self::new(&node.address, &node.ssh_user, node.ssh_port)
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Output from a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    /// Check if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// First non-empty of stderr/stdout, trimmed, for error messages.
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Remote command execution.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Deadline applied by [`CommandExecutor::execute`].
    fn command_timeout(&self) -> Duration;

    /// Run `command` on `target`, failing with `Timeout` after `timeout`.
    async fn execute_timeout(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError>;

    /// Run `command` on `target` with the executor's default deadline.
    async fn execute(&self, target: &SshTarget, command: &str) -> Result<CommandOutput, ExecError> {
        self.execute_timeout(target, command, self.command_timeout())
            .await
    }

    /// Whether a TCP connection to `host:port` can be opened.
    async fn check_connectivity(&self, host: &str, port: u16) -> bool;

    /// Run a playbook against a single-host inventory. Exit code 0 is success.
    async fn run_playbook(
        &self,
        target: &SshTarget,
        playbook: &str,
        extra_vars: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, ExecError>;
}

/// Quote a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_display() {
        let target = SshTarget::new("10.0.0.1", "deploy", 2222);
        assert_eq!(target.to_string(), "deploy@10.0.0.1:2222");
    }

    #[test]
    fn error_text_prefers_stderr() {
        let out = CommandOutput {
            exit_code: 1,
            stdout: "partial".to_string(),
            stderr: " boom \n".to_string(),
        };
        assert_eq!(out.error_text(), "boom");
        assert_eq!(CommandOutput::failed(2, "").error_text(), "");
        assert_eq!(
            CommandOutput {
                exit_code: 1,
                stdout: "only stdout".to_string(),
                stderr: String::new()
            }
            .error_text(),
            "only stdout"
        );
    }

    #[test]
    fn shell_quote_plain_and_special() {
        assert_eq!(shell_quote("/var/lib/redis/dump.rdb"), "/var/lib/redis/dump.rdb");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
