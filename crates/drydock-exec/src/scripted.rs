//! In-memory executor with scripted replies.
//!
//! Backs `--dry-run` in the daemon and every test that needs remote
//! effects. Unscripted commands succeed with empty output, except a small
//! set of file commands (`cp`, `rm -f`, `sha256sum`, `stat -c %s`) that
//! operate on a simulated per-host filesystem.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::ExecError;
use crate::executor::{CommandExecutor, CommandOutput, SshTarget};

/// What a scripted command does.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Output(CommandOutput),
    /// Finishes after the given delay; overrunning the deadline is a timeout.
    Slow(Duration, CommandOutput),
    Timeout,
    Unreachable,
}

impl Reply {
    pub fn ok(stdout: &str) -> Self {
        Reply::Output(CommandOutput::ok(stdout))
    }

    pub fn fail(exit_code: i32, stderr: &str) -> Self {
        Reply::Output(CommandOutput::failed(exit_code, stderr))
    }
}

/// A recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub host: String,
    pub command: String,
}

struct Rule {
    host: Option<String>,
    pattern: String,
    /// Consumed front to back; the last reply repeats forever.
    replies: VecDeque<Reply>,
}

impl Rule {
    fn next_reply(&mut self) -> Reply {
        if self.replies.len() > 1 {
            self.replies.pop_front().unwrap_or(Reply::ok(""))
        } else {
            self.replies.front().cloned().unwrap_or(Reply::ok(""))
        }
    }
}

#[derive(Default)]
struct Script {
    rules: Vec<Rule>,
    unreachable: HashSet<String>,
    failing_playbooks: HashSet<String>,
    files: HashMap<(String, String), Vec<u8>>,
    calls: Vec<ExecCall>,
}

impl Script {
    fn take_reply(&mut self, host: &str, command: &str) -> Option<Reply> {
        let host_rule = self
            .rules
            .iter()
            .position(|r| r.host.as_deref() == Some(host) && command.contains(&r.pattern));
        let any_rule = || {
            self.rules
                .iter()
                .position(|r| r.host.is_none() && command.contains(&r.pattern))
        };
        let idx = host_rule.or_else(any_rule)?;
        Some(self.rules[idx].next_reply())
    }

    fn emulate(&mut self, host: &str, command: &str) -> CommandOutput {
        let words: Vec<&str> = command
            .split_whitespace()
            .map(|w| w.trim_matches('\''))
            .collect();
        let key = |path: &str| (host.to_string(), path.to_string());

        match words.as_slice() {
            ["cp", src, dst] => match self.files.get(&key(src)).cloned() {
                Some(bytes) => {
                    self.files.insert(key(dst), bytes);
                    CommandOutput::ok("")
                }
                None => CommandOutput::failed(1, &format!("cp: cannot stat '{src}': No such file or directory")),
            },
            ["rm", "-f", path] => {
                self.files.remove(&key(path));
                CommandOutput::ok("")
            }
            ["sha256sum", path] => match self.files.get(&key(path)) {
                Some(bytes) => {
                    let digest = hex::encode(Sha256::digest(bytes));
                    CommandOutput::ok(&format!("{digest}  {path}\n"))
                }
                None => CommandOutput::failed(1, &format!("sha256sum: {path}: No such file or directory")),
            },
            ["stat", "-c", "%s", path] => match self.files.get(&key(path)) {
                Some(bytes) => CommandOutput::ok(&format!("{}\n", bytes.len())),
                None => CommandOutput::failed(1, &format!("stat: cannot statx '{path}': No such file or directory")),
            },
            _ => CommandOutput::ok(""),
        }
    }
}

/// Executor whose remote world is a script.
#[derive(Clone)]
pub struct ScriptedExecutor {
    script: Arc<Mutex<Script>>,
    timeout: Duration,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Reply to any command containing `pattern`, on any host.
    pub fn on(&self, pattern: &str, reply: Reply) -> &Self {
        self.on_sequence(None, pattern, vec![reply])
    }

    /// Reply to commands containing `pattern` on `host` only.
    ///
    /// Host rules win over any-host rules.
    pub fn on_host(&self, host: &str, pattern: &str, reply: Reply) -> &Self {
        self.on_sequence(Some(host), pattern, vec![reply])
    }

    /// Reply with each of `replies` in turn; the last one then repeats.
    pub fn on_sequence(&self, host: Option<&str>, pattern: &str, replies: Vec<Reply>) -> &Self {
        self.script().rules.push(Rule {
            host: host.map(str::to_string),
            pattern: pattern.to_string(),
            replies: replies.into(),
        });
        self
    }

    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut script = self.script();
        if unreachable {
            script.unreachable.insert(host.to_string());
        } else {
            script.unreachable.remove(host);
        }
    }

    /// Make every playbook run against `host` exit non-zero.
    pub fn fail_playbooks_on(&self, host: &str) {
        self.script().failing_playbooks.insert(host.to_string());
    }

    pub fn put_file(&self, host: &str, path: &str, contents: &[u8]) {
        self.script()
            .files
            .insert((host.to_string(), path.to_string()), contents.to_vec());
    }

    pub fn file(&self, host: &str, path: &str) -> Option<Vec<u8>> {
        self.script()
            .files
            .get(&(host.to_string(), path.to_string()))
            .cloned()
    }

    pub fn calls(&self) -> Vec<ExecCall> {
        self.script().calls.clone()
    }

    /// Commands run on `host`, in order.
    pub fn commands_for(&self, host: &str) -> Vec<String> {
        self.script()
            .calls
            .iter()
            .filter(|c| c.host == host)
            .map(|c| c.command.clone())
            .collect()
    }

    /// Whether any command containing `pattern` ran on `host`.
    pub fn ran(&self, host: &str, pattern: &str) -> bool {
        self.commands_for(host).iter().any(|c| c.contains(pattern))
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    fn command_timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute_timeout(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError> {
        let reply = {
            let mut script = self.script();
            script.calls.push(ExecCall {
                host: target.host.clone(),
                command: command.to_string(),
            });
            if script.unreachable.contains(&target.host) {
                Reply::Unreachable
            } else {
                match script.take_reply(&target.host, command) {
                    Some(reply) => reply,
                    None => Reply::Output(script.emulate(&target.host, command)),
                }
            }
        };
        debug!(host = %target.host, %command, "scripted command");

        match reply {
            Reply::Output(out) => Ok(out),
            Reply::Slow(delay, out) => {
                if delay > timeout {
                    tokio::time::sleep(timeout).await;
                    Err(ExecError::Timeout {
                        host: target.host.clone(),
                        after: timeout,
                    })
                } else {
                    tokio::time::sleep(delay).await;
                    Ok(out)
                }
            }
            Reply::Timeout => Err(ExecError::Timeout {
                host: target.host.clone(),
                after: timeout,
            }),
            Reply::Unreachable => Err(ExecError::Unreachable {
                host: target.host.clone(),
                reason: "scripted unreachable".to_string(),
            }),
        }
    }

    async fn check_connectivity(&self, host: &str, _port: u16) -> bool {
        !self.script().unreachable.contains(host)
    }

    async fn run_playbook(
        &self,
        target: &SshTarget,
        playbook: &str,
        _extra_vars: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, ExecError> {
        let mut script = self.script();
        script.calls.push(ExecCall {
            host: target.host.clone(),
            command: format!("playbook {playbook}"),
        });
        if script.unreachable.contains(&target.host) {
            return Err(ExecError::Unreachable {
                host: target.host.clone(),
                reason: "scripted unreachable".to_string(),
            });
        }
        if script.failing_playbooks.contains(&target.host) {
            return Ok(CommandOutput::failed(2, "fatal: task failed"));
        }
        Ok(CommandOutput::ok("ok=1 changed=1 failed=0"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str) -> SshTarget {
        SshTarget::new(host, "root", 22)
    }

    #[tokio::test]
    async fn unscripted_commands_succeed() {
        let exec = ScriptedExecutor::new();
        let out = exec.execute(&target("a"), "uptime").await.unwrap();
        assert!(out.success());
        assert_eq!(exec.commands_for("a"), vec!["uptime".to_string()]);
    }

    #[tokio::test]
    async fn host_rule_beats_any_host_rule() {
        let exec = ScriptedExecutor::new();
        exec.on("systemctl restart", Reply::ok("any"));
        exec.on_host("b", "systemctl restart", Reply::fail(3, "unit failed"));

        let a = exec.execute(&target("a"), "systemctl restart redis").await.unwrap();
        let b = exec.execute(&target("b"), "systemctl restart redis").await.unwrap();
        assert_eq!(a.stdout, "any");
        assert_eq!(b.exit_code, 3);
    }

    #[tokio::test]
    async fn sequence_repeats_last_reply() {
        let exec = ScriptedExecutor::new();
        exec.on_sequence(None, "INFO", vec![Reply::ok("one"), Reply::ok("two")]);

        let t = target("a");
        assert_eq!(exec.execute(&t, "INFO").await.unwrap().stdout, "one");
        assert_eq!(exec.execute(&t, "INFO").await.unwrap().stdout, "two");
        assert_eq!(exec.execute(&t, "INFO").await.unwrap().stdout, "two");
    }

    #[tokio::test]
    async fn unreachable_host_fails_everything() {
        let exec = ScriptedExecutor::new();
        exec.set_unreachable("a", true);
        let err = exec.execute(&target("a"), "true").await.unwrap_err();
        assert!(matches!(err, ExecError::Unreachable { .. }));
        assert!(!exec.check_connectivity("a", 22).await);

        exec.set_unreachable("a", false);
        assert!(exec.check_connectivity("a", 22).await);
    }

    #[tokio::test]
    async fn slow_reply_past_deadline_times_out() {
        let exec = ScriptedExecutor::new();
        exec.on(
            "sleep",
            Reply::Slow(Duration::from_millis(200), CommandOutput::ok("")),
        );
        let err = exec
            .execute_timeout(&target("a"), "sleep 10", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }

    #[tokio::test]
    async fn simulated_filesystem_copy_and_checksum() {
        let exec = ScriptedExecutor::new();
        exec.put_file("a", "/var/lib/redis/dump.rdb", b"REDIS0011");

        let t = target("a");
        exec.execute(&t, "cp /var/lib/redis/dump.rdb /backups/x.rdb")
            .await
            .unwrap();
        assert_eq!(exec.file("a", "/backups/x.rdb").unwrap(), b"REDIS0011");

        let size = exec.execute(&t, "stat -c %s /backups/x.rdb").await.unwrap();
        assert_eq!(size.stdout.trim(), "9");

        let sum = exec.execute(&t, "sha256sum /backups/x.rdb").await.unwrap();
        let expected = hex::encode(Sha256::digest(b"REDIS0011"));
        assert!(sum.stdout.starts_with(&expected));

        let missing = exec.execute(&t, "sha256sum /nope").await.unwrap();
        assert!(!missing.success());
    }

    #[tokio::test]
    async fn playbook_failures_per_host() {
        let exec = ScriptedExecutor::new();
        exec.fail_playbooks_on("b");
        let vars = BTreeMap::new();
        assert!(exec.run_playbook(&target("a"), "p.yml", &vars).await.unwrap().success());
        assert!(!exec.run_playbook(&target("b"), "p.yml", &vars).await.unwrap().success());
        assert!(exec.ran("b", "playbook p.yml"));
    }
}
