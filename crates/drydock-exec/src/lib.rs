//! drydock-exec — remote command execution for drydock.
//!
//! # Components
//!
//! - **`executor`** — the [`CommandExecutor`] trait and its value types
//! - **`ssh`** — [`SshExecutor`], the OpenSSH + playbook-runner implementation
//! - **`scripted`** — [`ScriptedExecutor`], an in-memory implementation for
//!   dry runs and tests

pub mod error;
pub mod executor;
pub mod scripted;
pub mod ssh;

pub use error::ExecError;
pub use executor::{CommandExecutor, CommandOutput, SshTarget, shell_quote};
pub use scripted::{ExecCall, Reply, ScriptedExecutor};
pub use ssh::SshExecutor;
