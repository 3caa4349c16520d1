//! drydock-rollout — multi-node deployment orchestration.
//!
//! The [`Orchestrator`] owns an in-memory table of [`DeploymentContext`]s and
//! runs each one through a [`DeploymentStrategy`]:
//!
//! - **Sequential** — one node at a time: drain, playbook, recover, verify.
//!   A failure rolls back the nodes already finished, newest first.
//! - **Maintenance window** — optionally waits for a start time, drains
//!   every node at once, runs the playbook (serially or in parallel), then
//!   recovers everything.
//! - **Blue-green** — builds a green set from spares (or nodes borrowed
//!   from a donor role), deploys to it, switches the role over, and leaves
//!   the old blue nodes idle.
//!
//! Every step is appended to the context and published through an optional
//! progress callback. Failures inside a strategy end the deployment in a
//! terminal status; they never escape as errors.

pub mod blue_green;
pub mod context;
pub mod error;
pub mod fleet;
pub mod health;
pub mod maintenance_window;
pub mod orchestrator;
pub mod sequential;
pub mod strategy;

#[cfg(test)]
mod testutil;

pub use context::{
    BlueGreenState, DeploymentContext, DeploymentStatus, DeploymentStep, StepType, StrategyKind,
};
pub use error::{RolloutError, RolloutResult};
pub use fleet::{Fleet, ProgressCallback, progress_channel};
pub use orchestrator::Orchestrator;
pub use strategy::DeploymentStrategy;
