//! drydock-core — shared types for the drydock fleet control plane.
//!
//! # Components
//!
//! - **`types`** — nodes, roles, and the state-transition audit record
//! - **`state_machine`** — legal node lifecycle transitions (pure, no I/O)
//! - **`error`** — the fleet-wide error taxonomy
//! - **`config`** — `drydock.toml` parsing
//! - **`locks`** — advisory node claims shared by deployments and the reconciler

pub mod clock;
pub mod config;
pub mod error;
pub mod locks;
pub mod state_machine;
pub mod types;

pub use config::DrydockConfig;
pub use error::{FleetError, FleetResult, InvalidTransition, RemoteFailureKind};
pub use locks::NodeLocks;
pub use types::*;
