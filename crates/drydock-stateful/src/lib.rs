//! drydock-stateful — replication, promotion and backups for stateful roles.
//!
//! # Components
//!
//! - **`handler`** — the [`StatefulHandler`] interface a service type implements
//! - **`redis`** — the built-in Redis handler (`redis-cli` over SSH)
//! - **`manager`** — [`StatefulServiceManager`], owner of the replication and
//!   backup tables
//! - **`swap`** — [`ReplicatedSwapStrategy`], a zero-downtime update through
//!   a promoted standby

pub mod context;
pub mod error;
pub mod handler;
pub mod manager;
pub mod redis;
pub mod swap;

pub use context::{BackupContext, BackupState, ReplicationContext, ReplicationState};
pub use error::{StatefulError, StatefulResult};
pub use handler::{BackupArtifact, IntegrityReport, StatefulHandler, SyncStatus};
pub use manager::StatefulServiceManager;
pub use redis::RedisHandler;
pub use swap::{ReplicatedSwapStrategy, SwapOutcome, UpdateCallback, UpdateFuture};
