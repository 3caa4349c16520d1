//! drydock-state — node repository for the drydock control plane.
//!
//! The control-plane components consume the [`NodeRepository`] trait;
//! [`StateStore`] implements it on top of [redb](https://docs.rs/redb).
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Transition records use `{node_id}:{timestamp_ms}:{seq}` keys so a prefix
//! range scan returns one node's history in order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod repository;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use repository::NodeRepository;
pub use store::StateStore;
