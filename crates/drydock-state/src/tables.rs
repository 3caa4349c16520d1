//! redb table definitions for the drydock state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Nodes keyed by `{node_id}`.
pub const NODES: JsonTable = TableDefinition::new("nodes");

/// Roles keyed by `{role_name}`.
pub const ROLES: JsonTable = TableDefinition::new("roles");

/// Append-only transition log keyed by `{node_id}:{timestamp_ms:016}:{seq:08}`.
pub const TRANSITIONS: JsonTable = TableDefinition::new("transitions");
