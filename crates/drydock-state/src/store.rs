//! StateStore — redb-backed node repository.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing and dry runs).

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use drydock_core::clock::{epoch_millis, epoch_secs};
use drydock_core::state_machine;
use drydock_core::{NewNode, Node, NodeState, Role, StateTransition};
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::repository::NodeRepository;
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    /// Tie-breaker for transitions recorded within the same millisecond.
    seq: Arc<AtomicU64>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_db(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_db(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_db(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(ROLES).map_err(map_err!(Table))?;
        txn.open_table(TRANSITIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON helpers ───────────────────────────────────────

    fn put_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, def: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    /// Read-modify-write a node inside a single write transaction.
    fn modify_node<F>(&self, node_id: &str, f: F) -> StateResult<Node>
    where
        F: FnOnce(&mut Node) -> StateResult<()>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let node = {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            let mut node: Node = {
                let guard = table
                    .get(node_id)
                    .map_err(map_err!(Read))?
                    .ok_or_else(|| StateError::NotFound(format!("node {node_id}")))?;
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
            };
            f(&mut node)?;
            let bytes = serde_json::to_vec(&node).map_err(map_err!(Serialize))?;
            table
                .insert(node_id, bytes.as_slice())
                .map_err(map_err!(Write))?;
            node
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(node)
    }

    fn transition_key(&self, node_id: &str, timestamp_ms: u64) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{node_id}:{timestamp_ms:016}:{seq:08}")
    }
}

impl NodeRepository for StateStore {
    fn get_node(&self, node_id: &str) -> StateResult<Option<Node>> {
        self.get_json(NODES, node_id)
    }

    fn get_node_by_name(&self, name: &str) -> StateResult<Option<Node>> {
        Ok(self
            .list_json::<Node>(NODES)?
            .into_iter()
            .find(|n| n.name == name))
    }

    fn get_node_by_address(&self, address: &str) -> StateResult<Option<Node>> {
        Ok(self
            .list_json::<Node>(NODES)?
            .into_iter()
            .find(|n| n.address == address))
    }

    fn get_all_nodes(&self, state: Option<NodeState>) -> StateResult<Vec<Node>> {
        let nodes = self.list_json::<Node>(NODES)?;
        Ok(match state {
            Some(wanted) => nodes.into_iter().filter(|n| n.state == wanted).collect(),
            None => nodes,
        })
    }

    fn create_node(&self, new: NewNode) -> StateResult<Node> {
        if new.name.trim().is_empty() || new.address.trim().is_empty() {
            return Err(StateError::Validation(
                "node name and address are required".to_string(),
            ));
        }
        if self.get_node_by_name(&new.name)?.is_some() {
            return Err(StateError::Validation(format!(
                "node name already in use: {}",
                new.name
            )));
        }

        let now = epoch_secs();
        let id = uuid::Uuid::new_v4().simple().to_string();
        let node = Node {
            id: format!("node-{}", &id[..12]),
            name: new.name,
            address: new.address,
            ssh_port: new.ssh_port,
            ssh_user: new.ssh_user,
            state: NodeState::Unknown,
            role: None,
            borrowed_from: None,
            capabilities: new.capabilities,
            consecutive_failures: 0,
            last_heartbeat: None,
            last_health_check: None,
            health: None,
            state_changed_at: now,
            created_at: now,
        };
        self.put_node(&node)?;
        info!(node_id = %node.id, name = %node.name, address = %node.address, "node created");
        Ok(node)
    }

    fn put_node(&self, node: &Node) -> StateResult<()> {
        self.put_json(NODES, &node.id, node)
    }

    fn update_node_state(
        &self,
        node_id: &str,
        new_state: NodeState,
        trigger: &str,
        details: Option<serde_json::Value>,
        validate: bool,
    ) -> StateResult<Node> {
        let now_ms = epoch_millis();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let (node, record) = {
            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            let mut node: Node = {
                let guard = nodes
                    .get(node_id)
                    .map_err(map_err!(Read))?
                    .ok_or_else(|| StateError::NotFound(format!("node {node_id}")))?;
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
            };

            let from = node.state;
            let to = if validate {
                state_machine::transition(from, new_state, Some(trigger))?
            } else {
                state_machine::force_transition(from, new_state, trigger)
            };

            node.state = to;
            node.state_changed_at = now_ms / 1000;
            let bytes = serde_json::to_vec(&node).map_err(map_err!(Serialize))?;
            nodes
                .insert(node_id, bytes.as_slice())
                .map_err(map_err!(Write))?;

            let record = StateTransition {
                node_id: node_id.to_string(),
                from,
                to,
                trigger: trigger.to_string(),
                details,
                timestamp_ms: now_ms,
            };
            let key = self.transition_key(node_id, now_ms);
            let bytes = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            let mut log = txn.open_table(TRANSITIONS).map_err(map_err!(Table))?;
            log.insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
            (node, record)
        };
        txn.commit().map_err(map_err!(Transaction))?;
        info!(
            %node_id,
            from = %record.from,
            to = %record.to,
            trigger = %record.trigger,
            "node state changed"
        );
        Ok(node)
    }

    fn update_node_health(
        &self,
        node_id: &str,
        health: serde_json::Value,
        heartbeat: Option<u64>,
    ) -> StateResult<Node> {
        let now = epoch_secs();
        self.modify_node(node_id, |node| {
            node.health = Some(health);
            node.last_health_check = Some(now);
            node.last_heartbeat = Some(heartbeat.unwrap_or(now));
            node.consecutive_failures = 0;
            Ok(())
        })
    }

    fn increment_failure_count(&self, node_id: &str) -> StateResult<u32> {
        let node = self.modify_node(node_id, |node| {
            node.consecutive_failures = node.consecutive_failures.saturating_add(1);
            Ok(())
        })?;
        debug!(%node_id, failures = node.consecutive_failures, "failure count incremented");
        Ok(node.consecutive_failures)
    }

    fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        let Some(node) = self.get_node(node_id)? else {
            return Ok(false);
        };
        if !matches!(node.state, NodeState::Unknown | NodeState::Error) {
            return Err(StateError::Validation(format!(
                "node {node_id} is {}; only UNKNOWN or ERROR nodes can be deleted",
                node.state
            )));
        }

        let prefix = format!("{node_id}:");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            nodes.remove(node_id).map_err(map_err!(Write))?;

            let mut log = txn.open_table(TRANSITIONS).map_err(map_err!(Table))?;
            let keys: Vec<String> = log
                .range(prefix.as_str()..)
                .map_err(map_err!(Read))?
                .map_while(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect();
            for key in &keys {
                log.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(%node_id, "node deleted");
        Ok(true)
    }

    fn get_role_by_name(&self, name: &str) -> StateResult<Option<Role>> {
        self.get_json(ROLES, name)
    }

    fn put_role(&self, role: &Role) -> StateResult<()> {
        if role.name.trim().is_empty() {
            return Err(StateError::Validation("role name is required".to_string()));
        }
        self.put_json(ROLES, &role.name, role)?;
        debug!(role = %role.name, "role stored");
        Ok(())
    }

    fn list_roles(&self) -> StateResult<Vec<Role>> {
        self.list_json(ROLES)
    }

    fn assign_role_to_node(&self, node_id: &str, role: Option<&str>) -> StateResult<Node> {
        if let Some(name) = role
            && self.get_role_by_name(name)?.is_none()
        {
            return Err(StateError::NotFound(format!("role {name}")));
        }
        let node = self.modify_node(node_id, |node| {
            node.role = role.map(str::to_string);
            node.borrowed_from = None;
            Ok(())
        })?;
        info!(%node_id, role = ?node.role, "role assignment updated");
        Ok(node)
    }

    fn set_node_borrowed(&self, node_id: &str, donor_role: Option<&str>) -> StateResult<Node> {
        self.modify_node(node_id, |node| {
            node.borrowed_from = donor_role.map(str::to_string);
            Ok(())
        })
    }

    fn get_state_transitions(
        &self,
        node_id: &str,
        limit: usize,
    ) -> StateResult<Vec<StateTransition>> {
        let prefix = format!("{node_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TRANSITIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            let record: StateTransition =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        results.reverse();
        results.truncate(limit);
        Ok(results)
    }
}
