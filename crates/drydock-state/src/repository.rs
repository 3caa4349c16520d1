//! The repository interface consumed by the control-plane components.
//!
//! The orchestrator and reconciler only ever reach node state through this
//! trait, and re-read it after every suspension point rather than caching.

use drydock_core::{NewNode, Node, NodeState, Role, StateTransition};

use crate::error::StateResult;

/// Node, role, and transition-log persistence.
pub trait NodeRepository: Send + Sync {
    fn get_node(&self, node_id: &str) -> StateResult<Option<Node>>;

    fn get_node_by_name(&self, name: &str) -> StateResult<Option<Node>>;

    fn get_node_by_address(&self, address: &str) -> StateResult<Option<Node>>;

    /// All nodes, optionally filtered to a single state.
    fn get_all_nodes(&self, state: Option<NodeState>) -> StateResult<Vec<Node>>;

    /// Enroll a node in state UNKNOWN.
    fn create_node(&self, node: NewNode) -> StateResult<Node>;

    /// Insert or overwrite a node record as-is.
    fn put_node(&self, node: &Node) -> StateResult<()>;

    /// Move a node to `new_state` and append a transition record.
    ///
    /// With `validate` set, an illegal move fails with `InvalidTransition`
    /// and nothing is written. Clearing `validate` bypasses the table; the
    /// bypass is logged.
    fn update_node_state(
        &self,
        node_id: &str,
        new_state: NodeState,
        trigger: &str,
        details: Option<serde_json::Value>,
        validate: bool,
    ) -> StateResult<Node>;

    /// Record a health report. Resets the failure counter.
    ///
    /// `heartbeat` defaults to now.
    fn update_node_health(
        &self,
        node_id: &str,
        health: serde_json::Value,
        heartbeat: Option<u64>,
    ) -> StateResult<Node>;

    /// Bump the consecutive-failure counter, returning the new count.
    fn increment_failure_count(&self, node_id: &str) -> StateResult<u32>;

    /// Delete a node in UNKNOWN or ERROR along with its transition log.
    ///
    /// Returns false if the node did not exist.
    fn delete_node(&self, node_id: &str) -> StateResult<bool>;

    fn get_role_by_name(&self, name: &str) -> StateResult<Option<Role>>;

    fn put_role(&self, role: &Role) -> StateResult<()>;

    fn list_roles(&self) -> StateResult<Vec<Role>>;

    /// Assign `role` to the node, or clear the assignment with `None`.
    ///
    /// Clears any borrow marker.
    fn assign_role_to_node(&self, node_id: &str, role: Option<&str>) -> StateResult<Node>;

    /// Mark a node as on loan from `donor_role`, or clear the marker.
    fn set_node_borrowed(&self, node_id: &str, donor_role: Option<&str>) -> StateResult<Node>;

    /// Most recent transitions for a node, newest first.
    fn get_state_transitions(&self, node_id: &str, limit: usize)
    -> StateResult<Vec<StateTransition>>;
}
