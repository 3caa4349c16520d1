//! Advisory per-node locks.
//!
//! Deployments claim the nodes they work on; the reconciler leaves claimed
//! nodes alone so remediation never races a playbook on the same host.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

/// Process-local table of node id -> owner.
#[derive(Debug, Clone, Default)]
pub struct NodeLocks {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl NodeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, String>> {
        // No code path panics while holding the guard, so a poisoned table
        // is still consistent.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Claim `node_id` for `owner`. Returns false if someone else holds it.
    ///
    /// Re-claiming a node already held by the same owner succeeds.
    pub fn try_claim(&self, node_id: &str, owner: &str) -> bool {
        let mut table = self.table();
        match table.get(node_id) {
            Some(current) if current != owner => false,
            _ => {
                table.insert(node_id.to_string(), owner.to_string());
                debug!(%node_id, %owner, "node claimed");
                true
            }
        }
    }

    /// Release `node_id` if `owner` holds it.
    pub fn release(&self, node_id: &str, owner: &str) {
        let mut table = self.table();
        if table.get(node_id).is_some_and(|o| o == owner) {
            table.remove(node_id);
            debug!(%node_id, %owner, "node released");
        }
    }

    /// Release every node held by `owner`.
    pub fn release_all(&self, owner: &str) {
        self.table().retain(|_, o| o != owner);
    }

    pub fn owner(&self, node_id: &str) -> Option<String> {
        self.table().get(node_id).cloned()
    }

    pub fn is_claimed(&self, node_id: &str) -> bool {
        self.table().contains_key(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive() {
        let locks = NodeLocks::new();
        assert!(locks.try_claim("node-1", "deploy-a"));
        assert!(locks.try_claim("node-1", "deploy-a"));
        assert!(!locks.try_claim("node-1", "deploy-b"));
        assert_eq!(locks.owner("node-1").as_deref(), Some("deploy-a"));
    }

    #[test]
    fn release_only_by_owner() {
        let locks = NodeLocks::new();
        locks.try_claim("node-1", "deploy-a");
        locks.release("node-1", "deploy-b");
        assert!(locks.is_claimed("node-1"));
        locks.release("node-1", "deploy-a");
        assert!(!locks.is_claimed("node-1"));
    }

    #[test]
    fn release_all_drops_owner_claims() {
        let locks = NodeLocks::new();
        locks.try_claim("node-1", "deploy-a");
        locks.try_claim("node-2", "deploy-a");
        locks.try_claim("node-3", "deploy-b");
        locks.release_all("deploy-a");
        assert!(!locks.is_claimed("node-1"));
        assert!(!locks.is_claimed("node-2"));
        assert!(locks.is_claimed("node-3"));
    }

    #[test]
    fn clones_share_table() {
        let locks = NodeLocks::new();
        let other = locks.clone();
        locks.try_claim("node-1", "deploy-a");
        assert!(other.is_claimed("node-1"));
    }
}
