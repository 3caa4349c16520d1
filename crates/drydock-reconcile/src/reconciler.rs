//! The reconciliation loop.

use std::sync::Arc;

use drydock_core::clock::epoch_secs;
use drydock_core::config::ReconcilerConfig;
use drydock_core::{FleetError, Node, NodeId, NodeLocks, NodeState};
use drydock_remediate::{RemediationError, Remediator};
use drydock_state::{NodeRepository, StateError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Trigger recorded on every transition the reconciler makes.
const TRIGGER: &str = "reconciler";

pub type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Invoked with `(node_id, old, new)` after every transition.
pub type StateChangeCallback = Arc<dyn Fn(NodeId, NodeState, NodeState) -> BoxFuture + Send + Sync>;

/// Invoked with `(node_id, level, details)` on every degrade or escalation.
pub type AlertCallback = Arc<dyn Fn(NodeId, AlertLevel, serde_json::Value) -> BoxFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    /// Node went DEGRADED.
    Warning,
    /// Node went ERROR and needs an operator.
    Critical,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Remediation(#[from] RemediationError),
}

impl From<ReconcileError> for FleetError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::State(e) => e.into(),
            ReconcileError::Remediation(e) => e.into(),
        }
    }
}

/// What happened in one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Nodes the cycle looked at (everything not skipped).
    pub evaluated: usize,
    pub skipped: usize,
    pub degraded: usize,
    pub escalated: usize,
    pub recovered: usize,
    pub remediated: usize,
    /// Nodes whose evaluation failed or timed out.
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Skipped,
    Unchanged,
    Degraded,
    Escalated,
    Recovered,
    Remediated,
}

impl CycleReport {
    fn record(&mut self, verdict: Verdict) {
        if verdict == Verdict::Skipped {
            self.skipped += 1;
            return;
        }
        self.evaluated += 1;
        match verdict {
            Verdict::Degraded => self.degraded += 1,
            Verdict::Escalated => self.escalated += 1,
            Verdict::Recovered => self.recovered += 1,
            Verdict::Remediated => self.remediated += 1,
            Verdict::Skipped | Verdict::Unchanged => {}
        }
    }
}

pub struct Reconciler {
    repo: Arc<dyn NodeRepository>,
    remediator: Remediator,
    locks: NodeLocks,
    config: ReconcilerConfig,
    on_state_change: Option<StateChangeCallback>,
    on_alert: Option<AlertCallback>,
}

impl Reconciler {
    pub fn new(
        repo: Arc<dyn NodeRepository>,
        remediator: Remediator,
        locks: NodeLocks,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            repo,
            remediator,
            locks,
            config,
            on_state_change: None,
            on_alert: None,
        }
    }

    pub fn with_state_change_callback(mut self, callback: StateChangeCallback) -> Self {
        self.on_state_change = Some(callback);
        self
    }

    pub fn with_alert_callback(mut self, callback: AlertCallback) -> Self {
        self.on_alert = Some(callback);
        self
    }

    pub fn remediator(&self) -> &Remediator {
        &self.remediator
    }

    /// Run cycles until `shutdown` flips or its sender goes away.
    ///
    /// A cycle in progress always finishes; shutdown is only observed
    /// during the sleep between cycles.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval_secs,
            stale_secs = self.config.stale_threshold_secs,
            critical_secs = self.config.critical_threshold_secs,
            retry_limit = self.config.retry_limit,
            "reconciler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.run_cycle().await;

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval()) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("reconciler stopped");
    }

    /// One pass over every node.
    ///
    /// A failure on one node is counted and the pass moves on.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        let nodes = match self.repo.get_all_nodes(None) {
            Ok(nodes) => nodes,
            Err(e) => {
                error!(error = %e, "reconciler could not list nodes");
                report.errors += 1;
                return report;
            }
        };

        for node in nodes {
            let evaluation = tokio::time::timeout(self.config.node_timeout(), self.evaluate(&node.id));
            match evaluation.await {
                Ok(Ok(verdict)) => report.record(verdict),
                Ok(Err(e)) => {
                    warn!(node_id = %node.id, error = %e, "node evaluation failed");
                    report.errors += 1;
                }
                Err(_) => {
                    warn!(node_id = %node.id, timeout = ?self.config.node_timeout(), "node evaluation timed out");
                    report.errors += 1;
                }
            }
        }

        debug!(
            evaluated = report.evaluated,
            skipped = report.skipped,
            degraded = report.degraded,
            escalated = report.escalated,
            recovered = report.recovered,
            remediated = report.remediated,
            errors = report.errors,
            "reconcile cycle finished"
        );
        report
    }

    fn owned_elsewhere(&self, node: &Node) -> bool {
        node.state.is_maintenance()
            || matches!(
                node.state,
                NodeState::Unknown | NodeState::Pending | NodeState::Enrolling
            )
            || self.locks.is_claimed(&node.id)
    }

    async fn evaluate(&self, node_id: &str) -> Result<Verdict, ReconcileError> {
        // Re-read: earlier nodes in this cycle may have awaited for a while.
        let Some(node) = self.repo.get_node(node_id)? else {
            return Ok(Verdict::Skipped);
        };
        if self.owned_elsewhere(&node) {
            return Ok(Verdict::Skipped);
        }

        // No heartbeat at all counts as infinitely old.
        let age = node.heartbeat_age(epoch_secs()).unwrap_or(u64::MAX);
        let stale = age > self.config.stale_threshold_secs;
        let critical = age > self.config.critical_threshold_secs;
        let retries_exhausted = node.consecutive_failures >= self.config.retry_limit;

        let verdict = match node.state {
            NodeState::Online if stale => {
                self.degrade(&node, age).await?;
                Verdict::Degraded
            }
            NodeState::Degraded if critical && retries_exhausted => {
                self.escalate(&node, age).await?;
                Verdict::Escalated
            }
            NodeState::Degraded if stale && !retries_exhausted => {
                self.remediate(&node).await?;
                Verdict::Remediated
            }
            NodeState::Degraded if !stale => {
                self.transition(&node, NodeState::Online, json!({ "heartbeat_age_secs": age }))
                    .await?;
                info!(node_id = %node.id, "node recovered");
                Verdict::Recovered
            }
            _ => Verdict::Unchanged,
        };
        Ok(verdict)
    }

    async fn transition(
        &self,
        node: &Node,
        to: NodeState,
        details: serde_json::Value,
    ) -> Result<(), ReconcileError> {
        let updated = self
            .repo
            .update_node_state(&node.id, to, TRIGGER, Some(details), true)?;
        if let Some(cb) = &self.on_state_change {
            cb(node.id.clone(), node.state, updated.state).await;
        }
        Ok(())
    }

    async fn alert(&self, node: &Node, level: AlertLevel, details: serde_json::Value) {
        if let Some(cb) = &self.on_alert {
            cb(node.id.clone(), level, details).await;
        }
    }

    fn alert_details(node: &Node, age: u64, state: NodeState, requires_human: bool) -> serde_json::Value {
        json!({
            "node_name": node.name,
            "state": state,
            "heartbeat_age_secs": node.last_heartbeat.map(|_| age),
            "failure_count": node.consecutive_failures,
            "requires_human": requires_human,
        })
    }

    async fn degrade(&self, node: &Node, age: u64) -> Result<(), ReconcileError> {
        let details = Self::alert_details(node, age, NodeState::Degraded, false);
        self.transition(node, NodeState::Degraded, details.clone()).await?;
        warn!(node_id = %node.id, heartbeat_age_secs = age, "node degraded: stale heartbeat");
        self.alert(node, AlertLevel::Warning, details).await;
        Ok(())
    }

    async fn escalate(&self, node: &Node, age: u64) -> Result<(), ReconcileError> {
        let details = Self::alert_details(node, age, NodeState::Error, true);
        self.transition(node, NodeState::Error, details.clone()).await?;
        error!(
            node_id = %node.id,
            failures = node.consecutive_failures,
            "node escalated to ERROR, operator action required"
        );
        self.alert(node, AlertLevel::Critical, details).await;
        Ok(())
    }

    /// Restart the role's services, or probe reachability when there are
    /// none.
    ///
    /// The failure counter goes up before anything runs, so an attempt cut
    /// off by the per-node timeout still counts toward the retry limit.
    async fn remediate(&self, node: &Node) -> Result<(), ReconcileError> {
        let failures = self.repo.increment_failure_count(&node.id)?;
        let services = match &node.role {
            Some(role) => self
                .repo
                .get_role_by_name(role)?
                .map(|r| r.services)
                .unwrap_or_default(),
            None => Vec::new(),
        };

        let succeeded = if services.is_empty() {
            self.remediator.check_node_reachable(node).await.succeeded()
        } else {
            let attempts = self.remediator.restart_all_services(node, &services).await?;
            attempts.len() == services.len() && attempts.iter().all(|a| a.succeeded())
        };

        info!(node_id = %node.id, succeeded, failures, "remediation attempted");
        Ok(())
    }
}
