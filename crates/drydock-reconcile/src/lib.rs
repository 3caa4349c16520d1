//! drydock-reconcile — continuous drift detection.
//!
//! Each cycle reads every node, computes heartbeat age, and walks nodes
//! along ONLINE → DEGRADED → ERROR as their heartbeats go stale. DEGRADED
//! nodes get a bounded number of service restarts before escalation, and
//! recover to ONLINE once heartbeats resume. ERROR is never left
//! automatically.
//!
//! # Thresholds
//!
//! ```text
//! age <= stale                 DEGRADED -> ONLINE
//! stale < age <= critical      ONLINE -> DEGRADED, or remediate if DEGRADED
//! age > critical               ONLINE -> DEGRADED, or DEGRADED -> ERROR once
//!                              failures >= retry_limit
//! ```

pub mod reconciler;

pub use reconciler::{
    AlertCallback, AlertLevel, BoxFuture, CycleReport, ReconcileError, Reconciler,
    StateChangeCallback,
};
