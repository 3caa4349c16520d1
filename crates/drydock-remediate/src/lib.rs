//! drydock-remediate — conservative self-healing actions.
//!
//! The [`Remediator`] restarts services and probes reachability through a
//! [`drydock_exec::CommandExecutor`]. It records what it did but never
//! changes node lifecycle state; that stays with the reconciler and the
//! deployment orchestrator.

pub mod remediator;

pub use remediator::{
    RemediationAction, RemediationAttempt, RemediationError, RemediationOutcome, Remediator,
};
