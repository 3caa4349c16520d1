//! Node lifecycle state machine.
//!
//! Pure validation of node-state transitions. No I/O: callers persist the
//! result through the repository.
//!
//! ```text
//! UNKNOWN ─► PENDING ─► ENROLLING ─► ONLINE ◄──────────────┐
//!               ▲            │        │  ▲                 │
//!               │            ▼        ▼  │                 │
//!               └──────── ERROR ◄── DEGRADED               │
//!                                     │                    │
//!        ONLINE/DEGRADED ─► MAINTENANCE_{DRAINING,PLANNED,IMMEDIATE}
//!                                     │                    │
//!                                     ▼                    │
//!                           MAINTENANCE_OFFLINE            │
//!                                     │                    │
//!                                     ▼                    │
//!                           MAINTENANCE_RECOVERING ────────┘ (or ERROR)
//! ```

use tracing::warn;

use crate::error::InvalidTransition;
use crate::types::NodeState;

use NodeState::*;

/// States reachable from `from` in one step.
pub fn valid_targets(from: NodeState) -> &'static [NodeState] {
    match from {
        Unknown => &[Pending],
        Pending => &[Enrolling, Unknown],
        Enrolling => &[Online, Error],
        Online => &[
            Degraded,
            MaintenanceDraining,
            MaintenancePlanned,
            MaintenanceImmediate,
        ],
        Degraded => &[Online, Error, MaintenanceDraining, MaintenanceImmediate],
        Error => &[Pending, Online],
        MaintenanceDraining => &[MaintenanceOffline],
        MaintenancePlanned => &[MaintenanceOffline],
        MaintenanceImmediate => &[MaintenanceOffline],
        MaintenanceOffline => &[MaintenanceRecovering],
        MaintenanceRecovering => &[Online, Error],
    }
}

pub fn can_transition(from: NodeState, to: NodeState) -> bool {
    valid_targets(from).contains(&to)
}

/// Validate `from -> to`, returning `to` on success.
pub fn transition(
    from: NodeState,
    to: NodeState,
    reason: Option<&str>,
) -> Result<NodeState, InvalidTransition> {
    if can_transition(from, to) {
        Ok(to)
    } else {
        Err(InvalidTransition {
            from,
            to,
            reason: reason.map(str::to_string),
        })
    }
}

/// Accept `from -> to` without consulting the table.
///
/// Used for internal deployment phases that step outside the adjacency
/// map. The bypass is always logged.
pub fn force_transition(from: NodeState, to: NodeState, trigger: &str) -> NodeState {
    if !can_transition(from, to) {
        warn!(%from, %to, %trigger, "state machine validation bypassed");
    }
    to
}

pub fn is_maintenance(state: NodeState) -> bool {
    state.is_maintenance()
}

/// ERROR is the only state that needs an operator to leave.
pub fn requires_operator(state: NodeState) -> bool {
    state == Error
}

/// Short human description of a transition.
pub fn describe(from: NodeState, to: NodeState) -> String {
    let verb = match (from, to) {
        (_, Degraded) => "degraded",
        (_, Error) => "failed",
        (Degraded | MaintenanceRecovering | Error, Online) => "recovered",
        (Enrolling, Online) => "enrolled",
        (_, MaintenanceDraining) => "draining",
        (_, MaintenanceOffline) => "taken offline",
        (_, MaintenanceRecovering) => "recovering",
        (_, Pending) => "queued for enrollment",
        _ => "moved",
    };
    format!("{from} -> {to}: {verb}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &[(NodeState, NodeState)] = &[
        (Unknown, Pending),
        (Pending, Enrolling),
        (Pending, Unknown),
        (Enrolling, Online),
        (Enrolling, Error),
        (Online, Degraded),
        (Online, MaintenanceDraining),
        (Online, MaintenancePlanned),
        (Online, MaintenanceImmediate),
        (Degraded, Online),
        (Degraded, Error),
        (Degraded, MaintenanceDraining),
        (Degraded, MaintenanceImmediate),
        (Error, Pending),
        (Error, Online),
        (MaintenanceDraining, MaintenanceOffline),
        (MaintenancePlanned, MaintenanceOffline),
        (MaintenanceImmediate, MaintenanceOffline),
        (MaintenanceOffline, MaintenanceRecovering),
        (MaintenanceRecovering, Online),
        (MaintenanceRecovering, Error),
    ];

    #[test]
    fn every_pair_matches_table() {
        for from in NodeState::ALL {
            for to in NodeState::ALL {
                let listed = TABLE.contains(&(from, to));
                let result = transition(from, to, None);
                if listed {
                    assert_eq!(result, Ok(to), "{from} -> {to} should be legal");
                } else {
                    let err = result.expect_err("unlisted pair must fail");
                    assert_eq!((err.from, err.to), (from, to));
                }
            }
        }
    }

    #[test]
    fn self_transitions_are_illegal() {
        for state in NodeState::ALL {
            assert!(!can_transition(state, state));
        }
    }

    #[test]
    fn reason_carried_on_error() {
        let err = transition(Unknown, Online, Some("manual")).unwrap_err();
        assert_eq!(err.reason.as_deref(), Some("manual"));
    }

    #[test]
    fn error_only_leaves_via_pending_or_online() {
        assert_eq!(valid_targets(Error), &[Pending, Online]);
        assert!(requires_operator(Error));
        assert!(!requires_operator(Degraded));
    }

    #[test]
    fn maintenance_states() {
        let maintenance: Vec<_> = NodeState::ALL
            .into_iter()
            .filter(|s| is_maintenance(*s))
            .collect();
        assert_eq!(maintenance.len(), 5);
        assert!(!is_maintenance(Online));
    }

    #[test]
    fn force_transition_returns_target() {
        assert_eq!(force_transition(Unknown, Online, "test"), Online);
    }

    #[test]
    fn describe_reads_naturally() {
        assert_eq!(describe(Online, Degraded), "ONLINE -> DEGRADED: degraded");
        assert_eq!(describe(Degraded, Online), "DEGRADED -> ONLINE: recovered");
    }
}
