//! The strategy interface and lookup.

use std::sync::Arc;

use async_trait::async_trait;

use crate::blue_green::BlueGreenStrategy;
use crate::context::{DeploymentContext, StrategyKind};
use crate::fleet::Fleet;
use crate::maintenance_window::MaintenanceWindowStrategy;
use crate::sequential::SequentialStrategy;

/// A way of rolling a deployment out across its nodes.
///
/// Both methods own the outcome: they record steps, set a terminal status
/// and the first error on the context, and never return failures.
#[async_trait]
pub trait DeploymentStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn execute(&self, ctx: &mut DeploymentContext, fleet: &Fleet);

    async fn rollback(&self, ctx: &mut DeploymentContext, fleet: &Fleet);
}

pub fn strategy_for(kind: StrategyKind) -> Arc<dyn DeploymentStrategy> {
    match kind {
        StrategyKind::Sequential => Arc::new(SequentialStrategy),
        StrategyKind::MaintenanceWindow => Arc::new(MaintenanceWindowStrategy),
        StrategyKind::BlueGreen => Arc::new(BlueGreenStrategy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_matches_kind() {
        for kind in [
            StrategyKind::Sequential,
            StrategyKind::MaintenanceWindow,
            StrategyKind::BlueGreen,
        ] {
            assert_eq!(strategy_for(kind).kind(), kind);
        }
    }
}
