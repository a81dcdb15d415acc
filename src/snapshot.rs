//! Integer-scaled snapshot of engine state at one tick

use serde::{Deserialize, Serialize};

use crate::context::DeterministicTime;
use crate::entity::{Entity, Financials, Metrics, Resources};
use crate::environment::EnvironmentParams;
use crate::types::{EntityId, Tick, Version};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub name: String,
    pub resources: Resources,
    pub financial: Financials,
    pub metrics: Metrics,
}

impl From<&Entity> for EntitySnapshot {
    fn from(entity: &Entity) -> Self {
        Self {
            id: entity.id.clone(),
            name: entity.name.clone(),
            resources: entity.resources.clone(),
            financial: entity.financial.clone(),
            metrics: entity.metrics.clone(),
        }
    }
}

/// Everything needed to resume a run, and nothing that depends on ledger
/// history: a restored engine snapshots to the same bytes as the original.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub seed: u64,
    pub tick: Tick,
    pub rules_version: Version,
    pub clock: DeterministicTime,
    pub environment: EnvironmentParams,
    /// Sorted by entity id
    pub entities: Vec<EntitySnapshot>,
}

impl StateSnapshot {
    pub fn entity(&self, id: &str) -> Option<&EntitySnapshot> {
        self.entities
            .binary_search_by(|e| e.id.as_str().cmp(id))
            .ok()
            .map(|i| &self.entities[i])
    }
}
