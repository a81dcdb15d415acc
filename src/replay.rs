//! Scripted replay of a run, from scratch or from a checkpoint

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::checkpoint::{CheckpointCapsule, CheckpointStore, RestoreSource};
use crate::config::EngineConfig;
use crate::engine::{OperationOutcome, StateEngine};
use crate::error::CoreError;
use crate::rules::{OperationKind, OperationParams, OperationRules, PreconditionFailure, StandardRules};
use crate::types::{ContentHash, EntityId, Tick};

/// One input to a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ReplayStep {
    Register {
        entity_id: EntityId,
        name: String,
        capital_cents: i64,
    },
    Operate {
        entity_id: EntityId,
        operation: OperationKind,
        #[serde(default)]
        params: OperationParams,
    },
    Tick {
        count: u64,
    },
    Checkpoint,
}

/// Ordered list of steps that fully determines a run for a given seed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplayScript {
    steps: Vec<ReplayStep>,
}

impl ReplayScript {
    /// Create a new empty script
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, entity_id: &str, name: &str, capital_cents: i64) -> Self {
        self.steps.push(ReplayStep::Register {
            entity_id: entity_id.to_string(),
            name: name.to_string(),
            capital_cents,
        });
        self
    }

    pub fn operate(mut self, entity_id: &str, operation: OperationKind, params: OperationParams) -> Self {
        self.steps.push(ReplayStep::Operate {
            entity_id: entity_id.to_string(),
            operation,
            params,
        });
        self
    }

    pub fn tick(self) -> Self {
        self.ticks(1)
    }

    pub fn ticks(mut self, count: u64) -> Self {
        self.steps.push(ReplayStep::Tick { count });
        self
    }

    pub fn checkpoint(mut self) -> Self {
        self.steps.push(ReplayStep::Checkpoint);
        self
    }

    pub fn push(&mut self, step: ReplayStep) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[ReplayStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Outcome of a replay
#[derive(Debug, Clone)]
pub struct ReplayResult {
    pub engine: StateEngine,
    /// Capsules created by `Checkpoint` steps of this run, in order
    pub capsules: Vec<CheckpointCapsule>,
    pub rejections: Vec<PreconditionFailure>,
    /// Canonical hash of the final state
    pub final_hash: ContentHash,
    pub duration_ms: u64,
}

impl ReplayResult {
    pub fn final_tick(&self) -> Tick {
        self.engine.current_tick()
    }
}

/// Runs scripts against fresh or restored engines
#[derive(Debug, Clone)]
pub struct ReplayEngine {
    config: EngineConfig,
    rules: Arc<dyn OperationRules>,
}

impl ReplayEngine {
    /// Create a new replay engine
    pub fn new(config: EngineConfig, rules: Arc<dyn OperationRules>) -> Self {
        Self { config, rules }
    }

    /// Create a builder for constructing a replay engine
    pub fn builder() -> ReplayEngineBuilder {
        ReplayEngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run a script from tick zero
    pub fn replay(&self, script: &ReplayScript, store: &mut CheckpointStore) -> Result<ReplayResult, CoreError> {
        let engine = StateEngine::new(self.config.clone()).with_rules(self.rules.clone());
        self.run(engine, script, store)
    }

    /// Restore `capsule` and continue with `script`
    pub fn replay_from(
        &self,
        capsule: &CheckpointCapsule,
        script: &ReplayScript,
        store: &mut CheckpointStore,
    ) -> Result<ReplayResult, CoreError> {
        let engine = store.restore_with_rules(RestoreSource::Capsule(capsule.clone()), self.rules.clone())?;
        self.run(engine, script, store)
    }

    fn run(
        &self,
        mut engine: StateEngine,
        script: &ReplayScript,
        store: &mut CheckpointStore,
    ) -> Result<ReplayResult, CoreError> {
        let started = Instant::now();
        let mut capsules = Vec::new();
        let mut rejections = Vec::new();

        for (index, step) in script.steps().iter().enumerate() {
            debug!(index, tick = engine.current_tick(), "Replaying step");
            match step {
                ReplayStep::Register {
                    entity_id,
                    name,
                    capital_cents,
                } => {
                    engine.register_entity(entity_id.as_str(), name.as_str(), *capital_cents)?;
                }
                ReplayStep::Operate {
                    entity_id,
                    operation,
                    params,
                } => {
                    if let OperationOutcome::Rejected(failure) =
                        engine.execute_operation(entity_id, *operation, params)?
                    {
                        rejections.push(failure);
                    }
                }
                ReplayStep::Tick { count } => {
                    for _ in 0..*count {
                        engine.tick()?;
                    }
                }
                ReplayStep::Checkpoint => {
                    capsules.push(engine.checkpoint(store)?);
                }
            }
        }

        let final_hash = crate::canonical::compute_hash(&engine.snapshot())?;
        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            steps = script.len(),
            tick = engine.current_tick(),
            checkpoints = capsules.len(),
            rejections = rejections.len(),
            duration_ms,
            "Replay finished"
        );
        Ok(ReplayResult {
            engine,
            capsules,
            rejections,
            final_hash,
            duration_ms,
        })
    }
}

/// Builder for constructing replay engines with a fluent API
#[derive(Debug, Default)]
pub struct ReplayEngineBuilder {
    config: Option<EngineConfig>,
    rules: Option<Arc<dyn OperationRules>>,
}

impl ReplayEngineBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config.get_or_insert_with(EngineConfig::default).seed = seed;
        self
    }

    pub fn with_rules(mut self, rules: Arc<dyn OperationRules>) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Build the replay engine; unset parts fall back to defaults
    pub fn build(self) -> ReplayEngine {
        ReplayEngine::new(
            self.config.unwrap_or_default(),
            self.rules.unwrap_or_else(|| Arc::new(StandardRules::new())),
        )
    }
}

/// First point where two capsule sequences disagree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Divergence {
    pub index: usize,
    pub left_tick: Option<Tick>,
    pub right_tick: Option<Tick>,
    pub left_hash: Option<ContentHash>,
    pub right_hash: Option<ContentHash>,
}

/// Compare two runs capsule by capsule on tick and canonical hash
pub fn first_divergence(left: &[CheckpointCapsule], right: &[CheckpointCapsule]) -> Option<Divergence> {
    let longest = left.len().max(right.len());
    (0..longest).find_map(|index| {
        let l = left.get(index);
        let r = right.get(index);
        let same = match (l, r) {
            (Some(a), Some(b)) => a.tick == b.tick && a.canonical_hash == b.canonical_hash,
            _ => false,
        };
        (!same).then(|| Divergence {
            index,
            left_tick: l.map(|c| c.tick),
            right_tick: r.map(|c| c.tick),
            left_hash: l.map(|c| c.canonical_hash.clone()),
            right_hash: r.map(|c| c.canonical_hash.clone()),
        })
    })
}
