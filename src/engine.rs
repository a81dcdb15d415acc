//! Discrete-tick state engine

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::canonical::{compute_hash, CanonicalEncoder};
use crate::checkpoint::{CheckpointCapsule, CheckpointStore};
use crate::config::EngineConfig;
use crate::context::{DeterministicTime, SeededRandom};
use crate::entity::Entity;
use crate::environment::EnvironmentParams;
use crate::error::{CheckpointError, EngineError};
use crate::ledger::{Posting, TransactionLedger};
use crate::market::{rank, MarketHistory, Ranking, Standing};
use crate::rules::{
    OperationKind, OperationParams, OperationPlan, OperationRequest, OperationRules, PlannedPosting,
    PreconditionFailure, StandardRules,
};
use crate::snapshot::{EntitySnapshot, StateSnapshot};
use crate::types::{Account, ContentHash, EntityId, Tick, TransactionKind, Version};

/// Lifecycle of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Initialized,
    Running,
    Terminated,
}

/// Result of an applied operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationReceipt {
    pub entity_id: EntityId,
    pub tick: Tick,
    pub operation: OperationKind,
    pub plan: OperationPlan,
    pub record_ids: Vec<String>,
}

/// Outcome of [`StateEngine::execute_operation`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationOutcome {
    Applied(OperationReceipt),
    Rejected(PreconditionFailure),
}

impl OperationOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, OperationOutcome::Applied(_))
    }
}

/// Single coordinator over the world: entities, their ledgers and the shared
/// environment. Every mutation goes through `&mut self`.
#[derive(Debug, Clone)]
pub struct StateEngine {
    seed: u64,
    tick: Tick,
    status: EngineStatus,
    clock: DeterministicTime,
    environment: EnvironmentParams,
    entities: BTreeMap<EntityId, Entity>,
    rules: Arc<dyn OperationRules>,
    market: MarketHistory,
    checkpoints: Vec<CheckpointCapsule>,
    restored_from: Option<ContentHash>,
}

impl StateEngine {
    /// Create a new engine with the standard rules
    pub fn new(config: EngineConfig) -> Self {
        info!(seed = config.seed, "Engine initialized");
        Self {
            seed: config.seed,
            tick: 0,
            status: EngineStatus::Initialized,
            clock: DeterministicTime::new(config.epoch, config.tick_duration_secs),
            environment: config.environment,
            entities: BTreeMap::new(),
            rules: Arc::new(StandardRules::new()),
            market: MarketHistory::new(),
            checkpoints: Vec::new(),
            restored_from: None,
        }
    }

    /// Replace the operation rules
    pub fn with_rules(mut self, rules: Arc<dyn OperationRules>) -> Self {
        self.rules = rules;
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn current_tick(&self) -> Tick {
        self.tick
    }

    pub fn status(&self) -> EngineStatus {
        self.status
    }

    pub fn clock(&self) -> &DeterministicTime {
        &self.clock
    }

    pub fn environment(&self) -> &EnvironmentParams {
        &self.environment
    }

    pub fn rules(&self) -> &Arc<dyn OperationRules> {
        &self.rules
    }

    pub fn rules_version(&self) -> Version {
        self.rules.version()
    }

    pub fn entity(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    /// Entities in id order
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Market state recorded after each tick this engine ran
    pub fn market_history(&self) -> &MarketHistory {
        &self.market
    }

    /// Capsules produced by (or restored into) this engine, oldest first
    pub fn checkpoints(&self) -> &[CheckpointCapsule] {
        &self.checkpoints
    }

    /// Canonical hash of the capsule this engine was restored from
    pub fn restored_from(&self) -> Option<&ContentHash> {
        self.restored_from.as_ref()
    }

    fn ensure_live(&self) -> Result<(), EngineError> {
        if self.status == EngineStatus::Terminated {
            return Err(EngineError::Terminated);
        }
        Ok(())
    }

    fn now(&self) -> Result<chrono::DateTime<chrono::Utc>, EngineError> {
        self.clock.at(self.tick).ok_or(EngineError::ClockOverflow { tick: self.tick })
    }

    /// Register an entity and record its founding capital as the ledger genesis
    pub fn register_entity(
        &mut self,
        id: impl Into<EntityId>,
        name: impl Into<String>,
        founding_capital_cents: i64,
    ) -> Result<&Entity, EngineError> {
        self.ensure_live()?;
        let id = id.into();
        if self.entities.contains_key(&id) {
            return Err(EngineError::DuplicateEntity { entity_id: id });
        }

        let mut entity = Entity::new(id.clone(), name);
        let genesis = Posting::new(
            entity.record_id(0),
            self.tick,
            founding_capital_cents,
            TransactionKind::Investment,
            Account::Cash,
            Account::Equity,
        )
        .at(self.now()?)
        .with_note("description", "Initial capital investment (genesis)");
        entity.ledger.record(genesis)?;
        entity.resources.cash_cents = founding_capital_cents;

        info!(entity = %id, capital = founding_capital_cents, "Entity registered");
        Ok(self.entities.entry(id).or_insert(entity))
    }

    /// Evaluate and, if its preconditions hold, apply one operation.
    ///
    /// A failed precondition is a normal outcome, not an error; errors mean the
    /// engine could not act at all. Either way nothing changes unless the
    /// outcome is [`OperationOutcome::Applied`].
    pub fn execute_operation(
        &mut self,
        entity_id: &str,
        kind: OperationKind,
        params: &OperationParams,
    ) -> Result<OperationOutcome, EngineError> {
        self.ensure_live()?;
        let timestamp = self.now()?;
        let tick = self.tick;
        let entity = self
            .entities
            .get_mut(entity_id)
            .ok_or_else(|| EngineError::UnknownEntity {
                entity_id: entity_id.to_string(),
            })?;

        let request = OperationRequest {
            tick,
            kind,
            params,
            entity,
            environment: &self.environment,
        };
        let plan = match self.rules.evaluate(&request) {
            Ok(plan) => plan,
            Err(failure) => {
                debug!(entity = entity_id, operation = %kind, condition = %failure.condition, "Operation rejected");
                return Ok(OperationOutcome::Rejected(failure));
            }
        };

        let postings = to_postings(entity, &plan.postings, tick, timestamp, Some(kind));
        let record_ids = postings.iter().map(|p| p.id.clone()).collect();
        let staged = entity.stage(&plan.delta, &postings)?;
        entity.ledger.record_batch(postings)?;
        entity.commit(staged);
        self.status = EngineStatus::Running;

        debug!(entity = entity_id, operation = %kind, tick, "Operation applied");
        Ok(OperationOutcome::Applied(OperationReceipt {
            entity_id: entity_id.to_string(),
            tick,
            operation: kind,
            plan,
            record_ids,
        }))
    }

    /// Advance the world by one tick.
    ///
    /// The environment drifts with randomness derived from `(seed, tick)`,
    /// periodic charges are recorded at the current tick, derived fields are
    /// refreshed, the resulting market state is chained onto the history and
    /// the counter moves on.
    ///
    /// Every entity's postings are sealed and checked before anything is
    /// written, so a failing tick leaves the engine exactly as it was.
    pub fn tick(&mut self) -> Result<Tick, EngineError> {
        self.ensure_live()?;
        let tick = self.tick;
        let next = tick.checked_add(1).ok_or(EngineError::ClockOverflow { tick })?;
        let timestamp = self.now()?;

        let mut rng = SeededRandom::for_tick(self.seed, tick)?;
        let mut environment = self.environment.clone();
        environment.perturb(&mut rng);

        let mut staged = Vec::with_capacity(self.entities.len());
        for entity in self.entities.values() {
            let charges = self.rules.periodic_charges(entity, &environment)?;
            let postings = to_postings(entity, &charges, tick, timestamp, None);
            let update = entity.stage_new_tick(&postings)?;
            let batch = entity.ledger.prepare_batch(postings)?;
            staged.push((entity, batch, update));
        }

        let rankings = rank(staged.iter().map(|(entity, _, update)| Standing {
            entity_id: &entity.id,
            name: &entity.name,
            total_revenue_cents: update.financial.total_revenue_cents,
            market_share_bp: update.metrics.market_share_bp,
            employees: update.resources.employees,
        }));
        let state = self.market.prepare(next, environment.clone(), rankings)?;
        let staged: Vec<_> = staged
            .into_iter()
            .map(|(entity, batch, update)| (entity.id.clone(), batch, update))
            .collect();

        // Nothing below can fail
        self.environment = environment;
        for (id, batch, update) in staged {
            if let Some(entity) = self.entities.get_mut(&id) {
                entity.ledger.commit_sealed(batch);
                entity.commit(update);
                entity.refresh_derived();
            }
        }
        self.market.commit_prepared(state);

        self.tick = next;
        self.status = EngineStatus::Running;
        debug!(
            tick = self.tick,
            demand = %self.environment.demand_multiplier,
            rate = %self.environment.interest_rate,
            "Tick advanced"
        );
        Ok(self.tick)
    }

    /// Stop accepting ticks and operations
    pub fn terminate(&mut self) {
        if self.status != EngineStatus::Terminated {
            info!(tick = self.tick, "Engine terminated");
            self.status = EngineStatus::Terminated;
        }
    }

    /// Integer-scaled state of the world at the current tick
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            seed: self.seed,
            tick: self.tick,
            rules_version: self.rules.version(),
            clock: self.clock,
            environment: self.environment.clone(),
            entities: self.entities.values().map(EntitySnapshot::from).collect(),
        }
    }

    /// Create a checkpoint chained to the previous one and remember it.
    ///
    /// If the state is unchanged since the latest capsule, that capsule is
    /// saved to `store` and returned as is; a capsule never links to itself.
    pub fn checkpoint(&mut self, store: &mut CheckpointStore) -> Result<CheckpointCapsule, CheckpointError> {
        if let Some(head) = self.checkpoints.last() {
            if head.canonical_hash == compute_hash(&self.snapshot())? {
                store.save(head)?;
                debug!(checkpoint = %head.checkpoint_id, tick = self.tick, "State unchanged since last checkpoint");
                return Ok(head.clone());
            }
        }
        let prev = self.checkpoints.last().map(|c| c.canonical_hash.clone());
        let capsule = store.create(self, prev)?;
        self.checkpoints.push(capsule.clone());
        Ok(capsule)
    }

    /// Current chain head of every ledger
    pub fn chain_heads(&self) -> BTreeMap<EntityId, ContentHash> {
        self.entities
            .values()
            .filter_map(|e| e.ledger.chain_head_hash().map(|h| (e.id.clone(), h.clone())))
            .collect()
    }

    /// Number of records in every ledger
    pub fn ledger_heights(&self) -> BTreeMap<EntityId, usize> {
        self.entities.values().map(|e| (e.id.clone(), e.ledger.len())).collect()
    }

    /// Merkle root over the current ledger heads
    pub fn merkle_root(&self) -> ContentHash {
        let heads = self.chain_heads();
        CanonicalEncoder::new().merkle_root(heads.values())
    }

    /// Query-mode verification of every ledger
    pub fn verify_all_chains(&self) -> BTreeMap<EntityId, bool> {
        self.entities
            .values()
            .map(|e| (e.id.clone(), e.ledger.verify_chain()))
            .collect()
    }

    /// Entities ranked by total revenue, ties broken by id
    pub fn rankings(&self) -> Vec<Ranking> {
        rank(self.entities.values().map(|e| Standing {
            entity_id: &e.id,
            name: &e.name,
            total_revenue_cents: e.financial.total_revenue_cents,
            market_share_bp: e.metrics.market_share_bp,
            employees: e.resources.employees,
        }))
    }

    /// Swap in a ledger loaded from elsewhere, such as a journal, and return the old one.
    ///
    /// The ledger is not verified here; run the verifier before trusting it.
    pub fn replace_ledger(&mut self, ledger: TransactionLedger) -> Result<TransactionLedger, EngineError> {
        let entity = self
            .entities
            .get_mut(ledger.entity_id())
            .ok_or_else(|| EngineError::UnknownEntity {
                entity_id: ledger.entity_id().to_string(),
            })?;
        debug!(entity = %entity.id, records = ledger.len(), "Ledger replaced");
        Ok(std::mem::replace(&mut entity.ledger, ledger))
    }

    /// Swap in a market history loaded from elsewhere and return the old one. Not verified here.
    pub fn replace_market_history(&mut self, history: MarketHistory) -> MarketHistory {
        debug!(states = history.len(), "Market history replaced");
        std::mem::replace(&mut self.market, history)
    }

    /// Rebuild an engine from a verified capsule.
    ///
    /// Capsules carry state, not history: each ledger is reopened with an
    /// `OPENING_BALANCE` genesis record that carries the entity's cash and
    /// names the capsule it came from.
    pub(crate) fn resume(
        capsule: &CheckpointCapsule,
        rules: Arc<dyn OperationRules>,
    ) -> Result<Self, EngineError> {
        let snapshot = &capsule.state_vector;
        let mut entities = BTreeMap::new();
        let timestamp = snapshot
            .clock
            .at(snapshot.tick)
            .ok_or(EngineError::ClockOverflow { tick: snapshot.tick })?;

        for saved in &snapshot.entities {
            let mut entity = Entity::new(saved.id.clone(), saved.name.clone());
            entity.resources = saved.resources.clone();
            entity.financial = saved.financial.clone();
            entity.metrics = saved.metrics.clone();

            let cash = entity.resources.cash_cents;
            let (debit, credit) = if cash >= 0 {
                (Account::Cash, Account::Equity)
            } else {
                (Account::Equity, Account::Cash)
            };
            let opening = Posting::new(
                entity.record_id(0),
                snapshot.tick,
                opening_amount(&entity.id, cash)?,
                TransactionKind::OpeningBalance,
                debit,
                credit,
            )
            .at(timestamp)
            .with_note("checkpoint_id", capsule.checkpoint_id.as_str())
            .with_note("checkpoint_hash", capsule.canonical_hash.as_str());
            entity.ledger.record(opening)?;
            entities.insert(entity.id.clone(), entity);
        }

        info!(
            checkpoint = %capsule.checkpoint_id,
            tick = snapshot.tick,
            entities = entities.len(),
            "Engine restored from checkpoint"
        );
        Ok(Self {
            seed: snapshot.seed,
            tick: snapshot.tick,
            status: if snapshot.tick > 0 {
                EngineStatus::Running
            } else {
                EngineStatus::Initialized
            },
            clock: snapshot.clock,
            environment: snapshot.environment.clone(),
            entities,
            rules,
            market: MarketHistory::new(),
            checkpoints: vec![capsule.clone()],
            restored_from: Some(capsule.canonical_hash.clone()),
        })
    }
}

fn opening_amount(entity_id: &str, cash: i64) -> Result<i64, EngineError> {
    cash.checked_abs().ok_or_else(|| EngineError::Overflow {
        entity_id: entity_id.to_string(),
        field: "cash_cents".to_string(),
    })
}

fn to_postings(
    entity: &Entity,
    planned: &[PlannedPosting],
    tick: Tick,
    timestamp: chrono::DateTime<chrono::Utc>,
    operation: Option<OperationKind>,
) -> Vec<Posting> {
    planned
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let posting = Posting::new(entity.record_id(i), tick, p.amount, p.kind, p.debit, p.credit)
                .at(timestamp)
                .with_note("description", p.description.as_str());
            match operation {
                Some(kind) => posting.with_note("operation", kind.to_string()),
                None => posting,
            }
        })
        .collect()
}
