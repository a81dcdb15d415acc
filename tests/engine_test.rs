use std::sync::Arc;

use proptest::prelude::*;
use tickchain::rules::OperationRequest;
use tickchain::{
    Account, CheckpointStore, EngineConfig, EngineError, EngineStatus, Entity, EnvironmentParams, LedgerError,
    OperationKind, OperationParams, OperationPlan, OperationRules, PlannedPosting, PreconditionFailure, RecordKind,
    StandardRules, StateEngine, TransactionKind, Version,
};

/// Standard rules, except that one entity's periodic charge is malformed
#[derive(Debug)]
struct MalformedChargeFor(&'static str);

impl OperationRules for MalformedChargeFor {
    fn version(&self) -> Version {
        StandardRules.version()
    }

    fn evaluate(&self, request: &OperationRequest<'_>) -> Result<OperationPlan, PreconditionFailure> {
        StandardRules.evaluate(request)
    }

    fn periodic_charges(
        &self,
        entity: &Entity,
        environment: &EnvironmentParams,
    ) -> Result<Vec<PlannedPosting>, EngineError> {
        let mut charges = StandardRules.periodic_charges(entity, environment)?;
        if entity.id == self.0 {
            charges.push(PlannedPosting::new(
                -1,
                TransactionKind::Expense,
                Account::OperatingExpenses,
                Account::Cash,
                "malformed",
            ));
        }
        Ok(charges)
    }
}

fn seeded_world(seed: u64) -> StateEngine {
    let mut engine = StateEngine::new(EngineConfig::with_seed(seed));
    engine.register_entity("acme", "Acme Corp", 10_000_000).unwrap();
    engine.register_entity("globex", "Globex", 8_000_000).unwrap();
    engine
}

fn drive(engine: &mut StateEngine, ticks: u64) {
    for t in 0..ticks {
        let units = OperationParams::new().with("units", 10 + (t as i64 % 3) * 5);
        engine
            .execute_operation("acme", OperationKind::Produce, &units)
            .unwrap();
        engine
            .execute_operation("acme", OperationKind::Market, &OperationParams::new())
            .unwrap();
        engine
            .execute_operation("globex", OperationKind::RAndD, &OperationParams::new().with("amount_cents", 20_000))
            .unwrap();
        engine.tick().unwrap();
    }
}

fn staffed(seed: u64) -> StateEngine {
    let mut engine = seeded_world(seed);
    let hire = OperationParams::new().with("num_employees", 3);
    engine.execute_operation("acme", OperationKind::Hire, &hire).unwrap();
    engine.execute_operation("globex", OperationKind::Hire, &hire).unwrap();
    engine
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn property_same_seed_same_checkpoint(seed in any::<u64>(), ticks in 1u64..8) {
        let mut a = staffed(seed);
        let mut b = staffed(seed);
        drive(&mut a, ticks);
        drive(&mut b, ticks);

        let ca = a.checkpoint(&mut CheckpointStore::in_memory()).unwrap();
        let cb = b.checkpoint(&mut CheckpointStore::in_memory()).unwrap();
        prop_assert_eq!(ca.canonical_hash, cb.canonical_hash);
        prop_assert_eq!(ca.merkle_root, cb.merkle_root);
        prop_assert_eq!(a.chain_heads(), b.chain_heads());
    }
}

#[test]
fn test_counters_agree_with_ledgers() {
    let mut engine = staffed(11);
    drive(&mut engine, 5);

    for entity in engine.entities() {
        assert_eq!(entity.resources.cash_cents, entity.ledger.get_balance(Account::Cash));
        assert_eq!(entity.financial.total_revenue_cents, entity.ledger.get_balance(Account::Revenue));
    }
    assert!(engine.verify_all_chains().values().all(|ok| *ok));
}

#[test]
fn test_environment_drifts_within_bounds() {
    let mut engine = seeded_world(3);
    let start = engine.environment().clone();
    for _ in 0..50 {
        engine.tick().unwrap();
        let env = engine.environment();
        assert!((500..=2000).contains(&env.demand_multiplier.value()));
        assert!((0..=1500).contains(&env.interest_rate.value()));
    }
    assert_ne!(engine.environment(), &start);
    assert_eq!(engine.current_tick(), 50);
    assert_eq!(engine.status(), EngineStatus::Running);
}

#[test]
fn test_unknown_entity_is_an_error() {
    let mut engine = seeded_world(1);
    let err = engine
        .execute_operation("nobody", OperationKind::Hire, &OperationParams::new())
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownEntity { .. }));
}

#[test]
fn test_rejection_carries_decision_trace() {
    let mut engine = seeded_world(1);
    let outcome = engine
        .execute_operation("globex", OperationKind::Fire, &OperationParams::new().with("num_employees", 2))
        .unwrap();

    assert!(!outcome.is_applied());
    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["status"], "rejected");
    assert_eq!(engine.entity("globex").unwrap().ledger.len(), 1);
}

#[test]
fn test_timestamps_follow_the_clock() {
    let mut engine = staffed(5);
    drive(&mut engine, 2);

    let duration = engine.clock().tick_duration_secs() as i64;
    for record in engine.entity("acme").unwrap().ledger.records() {
        let offset = record.timestamp - engine.clock().epoch();
        assert_eq!(offset.num_seconds(), record.tick as i64 * duration);
    }
}

#[test]
fn test_failed_tick_changes_nothing() {
    let mut engine = staffed(9).with_rules(Arc::new(MalformedChargeFor("globex")));
    let before = engine.snapshot();
    let heads = engine.chain_heads();
    let heights = engine.ledger_heights();

    let err = engine.tick().unwrap_err();

    assert!(matches!(err, EngineError::Ledger(LedgerError::InvalidPosting { .. })));
    assert_eq!(engine.snapshot(), before);
    assert_eq!(engine.chain_heads(), heads);
    assert_eq!(engine.ledger_heights(), heights);
    assert!(engine.market_history().is_empty());
}

#[test]
fn test_each_tick_chains_a_market_state() {
    let mut engine = staffed(4);
    drive(&mut engine, 3);

    let history = engine.market_history();
    assert_eq!(history.len(), 3);
    assert!(history.verify_chain());
    assert_eq!(history.verification_report().kind, RecordKind::MarketState);

    let head = history.head().unwrap();
    assert_eq!(head.id, "market-000003");
    assert_eq!(head.tick, engine.current_tick());
    assert_eq!(&head.environment, engine.environment());
    assert_eq!(head.rankings, engine.rankings());
    assert_eq!(head.prev_state_hash.as_ref(), Some(&history.records()[1].state_hash));
}
