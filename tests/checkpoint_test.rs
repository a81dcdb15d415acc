use std::fs;
use std::sync::Arc;

use tickchain::{
    Account, CheckpointError, CheckpointStore, EngineConfig, IntegrityError, MemoryContentStore, OperationKind,
    OperationParams, RestoreSource, StateEngine, StoreError, TransactionKind,
};

fn world() -> StateEngine {
    let mut engine = StateEngine::new(EngineConfig::with_seed(2024));
    engine.register_entity("acme", "Acme Corp", 20_000_000).unwrap();
    engine.register_entity("initech", "Initech", 15_000_000).unwrap();
    engine
        .execute_operation("acme", OperationKind::Hire, &OperationParams::new().with("num_employees", 4))
        .unwrap();
    engine
        .execute_operation("initech", OperationKind::Hire, &OperationParams::new().with("num_employees", 2))
        .unwrap();
    engine
}

fn step(engine: &mut StateEngine) {
    engine
        .execute_operation("acme", OperationKind::Produce, &OperationParams::new().with("units", 30))
        .unwrap();
    engine
        .execute_operation("acme", OperationKind::Market, &OperationParams::new())
        .unwrap();
    engine.tick().unwrap();
}

fn run_to(engine: &mut StateEngine, tick: u64) {
    while engine.current_tick() < tick {
        step(engine);
    }
}

#[test]
fn test_create_restore_create_round_trip() {
    let mut engine = world();
    run_to(&mut engine, 3);
    let mut store = CheckpointStore::in_memory();
    let original = engine.checkpoint(&mut store).unwrap();

    let mut restored = store
        .restore(RestoreSource::CheckpointId(original.checkpoint_id.clone()))
        .unwrap();
    assert_eq!(restored.current_tick(), 3);
    let again = restored.checkpoint(&mut store).unwrap();

    assert_eq!(again, original);
    assert_eq!(store.load(&again.checkpoint_id).unwrap(), again);
    assert_eq!(restored.checkpoints().len(), 1);

    // Into a store that never held it, the same capsule is written as is
    let mut other = CheckpointStore::in_memory();
    assert_eq!(restored.checkpoint(&mut other).unwrap(), original);
    assert_eq!(other.load(&original.checkpoint_id).unwrap(), original);
}

#[test]
fn test_checkpoint_after_restore_links_to_restored_capsule() {
    let mut engine = world();
    run_to(&mut engine, 3);
    let mut store = CheckpointStore::in_memory();
    let original = engine.checkpoint(&mut store).unwrap();

    let mut restored = store.restore(RestoreSource::Capsule(original.clone())).unwrap();
    step(&mut restored);
    let next = restored.checkpoint(&mut store).unwrap();

    assert_ne!(next.canonical_hash, original.canonical_hash);
    assert_eq!(next.prev_checkpoint_hash, Some(original.canonical_hash.clone()));
    assert!(store.verify_chain(&[&original.checkpoint_id, &next.checkpoint_id]));
}

#[test]
fn test_resumed_run_matches_uninterrupted_run() {
    let mut store = CheckpointStore::in_memory();

    let mut uninterrupted = world();
    run_to(&mut uninterrupted, 4);
    let midpoint = uninterrupted.checkpoint(&mut store).unwrap();
    run_to(&mut uninterrupted, 9);
    let expected = uninterrupted.checkpoint(&mut store).unwrap();

    // Same state, but the resumed ledgers start at the midpoint: a different capsule
    let mut resumed = store.restore(RestoreSource::Capsule(midpoint.clone())).unwrap();
    run_to(&mut resumed, 9);
    let mut resumed_store = CheckpointStore::in_memory();
    let actual = resumed.checkpoint(&mut resumed_store).unwrap();
    assert!(matches!(resumed.checkpoint(&mut store), Err(CheckpointError::Conflict { .. })));

    assert_eq!(actual.canonical_hash, expected.canonical_hash);
    assert_eq!(actual.prev_checkpoint_hash, Some(midpoint.canonical_hash.clone()));
}

#[test]
fn test_restored_ledgers_open_with_balance() {
    let mut engine = world();
    run_to(&mut engine, 2);
    let mut store = CheckpointStore::in_memory();
    let capsule = engine.checkpoint(&mut store).unwrap();

    let restored = store.restore(RestoreSource::Capsule(capsule.clone())).unwrap();
    let acme = restored.entity("acme").unwrap();
    let genesis = &acme.ledger.records()[0];

    assert_eq!(acme.ledger.len(), 1);
    assert_eq!(genesis.kind, TransactionKind::OpeningBalance);
    assert!(genesis.prev_hash.is_none());
    assert_eq!(acme.ledger.get_balance(Account::Cash), acme.resources.cash_cents);
    let metadata = genesis.metadata.as_ref().unwrap();
    assert_eq!(metadata["checkpoint_hash"], capsule.canonical_hash.as_str());
    assert_eq!(restored.restored_from(), Some(&capsule.canonical_hash));
}

#[test]
fn test_scenario_b_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = CheckpointStore::open(dir.path()).unwrap();
    let mut engine = world();

    run_to(&mut engine, 5);
    let c1 = engine.checkpoint(&mut store).unwrap();
    run_to(&mut engine, 10);
    let c2 = engine.checkpoint(&mut store).unwrap();

    assert_eq!(c1.tick, 5);
    assert_eq!(c2.tick, 10);
    assert_eq!(c2.prev_checkpoint_hash.as_ref(), Some(&c1.canonical_hash));
    assert!(store.verify_chain(&[&c1.checkpoint_id, &c2.checkpoint_id]));
    assert!(dir.path().join(format!("{}.json", c1.checkpoint_id)).exists());

    // Flip the last digit of C1's stored hash in its document
    let path = dir.path().join(format!("{}.json", c1.checkpoint_id));
    let stored = c1.canonical_hash.as_str();
    let last = stored.chars().last().unwrap();
    let flipped = format!("{}{}", &stored[..63], if last == '0' { '1' } else { '0' });
    let text = fs::read_to_string(&path).unwrap();
    fs::write(&path, text.replace(stored, &flipped)).unwrap();

    assert!(!store.verify_chain(&[&c1.checkpoint_id, &c2.checkpoint_id]));
    assert!(matches!(
        store.load(&c1.checkpoint_id),
        Err(CheckpointError::Integrity(IntegrityError::CanonicalHashMismatch { .. }))
    ));
    // C2 on its own is untouched
    assert!(store.verify_chain(&[&c2.checkpoint_id]));
}

#[test]
fn test_reopened_directory_lists_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let ids = {
        let mut store = CheckpointStore::open(dir.path()).unwrap();
        let mut engine = world();
        run_to(&mut engine, 1);
        let a = engine.checkpoint(&mut store).unwrap();
        run_to(&mut engine, 2);
        let b = engine.checkpoint(&mut store).unwrap();
        let mut ids = vec![a.checkpoint_id, b.checkpoint_id];
        ids.sort();
        ids
    };

    let store = CheckpointStore::open(dir.path()).unwrap();
    assert_eq!(store.list().unwrap(), ids);
}

#[test]
fn test_restore_by_content_id() {
    let external = Arc::new(MemoryContentStore::new());
    let mut store = CheckpointStore::in_memory().with_external(external.clone());
    let mut engine = world();
    run_to(&mut engine, 3);
    let capsule = engine.checkpoint(&mut store).unwrap();
    let content_id = capsule.external.clone().unwrap().content_id;

    // A store that never saw the capsule restores it from the external copy
    let fresh = CheckpointStore::in_memory().with_external(external.clone());
    let restored = fresh.restore(RestoreSource::ContentId(content_id.clone())).unwrap();
    assert_eq!(restored.snapshot(), capsule.state_vector);

    // Offline external store falls back to the local copy
    external.set_available(false);
    assert!(store.restore(RestoreSource::ContentId(content_id.clone())).is_ok());
    assert!(matches!(
        fresh.restore(RestoreSource::ContentId(content_id.clone())),
        Err(CheckpointError::Store(StoreError::Unavailable { .. }))
    ));
}

#[test]
fn test_evicted_external_copy_falls_back_to_local() {
    let external = Arc::new(MemoryContentStore::new());
    let mut store = CheckpointStore::in_memory().with_external(external.clone());
    let mut engine = world();
    run_to(&mut engine, 2);
    let capsule = engine.checkpoint(&mut store).unwrap();
    let content_id = capsule.external.clone().unwrap().content_id;

    assert!(external.evict(&content_id).unwrap());

    let restored = store.restore(RestoreSource::ContentId(content_id.clone())).unwrap();
    assert_eq!(restored.snapshot(), capsule.state_vector);

    let fresh = CheckpointStore::in_memory().with_external(external);
    assert!(matches!(
        fresh.restore(RestoreSource::ContentId(content_id)),
        Err(CheckpointError::Store(StoreError::NotFound { .. }))
    ));
}

#[test]
fn test_corrupted_external_copy_is_rejected() {
    let external = Arc::new(MemoryContentStore::new());
    let mut store = CheckpointStore::in_memory().with_external(external.clone());
    let mut engine = world();
    run_to(&mut engine, 1);
    let capsule = engine.checkpoint(&mut store).unwrap();
    let content_id = capsule.external.unwrap().content_id;

    let mut bytes = external_bytes(&external, &content_id);
    bytes[10] ^= 0x01;
    external.corrupt(&content_id, bytes).unwrap();

    let fresh = CheckpointStore::in_memory().with_external(external);
    assert!(matches!(
        fresh.restore(RestoreSource::ContentId(content_id)),
        Err(CheckpointError::Integrity(IntegrityError::ContentIdMismatch { .. }))
    ));
}

fn external_bytes(store: &MemoryContentStore, id: &str) -> Vec<u8> {
    use tickchain::ContentStore;
    store.cat(id).unwrap()
}

#[test]
fn test_failed_restore_leaves_caller_engine_alone() {
    let mut engine = world();
    run_to(&mut engine, 2);
    let store = CheckpointStore::in_memory();
    let before = engine.snapshot();

    assert!(matches!(
        store.restore(RestoreSource::CheckpointId("ckpt_missing".to_string())),
        Err(CheckpointError::NotFound { .. })
    ));
    engine.tick().unwrap();
    assert_eq!(engine.snapshot().tick, before.tick + 1);
}
