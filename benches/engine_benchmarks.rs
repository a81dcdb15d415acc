//! Benchmarks for the tick engine, checkpoints and verification
//!
//! These benchmarks measure:
//! - Tick throughput across entity counts
//! - Checkpoint creation
//! - Full verification of a recorded run
//! - Scripted replay

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use tickchain::{
    ChainVerifier, CheckpointStore, EngineConfig, OperationKind, OperationParams, ReplayEngine, ReplayScript,
    StateEngine,
};

fn create_engine(entities: usize) -> StateEngine {
    let mut engine = StateEngine::new(EngineConfig::with_seed(1));
    for i in 0..entities {
        let id = format!("entity-{:04}", i);
        if engine.register_entity(id.as_str(), id.as_str(), 50_000_000).is_err() {
            continue;
        }
        let _ = engine.execute_operation(&id, OperationKind::Hire, &OperationParams::new().with("num_employees", 2));
    }
    engine
}

fn bench_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick");

    for entities in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*entities as u64));
        group.bench_with_input(BenchmarkId::from_parameter(entities), entities, |b, &entities| {
            let mut engine = create_engine(entities);
            b.iter(|| black_box(engine.tick()));
        });
    }

    group.finish();
}

fn bench_checkpoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint_create");

    for entities in [10, 100].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(entities), entities, |b, &entities| {
            let mut engine = create_engine(entities);
            let _ = engine.tick();
            let mut store = CheckpointStore::in_memory();
            b.iter(|| black_box(store.create(&engine, None)));
        });
    }

    group.finish();
}

fn bench_verification(c: &mut Criterion) {
    let mut group = c.benchmark_group("verification");

    for entities in [10, 100].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(entities), entities, |b, &entities| {
            let mut engine = create_engine(entities);
            let mut store = CheckpointStore::in_memory();
            for _ in 0..10 {
                let _ = engine.tick();
                let _ = engine.checkpoint(&mut store);
            }
            let verifier = ChainVerifier::new();
            b.iter(|| black_box(verifier.verify_engine(&engine)));
        });
    }

    group.finish();
}

fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay");

    let mut script = ReplayScript::new().register("acme", "Acme", 100_000_000).operate(
        "acme",
        OperationKind::Hire,
        OperationParams::new().with("num_employees", 5),
    );
    for _ in 0..50 {
        script = script
            .operate("acme", OperationKind::Produce, OperationParams::new().with("units", 40))
            .operate("acme", OperationKind::Market, OperationParams::new())
            .tick();
    }
    let script = script.checkpoint();
    let engine = ReplayEngine::builder().build();

    group.bench_function("fifty_ticks", |b| {
        b.iter(|| black_box(engine.replay(&script, &mut CheckpointStore::in_memory())));
    });

    group.finish();
}

criterion_group!(benches, bench_tick, bench_checkpoint, bench_verification, bench_replay);
criterion_main!(benches);
