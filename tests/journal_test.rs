use std::fs;
use std::io::Write;

use tickchain::{
    Account, EngineConfig, JournalError, LedgerJournal, OperationKind, OperationParams, Posting, StateEngine,
    TransactionKind, TransactionLedger,
};

fn ledger(len: usize) -> TransactionLedger {
    let mut ledger = TransactionLedger::new("acme");
    ledger
        .record(Posting::new("acme-000000", 0, 50_000, TransactionKind::Investment, Account::Cash, Account::Equity))
        .unwrap();
    for i in 1..len {
        ledger
            .record(
                Posting::new(
                    format!("acme-{:06}", i),
                    i as u64,
                    100 * i as i64,
                    TransactionKind::Expense,
                    Account::OperatingExpenses,
                    Account::Cash,
                )
                .with_note("description", "rent"),
            )
            .unwrap();
    }
    ledger
}

#[test]
fn test_incremental_sync_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let journal = LedgerJournal::open(dir.path()).unwrap();

    assert_eq!(journal.sync(&ledger(3)).unwrap(), 3);
    assert_eq!(journal.sync(&ledger(3)).unwrap(), 0);
    assert_eq!(journal.sync(&ledger(5)).unwrap(), 2);

    let text = fs::read_to_string(dir.path().join("acme.ndjson")).unwrap();
    assert_eq!(text.lines().count(), 5);

    let reloaded = journal.load("acme").unwrap();
    assert_eq!(reloaded.chain_head_hash(), ledger(5).chain_head_hash());
    assert_eq!(reloaded.get_balance(Account::Cash), ledger(5).get_balance(Account::Cash));
}

#[test]
fn test_diverged_history_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let journal = LedgerJournal::open(dir.path()).unwrap();
    journal.sync(&ledger(4)).unwrap();

    let mut other = TransactionLedger::new("acme");
    other
        .record(Posting::new("acme-000000", 0, 1, TransactionKind::Investment, Account::Cash, Account::Equity))
        .unwrap();
    assert!(matches!(journal.sync(&other), Err(JournalError::Diverged { .. })));
}

#[test]
fn test_edited_journal_fails_strict_load() {
    let dir = tempfile::tempdir().unwrap();
    let journal = LedgerJournal::open(dir.path()).unwrap();
    journal.sync(&ledger(3)).unwrap();

    let path = dir.path().join("acme.ndjson");
    let text = fs::read_to_string(&path).unwrap();
    fs::write(&path, text.replace("\"amount\":200", "\"amount\":2")).unwrap();

    assert!(matches!(journal.load("acme"), Err(JournalError::Ledger(_))));
    let damaged = journal.load_unverified("acme").unwrap();
    assert!(!damaged.verify_chain());
    assert_eq!(damaged.verification_report().breaks[0].index, 2);
}

#[test]
fn test_garbage_line_reports_position() {
    let dir = tempfile::tempdir().unwrap();
    let journal = LedgerJournal::open(dir.path()).unwrap();
    journal.sync(&ledger(2)).unwrap();

    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(dir.path().join("acme.ndjson"))
        .unwrap();
    writeln!(file, "not json").unwrap();

    match journal.load("acme") {
        Err(JournalError::Malformed { line, .. }) => assert_eq!(line, 3),
        other => panic!("expected malformed line, got {:?}", other.map(|l| l.len())),
    }
}

#[test]
fn test_unsafe_entity_ids_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let journal = LedgerJournal::open(dir.path()).unwrap();
    for id in ["", "../escape", ".hidden", "a/b"] {
        assert!(matches!(journal.path_for(id), Err(JournalError::InvalidEntityId { .. })));
    }
}

#[test]
fn test_journal_feeds_engine_ledgers() {
    let dir = tempfile::tempdir().unwrap();
    let journal = LedgerJournal::open(dir.path()).unwrap();
    let mut engine = StateEngine::new(EngineConfig::default());
    engine.register_entity("acme", "Acme", 3_000_000).unwrap();
    engine
        .execute_operation("acme", OperationKind::Hire, &OperationParams::new())
        .unwrap();
    engine.tick().unwrap();

    let acme = &engine.entity("acme").unwrap().ledger;
    journal.sync(acme).unwrap();
    let loaded = journal.load("acme").unwrap();
    let head = acme.chain_head_hash().cloned();

    let previous = engine.replace_ledger(loaded).unwrap();
    assert_eq!(previous.chain_head_hash().cloned(), head);
    assert!(engine.verify_all_chains()["acme"]);
}
