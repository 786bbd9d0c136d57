//! Ledger chaining and tamper detection on the file backend

use std::sync::Arc;

use buildnet::config::LedgerConfig;
use buildnet::error::IntegrityErrorKind;
use buildnet::ledger::{Ledger, LedgerTransaction, GENESIS_CHECKSUM};
use buildnet::model::{ActorIdentity, BuildStatus, ResourceStatus};
use buildnet::state::{keys, FileBackend, RetryPolicy, SharedBackend, StateBackend};
use buildnet::BuildNetError;

async fn setup(dir: &tempfile::TempDir) -> (SharedBackend, Ledger) {
    let backend = FileBackend::new(dir.path());
    backend.connect().await.unwrap();
    let backend: SharedBackend = Arc::new(backend);
    let ledger = Ledger::new(backend.clone(), &LedgerConfig::default(), RetryPolicy::default());
    (backend, ledger)
}

async fn populate(ledger: &Ledger) {
    ledger
        .record(LedgerTransaction::worker_registered("w1", 2))
        .await
        .unwrap();
    ledger
        .record(LedgerTransaction::slot_claimed("w1", "b1", "r1", 1))
        .await
        .unwrap();
    ledger
        .record(LedgerTransaction::claim_released("w1", "b1", "r1", true))
        .await
        .unwrap();
    ledger
        .record(LedgerTransaction::build_state_changed(
            ActorIdentity::system(),
            "r1",
            Some(BuildStatus::Running),
            BuildStatus::Completed,
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_chain_links_and_verifies() {
    let dir = tempfile::tempdir().unwrap();
    let (_, ledger) = setup(&dir).await;
    populate(&ledger).await;

    let tail = ledger.tail().await.unwrap();
    let entries = ledger.entries(1, tail.sequence_number).await.unwrap();
    assert_eq!(entries.len() as u64, tail.sequence_number);
    assert_eq!(entries[0].previous_checksum, GENESIS_CHECKSUM);
    for pair in entries.windows(2) {
        assert_eq!(pair[1].sequence_number, pair[0].sequence_number + 1);
        assert_eq!(pair[1].previous_checksum, pair[0].checksum);
    }
    assert_eq!(tail.checksum, entries.last().unwrap().checksum);

    let report = ledger.verify().await.unwrap();
    assert!(report.is_valid());
    assert_eq!(report.entries_checked, tail.sequence_number);
    assert!(ledger.is_trusted());
}

#[tokio::test]
async fn test_chain_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (_, ledger) = setup(&dir).await;
        populate(&ledger).await;
    }
    let (_, reopened) = setup(&dir).await;
    let before = reopened.tail().await.unwrap();
    reopened
        .record(LedgerTransaction::node_health_changed(
            "w1",
            ResourceStatus::Online,
            ResourceStatus::Unhealthy,
        ))
        .await
        .unwrap();

    let after = reopened.tail().await.unwrap();
    assert!(after.sequence_number > before.sequence_number);
    assert!(reopened.verify().await.unwrap().is_valid());
}

#[tokio::test]
async fn test_tampered_entry_detected() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, ledger) = setup(&dir).await;
    populate(&ledger).await;

    // Rewrite history: change the reason on entry 2 without fixing its checksum
    let key = keys::ledger_entry(2);
    let raw = backend.get(&key).await.unwrap().unwrap();
    let mut value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    value["reason"] = serde_json::Value::String("nothing to see here".into());
    backend.set(&key, &value.to_string(), None).await.unwrap();

    let report = ledger.verify().await.unwrap();
    assert!(!report.is_valid());
    assert!(report
        .errors
        .iter()
        .any(|e| e.kind == IntegrityErrorKind::ChecksumMismatch && e.sequence_number == 2));
    assert!(!ledger.is_trusted());

    match ledger.verify_strict().await {
        Err(BuildNetError::Integrity(err)) => assert_eq!(err.sequence_number, 2),
        other => panic!("expected integrity error, got {:?}", other.map(|r| r.entries_checked)),
    }
}

#[tokio::test]
async fn test_missing_entry_detected() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, ledger) = setup(&dir).await;
    populate(&ledger).await;

    backend.delete(&keys::ledger_entry(3)).await.unwrap();

    let report = ledger.verify().await.unwrap();
    assert!(report
        .errors
        .iter()
        .any(|e| e.kind == IntegrityErrorKind::MissingEntry && e.sequence_number == 3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_keep_one_chain() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, _) = setup(&dir).await;

    // Separate ledger instances contend through the backend lock
    let mut handles = Vec::new();
    for i in 0..4 {
        let ledger = Ledger::new(backend.clone(), &LedgerConfig::default(), RetryPolicy::default());
        handles.push(tokio::spawn(async move {
            for j in 0..3 {
                ledger
                    .record(LedgerTransaction::slot_claimed(
                        &format!("w{}", i),
                        &format!("b{}-{}", i, j),
                        "r",
                        1,
                    ))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let ledger = Ledger::new(backend, &LedgerConfig::default(), RetryPolicy::default());
    let report = ledger.verify().await.unwrap();
    assert!(report.is_valid(), "{:?}", report.errors);
    let entries = ledger.entries_for("bundle", "b2-1").await.unwrap();
    assert!(!entries.is_empty());
}
