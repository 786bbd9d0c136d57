//! Double-entry, hash-chained audit ledger
//!
//! Every tracked state transition is written as a balanced
//! [`LedgerTransaction`] of DEBIT/CREDIT entries. Entries are stored at
//! `ledger:entry:{seq}` and the chain head at `ledger:tail`. Appends from
//! any process are serialized through the `ledger:lock` key, taken with the
//! backend's atomic create-if-absent.
//!
//! Verification is out-of-band: [`Ledger::verify`] walks the whole chain
//! and, on any break, drops the ledger's trust flag so cleanup jobs stop
//! touching history.

pub mod entry;
pub mod verify;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::LedgerConfig;
use crate::error::{BuildNetError, LedgerError};
use crate::state::{keys, with_backoff, RetryPolicy, SharedBackend, StateBackendExt};

pub use entry::{AccountType, EntryDraft, EntryType, LedgerEntry, LedgerTransaction, GENESIS_CHECKSUM};
pub use verify::{verify_chain, VerificationReport};

/// Chain head stored at `ledger:tail`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTail {
    pub sequence_number: u64,
    pub checksum: String,
}

impl LedgerTail {
    fn genesis() -> Self {
        Self {
            sequence_number: 0,
            checksum: GENESIS_CHECKSUM.to_string(),
        }
    }
}

pub struct Ledger {
    backend: SharedBackend,
    retry: RetryPolicy,
    lock_ttl: Duration,
    lock_wait: Duration,
    /// Serializes appends from this process before contending on the backend lock
    append_lock: Mutex<()>,
    trusted: AtomicBool,
}

impl Ledger {
    pub fn new(backend: SharedBackend, config: &LedgerConfig, retry: RetryPolicy) -> Self {
        Self {
            backend,
            retry,
            lock_ttl: Duration::from_millis(config.lock_ttl_ms),
            lock_wait: Duration::from_millis(config.lock_wait_ms),
            append_lock: Mutex::new(()),
            trusted: AtomicBool::new(true),
        }
    }

    /// False once a verification has found a break
    pub fn is_trusted(&self) -> bool {
        self.trusted.load(Ordering::SeqCst)
    }

    /// Append a balanced transaction, returning the sequenced entries
    pub async fn record(&self, tx: LedgerTransaction) -> Result<Vec<LedgerEntry>, LedgerError> {
        tx.validate()?;

        let _local = self.append_lock.lock().await;
        let token = self.acquire_lock().await?;
        let result = self.append_locked(&tx).await;
        self.release_lock(&token).await;

        let entries = result?;
        debug!(
            transaction_id = %tx.transaction_id,
            first = entries.first().map(|e| e.sequence_number),
            count = entries.len(),
            reason = %tx.reason,
            "Ledger transaction recorded"
        );
        Ok(entries)
    }

    async fn append_locked(&self, tx: &LedgerTransaction) -> Result<Vec<LedgerEntry>, LedgerError> {
        let backend = &self.backend;
        let tail = with_backoff(&self.retry, "ledger tail", || async {
            backend.get_json::<LedgerTail>(keys::LEDGER_TAIL).await
        })
        .await?
        .unwrap_or_else(LedgerTail::genesis);

        let timestamp = Utc::now();
        let mut sequence = tail.sequence_number;
        let mut previous = tail.checksum;
        let mut written = Vec::with_capacity(tx.entries.len());

        for draft in &tx.entries {
            sequence += 1;
            let mut entry = LedgerEntry {
                entry_id: uuid::Uuid::new_v4().to_string(),
                transaction_id: tx.transaction_id.clone(),
                sequence_number: sequence,
                entry_type: draft.entry_type,
                account_type: draft.account_type,
                entity_type: draft.entity_type.clone(),
                entity_id: draft.entity_id.clone(),
                previous_state: draft.previous_state.clone(),
                new_state: draft.new_state.clone(),
                delta: draft.delta,
                timestamp,
                actor: tx.actor.clone(),
                reason: tx.reason.clone(),
                correlation_id: tx.correlation_id.clone(),
                checksum: String::new(),
                previous_checksum: previous.clone(),
            };
            entry.checksum = entry.compute_checksum();

            let key = keys::ledger_entry(sequence);
            with_backoff(&self.retry, "ledger append", || async {
                backend.set_json(&key, &entry, None).await
            })
            .await?;

            previous = entry.checksum.clone();
            written.push(entry);
        }

        // Entries past an unwritten tail are overwritten by the next append
        let new_tail = LedgerTail {
            sequence_number: sequence,
            checksum: previous,
        };
        with_backoff(&self.retry, "ledger tail", || async {
            backend.set_json(keys::LEDGER_TAIL, &new_tail, None).await
        })
        .await?;

        Ok(written)
    }

    async fn acquire_lock(&self) -> Result<String, LedgerError> {
        let token = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut delay = Duration::from_millis(1);
        loop {
            let acquired = with_backoff(&self.retry, "ledger lock", || async {
                self.backend
                    .set_if_not_exists(keys::LEDGER_LOCK, &token, Some(self.lock_ttl))
                    .await
            })
            .await?;
            if acquired {
                return Ok(token);
            }
            if started.elapsed() >= self.lock_wait {
                return Err(LedgerError::LockTimeout(self.lock_wait));
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_millis(50));
        }
    }

    async fn release_lock(&self, token: &str) {
        // Only remove the lock if it is still ours (it may have expired and been retaken)
        match self.backend.get(keys::LEDGER_LOCK).await {
            Ok(Some(current)) if current == token => {
                if let Err(e) = self.backend.delete(keys::LEDGER_LOCK).await {
                    warn!(error = %e, "Failed to release ledger lock; it will expire");
                }
            }
            Ok(_) => warn!("Ledger lock expired before release"),
            Err(e) => warn!(error = %e, "Failed to read ledger lock; it will expire"),
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn tail(&self) -> Result<LedgerTail, LedgerError> {
        Ok(self
            .backend
            .get_json::<LedgerTail>(keys::LEDGER_TAIL)
            .await?
            .unwrap_or_else(LedgerTail::genesis))
    }

    pub async fn entry(&self, sequence_number: u64) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(self
            .backend
            .get_json(&keys::ledger_entry(sequence_number))
            .await?)
    }

    /// Entries with `from <= sequence <= to` that exist
    pub async fn entries(&self, from: u64, to: u64) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut out = Vec::new();
        for seq in from.max(1)..=to {
            if let Some(entry) = self.entry(seq).await? {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Full history of one entity
    pub async fn entries_for(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let all = self.load_all().await?;
        Ok(all
            .into_values()
            .filter(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .collect())
    }

    async fn load_all(&self) -> Result<BTreeMap<u64, LedgerEntry>, LedgerError> {
        let mut entries = BTreeMap::new();
        for key in self.backend.keys("ledger:entry:*").await? {
            let Some(seq) = key
                .strip_prefix("ledger:entry:")
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            match self.backend.get(&key).await? {
                Some(raw) => match serde_json::from_str::<LedgerEntry>(&raw) {
                    Ok(entry) => {
                        entries.insert(seq, entry);
                    }
                    // Unparseable entries surface as missing during verification
                    Err(e) => warn!(sequence = seq, error = %e, "Unreadable ledger entry"),
                },
                None => {}
            }
        }
        Ok(entries)
    }

    // ========================================================================
    // Verification
    // ========================================================================

    /// Walk the full chain. A non-empty report drops the trust flag.
    pub async fn verify(&self) -> Result<VerificationReport, LedgerError> {
        let entries = self.load_all().await?;
        let tail = match self.backend.get_json::<LedgerTail>(keys::LEDGER_TAIL).await? {
            Some(tail) => tail.sequence_number,
            None => entries.keys().next_back().copied().unwrap_or(0),
        };

        let report = verify_chain(&entries, tail);
        if report.is_valid() {
            info!(entries = report.entries_checked, "Ledger verified");
        } else {
            self.trusted.store(false, Ordering::SeqCst);
            for err in &report.errors {
                error!(
                    kind = %err.kind,
                    sequence = err.sequence_number,
                    detail = %err.detail,
                    "Ledger integrity error"
                );
            }
        }
        Ok(report)
    }

    /// Like [`verify`](Self::verify) but fails with the first integrity error
    pub async fn verify_strict(&self) -> Result<VerificationReport, BuildNetError> {
        let report = self.verify().await?;
        match report.errors.first() {
            Some(err) => Err(BuildNetError::Integrity(err.clone())),
            None => Ok(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActorIdentity;
    use crate::state::MemoryBackend;
    use std::sync::Arc;

    fn ledger() -> (SharedBackend, Ledger) {
        let backend: SharedBackend = Arc::new(MemoryBackend::new());
        let ledger = Ledger::new(backend.clone(), &LedgerConfig::default(), RetryPolicy::default());
        (backend, ledger)
    }

    #[tokio::test]
    async fn test_sequences_are_gapless() {
        let (_backend, ledger) = ledger();
        ledger
            .record(LedgerTransaction::worker_registered("w1", 2))
            .await
            .unwrap();
        let entries = ledger
            .record(LedgerTransaction::slot_claimed("w1", "b1", "r1", 1))
            .await
            .unwrap();
        assert_eq!(entries[0].sequence_number, 3);
        assert_eq!(entries[1].sequence_number, 4);
        assert_eq!(entries[1].previous_checksum, entries[0].checksum);
        assert_eq!(ledger.tail().await.unwrap().sequence_number, 4);
        assert!(ledger.verify().await.unwrap().is_valid());
    }

    #[tokio::test]
    async fn test_unbalanced_writes_nothing() {
        let (_backend, ledger) = ledger();
        let tx = LedgerTransaction::new(ActorIdentity::system(), "bad").credit(
            AccountType::WorkerSlots,
            "worker",
            "w1",
            1,
            None,
            None,
        );
        assert!(ledger.record(tx).await.is_err());
        assert_eq!(ledger.tail().await.unwrap().sequence_number, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ledgers_share_one_chain() {
        let backend: SharedBackend = Arc::new(MemoryBackend::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            // Separate Ledger instances stand in for separate processes
            let ledger = Ledger::new(backend.clone(), &LedgerConfig::default(), RetryPolicy::default());
            handles.push(tokio::spawn(async move {
                ledger
                    .record(LedgerTransaction::slot_claimed(&format!("w{}", i), "b", "r", 1))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let ledger = Ledger::new(backend, &LedgerConfig::default(), RetryPolicy::default());
        assert_eq!(ledger.tail().await.unwrap().sequence_number, 16);
        assert!(ledger.verify().await.unwrap().is_valid());
    }

    #[tokio::test]
    async fn test_entries_for_entity() {
        let (_backend, ledger) = ledger();
        ledger
            .record(LedgerTransaction::slot_claimed("w1", "b1", "r1", 1))
            .await
            .unwrap();
        ledger
            .record(LedgerTransaction::claim_released("w1", "b1", "r1", true))
            .await
            .unwrap();
        let history = ledger.entries_for("bundle", "b1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].entry_type, EntryType::Credit);
        assert_eq!(history[1].entry_type, EntryType::Debit);
    }

    #[tokio::test]
    async fn test_corruption_drops_trust() {
        let (backend, ledger) = ledger();
        ledger
            .record(LedgerTransaction::worker_registered("w1", 2))
            .await
            .unwrap();
        let mut entry = ledger.entry(1).await.unwrap().unwrap();
        entry.checksum = "0".repeat(64);
        backend
            .set_json(&keys::ledger_entry(1), &entry, None)
            .await
            .unwrap();

        assert!(ledger.is_trusted());
        let err = ledger.verify_strict().await.unwrap_err();
        assert!(matches!(err, BuildNetError::Integrity(_)));
        assert!(!ledger.is_trusted());
    }
}
