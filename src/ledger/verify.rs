//! Hash-chain verification

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::entry::{LedgerEntry, GENESIS_CHECKSUM};
use crate::error::{IntegrityError, IntegrityErrorKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub entries_checked: u64,
    pub tail_sequence: u64,
    pub errors: Vec<IntegrityError>,
    pub verified_at: DateTime<Utc>,
}

impl VerificationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Walk sequences `1..=tail_sequence`.
///
/// Each entry's checksum is recomputed and compared with the stored one;
/// its `previous_checksum` is compared with the *recomputed* checksum of
/// its predecessor, so a corrupted stored checksum is reported once, at
/// the entry that carries it.
pub fn verify_chain(entries: &BTreeMap<u64, LedgerEntry>, tail_sequence: u64) -> VerificationReport {
    let mut errors = Vec::new();
    let mut checked = 0;
    // None after a gap: the link across a missing entry cannot be judged
    let mut expected_previous: Option<String> = Some(GENESIS_CHECKSUM.to_string());

    for sequence in 1..=tail_sequence {
        let Some(entry) = entries.get(&sequence) else {
            errors.push(IntegrityError {
                kind: IntegrityErrorKind::MissingEntry,
                sequence_number: sequence,
                detail: "entry not found".to_string(),
            });
            expected_previous = None;
            continue;
        };
        checked += 1;

        let recomputed = entry.compute_checksum();
        if entry.sequence_number != sequence {
            errors.push(IntegrityError {
                kind: IntegrityErrorKind::ChainBreak,
                sequence_number: sequence,
                detail: format!("entry declares sequence {}", entry.sequence_number),
            });
        } else if recomputed != entry.checksum {
            errors.push(IntegrityError {
                kind: IntegrityErrorKind::ChecksumMismatch,
                sequence_number: sequence,
                detail: format!("stored {}, computed {}", entry.checksum, recomputed),
            });
        }

        if let Some(expected) = &expected_previous {
            if &entry.previous_checksum != expected {
                errors.push(IntegrityError {
                    kind: IntegrityErrorKind::ChainBreak,
                    sequence_number: sequence,
                    detail: format!(
                        "previous_checksum {} does not match predecessor {}",
                        entry.previous_checksum, expected
                    ),
                });
            }
        }
        expected_previous = Some(recomputed);
    }

    VerificationReport {
        entries_checked: checked,
        tail_sequence,
        errors,
        verified_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::entry::{AccountType, EntryType};
    use crate::model::ActorIdentity;

    fn chain(n: u64) -> BTreeMap<u64, LedgerEntry> {
        let mut entries = BTreeMap::new();
        let mut previous = GENESIS_CHECKSUM.to_string();
        for seq in 1..=n {
            let mut entry = LedgerEntry {
                entry_id: format!("e{}", seq),
                transaction_id: format!("t{}", (seq + 1) / 2),
                sequence_number: seq,
                entry_type: if seq % 2 == 1 { EntryType::Debit } else { EntryType::Credit },
                account_type: AccountType::WorkerSlots,
                entity_type: "worker".into(),
                entity_id: "w1".into(),
                previous_state: None,
                new_state: None,
                delta: 1,
                timestamp: Utc::now(),
                actor: ActorIdentity::system(),
                reason: "test".into(),
                correlation_id: None,
                checksum: String::new(),
                previous_checksum: previous.clone(),
            };
            entry.checksum = entry.compute_checksum();
            previous = entry.checksum.clone();
            entries.insert(seq, entry);
        }
        entries
    }

    #[test]
    fn test_intact_chain() {
        let report = verify_chain(&chain(6), 6);
        assert!(report.is_valid());
        assert_eq!(report.entries_checked, 6);
    }

    #[test]
    fn test_single_corrupted_checksum_reports_once() {
        for target in 1..=6 {
            let mut entries = chain(6);
            entries.get_mut(&target).unwrap().checksum = "deadbeef".into();
            let report = verify_chain(&entries, 6);
            assert_eq!(report.errors.len(), 1, "target {}", target);
            assert_eq!(report.errors[0].kind, IntegrityErrorKind::ChecksumMismatch);
            assert_eq!(report.errors[0].sequence_number, target);
        }
    }

    #[test]
    fn test_missing_entry() {
        let mut entries = chain(5);
        entries.remove(&3);
        let report = verify_chain(&entries, 5);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, IntegrityErrorKind::MissingEntry);
        assert_eq!(report.errors[0].sequence_number, 3);
    }

    #[test]
    fn test_relinked_entry_is_chain_break() {
        let mut entries = chain(4);
        let entry = entries.get_mut(&3).unwrap();
        entry.previous_checksum = "a".repeat(64);
        entry.checksum = entry.compute_checksum();
        let report = verify_chain(&entries, 4);
        // Both links around the rewritten entry break
        let breaks: Vec<u64> = report
            .errors
            .iter()
            .filter(|e| e.kind == IntegrityErrorKind::ChainBreak)
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(breaks, vec![3, 4]);
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn test_tampered_content_detected() {
        let mut entries = chain(4);
        entries.get_mut(&2).unwrap().delta = 99;
        let report = verify_chain(&entries, 4);
        assert!(report
            .errors
            .iter()
            .any(|e| e.kind == IntegrityErrorKind::ChecksumMismatch && e.sequence_number == 2));
    }
}
