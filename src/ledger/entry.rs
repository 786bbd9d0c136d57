//! Ledger entries and transactions

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::LedgerError;
use crate::model::{ActorIdentity, BuildStatus, ResourceStatus};

/// `previous_checksum` of the first entry
pub const GENESIS_CHECKSUM: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    Debit,
    Credit,
}

impl EntryType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Debit => "DEBIT",
            Self::Credit => "CREDIT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    /// Slots the cluster has available overall
    ClusterCapacity,
    /// Free slots of one worker
    WorkerSlots,
    /// Outstanding claims on bundles
    BundleClaims,
    /// Build request lifecycle
    BuildState,
    /// Worker health lifecycle
    NodeHealth,
}

impl AccountType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::ClusterCapacity => "cluster_capacity",
            Self::WorkerSlots => "worker_slots",
            Self::BundleClaims => "bundle_claims",
            Self::BuildState => "build_state",
            Self::NodeHealth => "node_health",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub transaction_id: String,
    pub sequence_number: u64,
    pub entry_type: EntryType,
    pub account_type: AccountType,
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default)]
    pub previous_state: Option<serde_json::Value>,
    #[serde(default)]
    pub new_state: Option<serde_json::Value>,
    pub delta: i64,
    pub timestamp: DateTime<Utc>,
    pub actor: ActorIdentity,
    pub reason: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub checksum: String,
    pub previous_checksum: String,
}

impl LedgerEntry {
    /// SHA-256 over every field except `checksum`, ending with `previous_checksum`
    pub fn compute_checksum(&self) -> String {
        let json = |v: &Option<serde_json::Value>| {
            v.as_ref().map(|v| v.to_string()).unwrap_or_default()
        };
        let metadata: BTreeMap<_, _> = self.actor.metadata.iter().collect();
        let metadata = serde_json::to_string(&metadata).unwrap_or_default();
        let actor_type = serde_json::to_string(&self.actor.actor_type).unwrap_or_default();

        let sequence = self.sequence_number.to_string();
        let delta = self.delta.to_string();
        let timestamp = self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true);
        let previous_state = json(&self.previous_state);
        let new_state = json(&self.new_state);

        let fields: [&str; 18] = [
            self.entry_id.as_str(),
            self.transaction_id.as_str(),
            sequence.as_str(),
            self.entry_type.as_str(),
            self.account_type.as_str(),
            self.entity_type.as_str(),
            self.entity_id.as_str(),
            previous_state.as_str(),
            new_state.as_str(),
            delta.as_str(),
            timestamp.as_str(),
            self.actor.id.as_str(),
            self.actor.name.as_str(),
            actor_type.as_str(),
            metadata.as_str(),
            self.reason.as_str(),
            self.correlation_id.as_deref().unwrap_or(""),
            self.previous_checksum.as_str(),
        ];

        let mut hasher = Sha256::new();
        for field in fields {
            hasher.update(field.len().to_le_bytes());
            hasher.update(field.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn has_valid_checksum(&self) -> bool {
        self.compute_checksum() == self.checksum
    }
}

/// One side of a transaction before it is sequenced
#[derive(Debug, Clone, PartialEq)]
pub struct EntryDraft {
    pub entry_type: EntryType,
    pub account_type: AccountType,
    pub entity_type: String,
    pub entity_id: String,
    pub previous_state: Option<serde_json::Value>,
    pub new_state: Option<serde_json::Value>,
    pub delta: i64,
}

/// Entries that commit together under one `transaction_id`.
///
/// Debits and credits must balance.
#[derive(Debug, Clone)]
pub struct LedgerTransaction {
    pub transaction_id: String,
    pub correlation_id: Option<String>,
    pub actor: ActorIdentity,
    pub reason: String,
    pub entries: Vec<EntryDraft>,
}

impl LedgerTransaction {
    pub fn new(actor: ActorIdentity, reason: impl Into<String>) -> Self {
        Self {
            transaction_id: uuid::Uuid::new_v4().to_string(),
            correlation_id: None,
            actor,
            reason: reason.into(),
            entries: Vec::new(),
        }
    }

    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[allow(clippy::too_many_arguments)]
    fn push(
        mut self,
        entry_type: EntryType,
        account_type: AccountType,
        entity_type: &str,
        entity_id: &str,
        delta: i64,
        previous_state: Option<serde_json::Value>,
        new_state: Option<serde_json::Value>,
    ) -> Self {
        self.entries.push(EntryDraft {
            entry_type,
            account_type,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            previous_state,
            new_state,
            delta,
        });
        self
    }

    pub fn debit(
        self,
        account_type: AccountType,
        entity_type: &str,
        entity_id: &str,
        delta: i64,
        previous_state: Option<serde_json::Value>,
        new_state: Option<serde_json::Value>,
    ) -> Self {
        self.push(
            EntryType::Debit,
            account_type,
            entity_type,
            entity_id,
            delta,
            previous_state,
            new_state,
        )
    }

    pub fn credit(
        self,
        account_type: AccountType,
        entity_type: &str,
        entity_id: &str,
        delta: i64,
        previous_state: Option<serde_json::Value>,
        new_state: Option<serde_json::Value>,
    ) -> Self {
        self.push(
            EntryType::Credit,
            account_type,
            entity_type,
            entity_id,
            delta,
            previous_state,
            new_state,
        )
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        let sum = |kind: EntryType| -> i64 {
            self.entries
                .iter()
                .filter(|e| e.entry_type == kind)
                .map(|e| e.delta)
                .sum()
        };
        let debits = sum(EntryType::Debit);
        let credits = sum(EntryType::Credit);
        if self.entries.is_empty() || debits != credits {
            return Err(LedgerError::Unbalanced {
                transaction_id: self.transaction_id.clone(),
                debits,
                credits,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Tracked transitions
    // ========================================================================

    pub fn worker_registered(worker_id: &str, concurrency: u32) -> Self {
        let slots = concurrency as i64;
        Self::new(ActorIdentity::agent(worker_id), "worker registered")
            .debit(
                AccountType::ClusterCapacity,
                "cluster",
                "cluster",
                slots,
                None,
                None,
            )
            .credit(
                AccountType::WorkerSlots,
                "worker",
                worker_id,
                slots,
                None,
                Some(serde_json::json!({ "status": "online", "slots": concurrency })),
            )
    }

    pub fn worker_deregistered(worker_id: &str, concurrency: u32) -> Self {
        let slots = concurrency as i64;
        Self::new(ActorIdentity::agent(worker_id), "worker deregistered")
            .debit(
                AccountType::WorkerSlots,
                "worker",
                worker_id,
                slots,
                Some(serde_json::json!({ "slots": concurrency })),
                Some(serde_json::json!({ "status": "offline" })),
            )
            .credit(
                AccountType::ClusterCapacity,
                "cluster",
                "cluster",
                slots,
                None,
                None,
            )
    }

    pub fn slot_claimed(worker_id: &str, bundle_id: &str, request_id: &str, attempt: u32) -> Self {
        Self::new(ActorIdentity::agent(worker_id), "bundle claimed")
            .correlated(request_id)
            .debit(AccountType::WorkerSlots, "worker", worker_id, 1, None, None)
            .credit(
                AccountType::BundleClaims,
                "bundle",
                bundle_id,
                1,
                None,
                Some(serde_json::json!({ "claimed_by": worker_id, "attempt": attempt })),
            )
    }

    pub fn claim_released(worker_id: &str, bundle_id: &str, request_id: &str, success: bool) -> Self {
        let outcome = if success { "completed" } else { "failed" };
        Self::new(ActorIdentity::agent(worker_id), format!("claim released ({})", outcome))
            .correlated(request_id)
            .debit(
                AccountType::BundleClaims,
                "bundle",
                bundle_id,
                1,
                Some(serde_json::json!({ "claimed_by": worker_id })),
                Some(serde_json::json!({ "outcome": outcome })),
            )
            .credit(AccountType::WorkerSlots, "worker", worker_id, 1, None, None)
    }

    /// Claim held by a worker presumed dead; left to expire
    pub fn claim_orphaned(worker_id: &str, bundle_id: &str) -> Self {
        Self::new(ActorIdentity::service("health-monitor"), "claim orphaned by unresponsive worker")
            .debit(
                AccountType::BundleClaims,
                "bundle",
                bundle_id,
                1,
                Some(serde_json::json!({ "claimed_by": worker_id })),
                Some(serde_json::json!({ "orphaned": true })),
            )
            .credit(
                AccountType::ClusterCapacity,
                "cluster",
                "cluster",
                1,
                None,
                None,
            )
    }

    /// One unit moves from the old status to the new one
    pub fn build_state_changed(
        actor: ActorIdentity,
        request_id: &str,
        from: Option<BuildStatus>,
        to: BuildStatus,
    ) -> Self {
        let from_json = from.map(|s| serde_json::json!(s));
        Self::new(actor, format!("build {}", to))
            .correlated(request_id)
            .debit(
                AccountType::BuildState,
                "build_request",
                request_id,
                1,
                from_json.clone(),
                None,
            )
            .credit(
                AccountType::BuildState,
                "build_request",
                request_id,
                1,
                from_json,
                Some(serde_json::json!(to)),
            )
    }

    pub fn node_health_changed(worker_id: &str, from: ResourceStatus, to: ResourceStatus) -> Self {
        let from_json = Some(serde_json::json!(from));
        let to_json = Some(serde_json::json!(to));
        Self::new(
            ActorIdentity::service("health-monitor"),
            format!("node health {:?} -> {:?}", from, to).to_lowercase(),
        )
        .debit(
            AccountType::NodeHealth,
            "worker",
            worker_id,
            1,
            from_json.clone(),
            None,
        )
        .credit(
            AccountType::NodeHealth,
            "worker",
            worker_id,
            1,
            from_json,
            to_json,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> LedgerEntry {
        LedgerEntry {
            entry_id: "e1".into(),
            transaction_id: "t1".into(),
            sequence_number: 1,
            entry_type: EntryType::Debit,
            account_type: AccountType::WorkerSlots,
            entity_type: "worker".into(),
            entity_id: "w1".into(),
            previous_state: None,
            new_state: Some(serde_json::json!({ "slots": 2 })),
            delta: 1,
            timestamp: Utc::now(),
            actor: ActorIdentity::agent("w1"),
            reason: "test".into(),
            correlation_id: None,
            checksum: String::new(),
            previous_checksum: GENESIS_CHECKSUM.into(),
        }
    }

    #[test]
    fn test_checksum_is_deterministic_across_serde() {
        let mut entry = sample_entry();
        entry.checksum = entry.compute_checksum();
        let json = serde_json::to_string(&entry).unwrap();
        let back: LedgerEntry = serde_json::from_str(&json).unwrap();
        assert!(back.has_valid_checksum());
        assert_eq!(back.checksum.len(), 64);
    }

    #[test]
    fn test_checksum_covers_previous_checksum() {
        let mut entry = sample_entry();
        let a = entry.compute_checksum();
        entry.previous_checksum = "f".repeat(64);
        assert_ne!(a, entry.compute_checksum());
    }

    #[test]
    fn test_checksum_covers_fields() {
        let mut entry = sample_entry();
        let a = entry.compute_checksum();
        entry.delta = 2;
        assert_ne!(a, entry.compute_checksum());
    }

    #[test]
    fn test_transitions_balance() {
        assert!(LedgerTransaction::worker_registered("w1", 4).validate().is_ok());
        assert!(LedgerTransaction::slot_claimed("w1", "b1", "r1", 1).validate().is_ok());
        assert!(LedgerTransaction::claim_released("w1", "b1", "r1", true).validate().is_ok());
        assert!(LedgerTransaction::claim_orphaned("w1", "b1").validate().is_ok());
        assert!(LedgerTransaction::build_state_changed(
            ActorIdentity::system(),
            "r1",
            Some(BuildStatus::Queued),
            BuildStatus::Running
        )
        .validate()
        .is_ok());
    }

    #[test]
    fn test_unbalanced_rejected() {
        let tx = LedgerTransaction::new(ActorIdentity::system(), "bad").debit(
            AccountType::WorkerSlots,
            "worker",
            "w1",
            2,
            None,
            None,
        );
        assert!(matches!(tx.validate(), Err(LedgerError::Unbalanced { debits: 2, credits: 0, .. })));
    }
}
