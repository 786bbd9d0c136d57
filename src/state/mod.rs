//! Shared state backend
//!
//! Every piece of cross-process coordination (worker registration, work
//! claims, results, the ledger, gossip) goes through one [`StateBackend`].
//! Four implementations are interchangeable:
//!
//! ```text
//!   ┌─────────────┐   try order (auto)
//!   │ NatsBackend │ ─┐  JetStream KV + core subjects
//!   ├─────────────┤  │
//!   │MongoBackend │ ─┤  kv collection + messages collection
//!   ├─────────────┤  │
//!   │ FileBackend │ ─┤  one file per key + lock files
//!   ├─────────────┤  │
//!   │MemoryBackend│ ─┘  DashMap + broadcast channels
//!   └─────────────┘
//! ```
//!
//! `set_if_not_exists` is the only primitive required to be atomic across
//! processes; work claiming and the ledger lock are built on it.

pub mod file;
pub mod memory;
pub mod mongo;
pub mod nats;
pub mod retry;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{BackendKind, Config};
use crate::error::BackendError;

pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use mongo::MongoBackend;
pub use nats::NatsBackend;
pub use retry::{with_backoff, RetryPolicy};

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Stream of messages published on a channel after subscription
pub type Subscription = BoxStream<'static, String>;

/// Backend handle shared between components
pub type SharedBackend = Arc<dyn StateBackend>;

#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Short identifier used in logs and `/status`
    fn name(&self) -> &'static str;

    async fn connect(&self) -> BackendResult<()>;

    async fn disconnect(&self) -> BackendResult<()>;

    /// `Ok(None)` when absent or expired
    async fn get(&self, key: &str) -> BackendResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> BackendResult<()>;

    /// Atomic create-if-absent. Expired keys count as absent.
    async fn set_if_not_exists(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> BackendResult<bool>;

    /// Returns whether a live key was removed. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> BackendResult<bool>;

    /// Live keys matching a glob pattern (`*` matches any run of characters)
    async fn keys(&self, pattern: &str) -> BackendResult<Vec<String>>;

    async fn publish(&self, channel: &str, message: &str) -> BackendResult<()>;

    async fn subscribe(&self, channel: &str) -> BackendResult<Subscription>;
}

/// Typed JSON helpers over any backend
#[async_trait]
pub trait StateBackendExt: StateBackend {
    async fn get_json<T>(&self, key: &str) -> BackendResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> BackendResult<()>
    where
        T: Serialize + Sync,
    {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw, ttl).await
    }

    async fn set_json_if_not_exists<T>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> BackendResult<bool>
    where
        T: Serialize + Sync,
    {
        let raw = serde_json::to_string(value)?;
        self.set_if_not_exists(key, &raw, ttl).await
    }
}

impl<B: StateBackend + ?Sized> StateBackendExt for B {}

/// Compile a key pattern
pub(crate) fn compile_pattern(pattern: &str) -> BackendResult<glob::Pattern> {
    glob::Pattern::new(pattern)
        .map_err(|e| BackendError::InvalidKey(format!("bad pattern '{}': {}", pattern, e)))
}

/// Literal prefix of a pattern, up to the first wildcard
pub(crate) fn pattern_prefix(pattern: &str) -> &str {
    let end = pattern
        .find(|c| matches!(c, '*' | '?' | '['))
        .unwrap_or(pattern.len());
    &pattern[..end]
}

pub(crate) fn validate_key(key: &str) -> BackendResult<()> {
    if key.is_empty() {
        return Err(BackendError::InvalidKey("empty key".into()));
    }
    Ok(())
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn expiry_ms(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|t| now_ms() + t.as_millis() as i64)
}

// ============================================================================
// Key layout
// ============================================================================

/// Key and channel names
pub mod keys {
    pub const WORKERS: &str = "workers:*";
    pub const RESOURCES: &str = "resources:*";
    pub const WORK_SPECS: &str = "work:*:spec";
    pub const WORK_RESULTS: &str = "work:*:result";
    pub const BUILDS: &str = "builds:*";
    pub const LEDGER_TAIL: &str = "ledger:tail";
    pub const LEDGER_LOCK: &str = "ledger:lock";

    pub fn worker(id: &str) -> String {
        format!("workers:{}", id)
    }

    pub fn resource(id: &str) -> String {
        format!("resources:{}", id)
    }

    pub fn work_spec(bundle_id: &str) -> String {
        format!("work:{}:spec", bundle_id)
    }

    pub fn work_claimed(bundle_id: &str) -> String {
        format!("work:{}:claimed", bundle_id)
    }

    pub fn work_result(bundle_id: &str) -> String {
        format!("work:{}:result", bundle_id)
    }

    pub fn build(request_id: &str) -> String {
        format!("builds:{}", request_id)
    }

    /// Zero-padded so lexical order matches sequence order
    pub fn ledger_entry(sequence_number: u64) -> String {
        format!("ledger:entry:{:020}", sequence_number)
    }

    pub fn gossip_channel(message_type: &str) -> String {
        format!("gossip:{}", message_type)
    }

    /// Extract the bundle id from a `work:{id}:{suffix}` key
    pub fn bundle_id_of<'a>(key: &'a str, suffix: &str) -> Option<&'a str> {
        key.strip_prefix("work:")?
            .strip_suffix(suffix)?
            .strip_suffix(':')
    }

    pub fn id_of<'a>(key: &'a str, namespace: &str) -> Option<&'a str> {
        key.strip_prefix(namespace)?.strip_prefix(':')
    }
}

// ============================================================================
// Construction and auto-detection
// ============================================================================

/// Build and connect the backend named by the config
pub async fn connect_backend(config: &Config) -> BackendResult<SharedBackend> {
    let backend = &config.backend;
    match backend.kind {
        BackendKind::Memory => connect_one(Arc::new(MemoryBackend::new())).await,
        BackendKind::File => {
            connect_one(Arc::new(FileBackend::new(config.file_backend_root()))).await
        }
        BackendKind::Nats => {
            let url = backend.nats_url.clone().ok_or_else(|| {
                BackendError::Unavailable("backend.nats_url is not configured".into())
            })?;
            connect_one(Arc::new(NatsBackend::new(&url, &backend.nats_bucket))).await
        }
        BackendKind::Mongo => {
            let uri = backend.mongo_uri.clone().ok_or_else(|| {
                BackendError::Unavailable("backend.mongo_uri is not configured".into())
            })?;
            connect_one(Arc::new(MongoBackend::new(&uri, &backend.mongo_db))).await
        }
        BackendKind::Auto => detect(config).await,
    }
}

async fn connect_one(backend: SharedBackend) -> BackendResult<SharedBackend> {
    backend.connect().await?;
    info!(backend = backend.name(), "State backend connected");
    Ok(backend)
}

/// Try networked stores first, then the file store, then memory
pub async fn detect(config: &Config) -> BackendResult<SharedBackend> {
    let backend = &config.backend;
    let mut candidates: Vec<SharedBackend> = Vec::new();
    if let Some(url) = &backend.nats_url {
        candidates.push(Arc::new(NatsBackend::new(url, &backend.nats_bucket)));
    }
    if let Some(uri) = &backend.mongo_uri {
        candidates.push(Arc::new(MongoBackend::new(uri, &backend.mongo_db)));
    }
    candidates.push(Arc::new(FileBackend::new(config.file_backend_root())));
    candidates.push(Arc::new(MemoryBackend::new()));

    detect_from(candidates).await
}

/// Connect the first candidate that answers
pub async fn detect_from(candidates: Vec<SharedBackend>) -> BackendResult<SharedBackend> {
    let mut failures = Vec::new();
    for candidate in candidates {
        match candidate.connect().await {
            Ok(()) => {
                info!(backend = candidate.name(), "State backend selected");
                return Ok(candidate);
            }
            Err(e) => {
                warn!(backend = candidate.name(), error = %e, "State backend unreachable");
                failures.push(format!("{}: {}", candidate.name(), e));
            }
        }
    }
    Err(BackendError::Unavailable(format!(
        "no state backend available ({})",
        failures.join("; ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_id_of() {
        assert_eq!(keys::bundle_id_of("work:abc-app:spec", "spec"), Some("abc-app"));
        assert_eq!(keys::bundle_id_of("work:abc-app:claimed", "spec"), None);
        assert_eq!(keys::bundle_id_of("workers:w1", "spec"), None);
    }

    #[test]
    fn test_ledger_keys_sort_by_sequence() {
        let mut k = vec![keys::ledger_entry(10), keys::ledger_entry(9), keys::ledger_entry(100)];
        k.sort();
        assert_eq!(
            k,
            vec![keys::ledger_entry(9), keys::ledger_entry(10), keys::ledger_entry(100)]
        );
    }

    #[test]
    fn test_pattern_prefix() {
        assert_eq!(pattern_prefix("work:*:spec"), "work:");
        assert_eq!(pattern_prefix("ledger:tail"), "ledger:tail");
    }

    #[tokio::test]
    async fn test_detect_skips_failing_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let candidates: Vec<SharedBackend> = vec![
            Arc::new(FileBackend::new(blocker.join("state"))),
            Arc::new(MemoryBackend::new()),
        ];
        let backend = detect_from(candidates).await.unwrap();
        assert_eq!(backend.name(), "memory");
    }

    #[tokio::test]
    async fn test_detect_fails_when_all_fail() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let candidates: Vec<SharedBackend> = vec![Arc::new(FileBackend::new(blocker.join("state")))];
        let err = detect_from(candidates).await.err().unwrap();
        assert!(err.is_retryable());
    }
}
