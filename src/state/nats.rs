//! NATS backend: JetStream key/value bucket plus core pub/sub subjects
//!
//! JetStream KV has no per-key TTL, so values carry their own expiry in an
//! envelope. Create-if-absent uses the bucket's `create`, which the server
//! rejects when a live revision exists; expired entries are reclaimed with a
//! revision-checked `update` so only one contender wins.
//!
//! KV keys are restricted to `[-/_=.a-zA-Z0-9]`, so BuildNet keys are stored
//! hex-encoded.

use async_nats::jetstream::{self, kv};
use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    compile_pattern, expiry_ms, now_ms, validate_key, BackendResult, StateBackend, Subscription,
};
use crate::error::BackendError;

const SUBJECT_PREFIX: &str = "buildnet";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    value: String,
    #[serde(default)]
    expires_at_ms: Option<i64>,
}

impl Envelope {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at_ms: expiry_ms(ttl),
        }
    }

    fn is_live(&self, now: i64) -> bool {
        self.expires_at_ms.map_or(true, |at| at > now)
    }

    fn to_bytes(&self) -> BackendResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    fn from_bytes(raw: &[u8]) -> BackendResult<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

struct Connection {
    client: Client,
    store: kv::Store,
}

pub struct NatsBackend {
    url: String,
    bucket: String,
    conn: RwLock<Option<Connection>>,
}

impl NatsBackend {
    pub fn new(url: &str, bucket: &str) -> Self {
        Self {
            url: url.to_string(),
            bucket: bucket.to_string(),
            conn: RwLock::new(None),
        }
    }

    async fn store(&self) -> BackendResult<kv::Store> {
        self.conn
            .read()
            .await
            .as_ref()
            .map(|c| c.store.clone())
            .ok_or_else(|| BackendError::Unavailable("NATS backend not connected".into()))
    }

    async fn client(&self) -> BackendResult<Client> {
        self.conn
            .read()
            .await
            .as_ref()
            .map(|c| c.client.clone())
            .ok_or_else(|| BackendError::Unavailable("NATS backend not connected".into()))
    }
}

pub(crate) fn encode_key(key: &str) -> String {
    hex::encode(key.as_bytes())
}

pub(crate) fn decode_key(encoded: &str) -> Option<String> {
    hex::decode(encoded)
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok())
}

/// `gossip:WORKER_STATE` → `buildnet.gossip.WORKER_STATE`
pub(crate) fn subject_for(channel: &str) -> String {
    let sanitized: String = channel
        .chars()
        .map(|c| match c {
            ':' => '.',
            '*' | '>' | ' ' => '_',
            other => other,
        })
        .collect();
    format!("{}.{}", SUBJECT_PREFIX, sanitized)
}

fn unavailable(context: &str, e: impl std::fmt::Display) -> BackendError {
    BackendError::Unavailable(format!("NATS {}: {}", context, e))
}

/// A revision mismatch means another contender reclaimed first
fn reclaimed(key: &str, update: Result<u64, kv::UpdateError>) -> BackendResult<bool> {
    match update {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == kv::UpdateErrorKind::WrongLastRevision => {
            debug!(key, "Lost race reclaiming expired key");
            Ok(false)
        }
        Err(e) => Err(unavailable("update", e)),
    }
}

#[async_trait]
impl StateBackend for NatsBackend {
    fn name(&self) -> &'static str {
        "nats"
    }

    async fn connect(&self) -> BackendResult<()> {
        info!("Connecting to NATS at {}", self.url);

        let client = ConnectOptions::new()
            .name("buildnet")
            .connection_timeout(Duration::from_secs(5))
            .connect(self.url.as_str())
            .await
            .map_err(|e| unavailable("connect", e))?;

        let js = jetstream::new(client.clone());
        let store = match js.get_key_value(&self.bucket).await {
            Ok(store) => store,
            Err(_) => js
                .create_key_value(kv::Config {
                    bucket: self.bucket.clone(),
                    history: 1,
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                })
                .await
                .map_err(|e| unavailable("create bucket", e))?,
        };

        info!(bucket = %self.bucket, "NATS key/value bucket ready");
        *self.conn.write().await = Some(Connection { client, store });
        Ok(())
    }

    async fn disconnect(&self) -> BackendResult<()> {
        if let Some(conn) = self.conn.write().await.take() {
            conn.client
                .flush()
                .await
                .map_err(|e| unavailable("flush", e))?;
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        let store = self.store().await?;
        let raw = store
            .get(encode_key(key))
            .await
            .map_err(|e| unavailable("get", e))?;
        match raw {
            Some(raw) => {
                let envelope = Envelope::from_bytes(&raw)?;
                Ok(envelope.is_live(now_ms()).then_some(envelope.value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> BackendResult<()> {
        validate_key(key)?;
        let store = self.store().await?;
        store
            .put(encode_key(key), Envelope::new(value, ttl).to_bytes()?)
            .await
            .map_err(|e| unavailable("put", e))?;
        Ok(())
    }

    async fn set_if_not_exists(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> BackendResult<bool> {
        validate_key(key)?;
        let store = self.store().await?;
        let encoded = encode_key(key);
        let payload = Envelope::new(value, ttl).to_bytes()?;

        match store.create(&encoded, payload.clone()).await {
            Ok(_) => return Ok(true),
            Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => {}
            Err(e) => return Err(unavailable("create", e)),
        }

        // Someone holds a revision; reclaim it only if it has expired
        let entry = store
            .entry(&encoded)
            .await
            .map_err(|e| unavailable("entry", e))?;
        let Some(entry) = entry else {
            return Ok(false);
        };
        let reclaimable = match entry.operation {
            kv::Operation::Put => !Envelope::from_bytes(&entry.value)?.is_live(now_ms()),
            _ => true,
        };
        if !reclaimable {
            return Ok(false);
        }
        reclaimed(key, store.update(&encoded, payload, entry.revision).await)
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        let existed = self.get(key).await?.is_some();
        let store = self.store().await?;
        store
            .delete(encode_key(key))
            .await
            .map_err(|e| unavailable("delete", e))?;
        Ok(existed)
    }

    async fn keys(&self, pattern: &str) -> BackendResult<Vec<String>> {
        let matcher = compile_pattern(pattern)?;
        let store = self.store().await?;
        let encoded: Vec<String> = store
            .keys()
            .await
            .map_err(|e| unavailable("keys", e))?
            .try_collect()
            .await
            .map_err(|e| unavailable("keys", e))?;

        let mut keys = Vec::new();
        for key in encoded.iter().filter_map(|k| decode_key(k)) {
            if matcher.matches(&key) && self.get(&key).await?.is_some() {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, message: &str) -> BackendResult<()> {
        let client = self.client().await?;
        client
            .publish(subject_for(channel), Bytes::from(message.to_string()))
            .await
            .map_err(|e| unavailable("publish", e))
    }

    async fn subscribe(&self, channel: &str) -> BackendResult<Subscription> {
        let client = self.client().await?;
        let subscriber = client
            .subscribe(subject_for(channel))
            .await
            .map_err(|e| unavailable("subscribe", e))?;
        let stream = subscriber
            .filter_map(|msg| async move { String::from_utf8(msg.payload.to_vec()).ok() });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_encoding_round_trip() {
        let key = "work:3f2a-app:claimed";
        let encoded = encode_key(key);
        assert!(encoded.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(decode_key(&encoded), Some(key.to_string()));
    }

    #[test]
    fn test_subject_for_channel() {
        assert_eq!(subject_for("gossip:WORK_COMPLETED"), "buildnet.gossip.WORK_COMPLETED");
        assert_eq!(subject_for("a b*"), "buildnet.a_b_");
    }

    #[test]
    fn test_envelope_expiry() {
        let live = Envelope::new("v", None);
        assert!(live.is_live(now_ms()));
        let expired = Envelope {
            value: "v".into(),
            expires_at_ms: Some(now_ms() - 1),
        };
        assert!(!expired.is_live(now_ms()));
    }

    #[test]
    fn test_reclaim_only_swallows_revision_conflicts() {
        assert!(reclaimed("k", Ok(7)).unwrap());

        let conflict = kv::UpdateError::from(kv::UpdateErrorKind::WrongLastRevision);
        assert!(!reclaimed("k", Err(conflict)).unwrap());

        let timeout = kv::UpdateError::from(kv::UpdateErrorKind::TimedOut);
        let err = reclaimed("k", Err(timeout)).unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_not_connected_is_unavailable() {
        let backend = NatsBackend::new("nats://127.0.0.1:4222", "buildnet");
        let err = backend.get("k").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
