//! In-process backend for tests and single-machine runs

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use futures::StreamExt;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use super::{compile_pattern, validate_key, BackendResult, StateBackend, Subscription};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// DashMap-backed store; create-if-absent is atomic through the shard lock
#[derive(Default)]
pub struct MemoryBackend {
    entries: DashMap<String, Entry>,
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> BackendResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> BackendResult<()> {
        self.channels.clear();
        Ok(())
    }

    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        let now = Instant::now();
        let value = self
            .entries
            .get(key)
            .and_then(|e| e.is_live(now).then(|| e.value.clone()));
        if value.is_none() {
            self.entries.remove_if(key, |_, e| !e.is_live(now));
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> BackendResult<()> {
        validate_key(key)?;
        self.entries.insert(key.to_string(), Entry::new(value, ttl));
        Ok(())
    }

    async fn set_if_not_exists(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> BackendResult<bool> {
        validate_key(key)?;
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(Entry::new(value, ttl));
                    Ok(true)
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, e)| e.is_live(now))
            .unwrap_or(false))
    }

    async fn keys(&self, pattern: &str) -> BackendResult<Vec<String>> {
        let matcher = compile_pattern(pattern)?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().is_live(now) && matcher.matches(e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, message: &str) -> BackendResult<()> {
        // No subscribers is not an error
        let delivered = self.sender(channel).send(message.to_string()).unwrap_or(0);
        debug!(channel, delivered, "Published");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BackendResult<Subscription> {
        let rx = self.sender(channel).subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|msg| async move { msg.ok() });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_get_set_delete() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get("a").await.unwrap(), None);
        backend.set("a", "1", None).await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), Some("1".to_string()));
        assert!(backend.delete("a").await.unwrap());
        assert!(!backend.delete("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_expiry_frees_key() {
        let backend = MemoryBackend::new();
        assert!(backend
            .set_if_not_exists("k", "first", Some(Duration::from_millis(20)))
            .await
            .unwrap());
        assert!(!backend.set_if_not_exists("k", "second", None).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(backend.set_if_not_exists("k", "third", None).await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), Some("third".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_set_if_not_exists_has_one_winner() {
        let backend = Arc::new(MemoryBackend::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend
                    .set_if_not_exists("work:b1:claimed", &format!("w{}", i), None)
                    .await
                    .unwrap()
            }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_keys_pattern() {
        let backend = MemoryBackend::new();
        backend.set("work:a:spec", "{}", None).await.unwrap();
        backend.set("work:a:claimed", "{}", None).await.unwrap();
        backend.set("work:b:spec", "{}", None).await.unwrap();
        backend.set("workers:w1", "{}", None).await.unwrap();
        let keys = backend.keys("work:*:spec").await.unwrap();
        assert_eq!(keys, vec!["work:a:spec".to_string(), "work:b:spec".to_string()]);
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let backend = MemoryBackend::new();
        let mut sub = backend.subscribe("gossip:HEARTBEAT").await.unwrap();
        backend.publish("gossip:HEARTBEAT", "hello").await.unwrap();
        assert_eq!(sub.next().await, Some("hello".to_string()));
    }
}
