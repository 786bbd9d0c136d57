//! MongoDB backend
//!
//! Keys live in a `kv` collection keyed by `_id`. Expiry is an explicit
//! `expires_at` field checked on read, with a TTL index so the server
//! eventually garbage-collects expired documents. Create-if-absent is an
//! `insert_one` that fails with a duplicate-key error when the key exists.
//! Pub/sub uses a `messages` collection tailed by polling on `_id`.

use async_trait::async_trait;
use bson::{doc, oid::ObjectId, DateTime};
use futures::{StreamExt, TryStreamExt};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, IndexModel};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::{compile_pattern, pattern_prefix, validate_key, BackendResult, StateBackend, Subscription};
use crate::error::BackendError;

const DUPLICATE_KEY: i32 = 11000;

/// Messages older than this are removed by the server
const MESSAGE_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvDoc {
    #[serde(rename = "_id")]
    key: String,
    value: String,
    #[serde(default)]
    expires_at: Option<DateTime>,
}

impl KvDoc {
    fn is_live(&self, now: DateTime) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageDoc {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    id: Option<ObjectId>,
    channel: String,
    message: String,
    created_at: DateTime,
}

#[derive(Clone)]
struct Collections {
    kv: Collection<KvDoc>,
    messages: Collection<MessageDoc>,
}

pub struct MongoBackend {
    uri: String,
    db_name: String,
    poll_interval: Duration,
    collections: RwLock<Option<Collections>>,
}

impl MongoBackend {
    pub fn new(uri: &str, db_name: &str) -> Self {
        Self {
            uri: uri.to_string(),
            db_name: db_name.to_string(),
            poll_interval: Duration::from_millis(200),
            collections: RwLock::new(None),
        }
    }

    async fn collections(&self) -> BackendResult<Collections> {
        self.collections
            .read()
            .await
            .clone()
            .ok_or_else(|| BackendError::Unavailable("MongoDB backend not connected".into()))
    }
}

fn unavailable(context: &str, e: impl std::fmt::Display) -> BackendError {
    BackendError::Unavailable(format!("MongoDB {}: {}", context, e))
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == DUPLICATE_KEY
    )
}

fn expires_at(ttl: Option<Duration>) -> Option<DateTime> {
    ttl.map(|t| DateTime::from_millis(DateTime::now().timestamp_millis() + t.as_millis() as i64))
}

/// Escape regex metacharacters in a literal prefix
pub(crate) fn regex_escape(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if "\\^$.|?*+()[]{}".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Add `serverSelectionTimeoutMS` so an unreachable server fails fast
pub(crate) fn with_timeouts(uri: &str) -> String {
    let has_path = uri
        .split_once("://")
        .map_or(false, |(_, rest)| rest.contains('/'));
    let sep = if uri.contains('?') {
        "&"
    } else if has_path {
        "?"
    } else {
        "/?"
    };
    format!("{}{}serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri, sep)
}

#[async_trait]
impl StateBackend for MongoBackend {
    fn name(&self) -> &'static str {
        "mongo"
    }

    async fn connect(&self) -> BackendResult<()> {
        info!("Connecting to MongoDB at {}", self.uri);

        let client = Client::with_uri_str(&with_timeouts(&self.uri))
            .await
            .map_err(|e| unavailable("connect", e))?;
        let db = client.database(&self.db_name);
        db.run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| unavailable("ping", e))?;

        let kv = db.collection::<KvDoc>("kv");
        kv.create_index(
            IndexModel::builder()
                .keys(doc! { "expires_at": 1 })
                .options(IndexOptions::builder().expire_after(Duration::ZERO).build())
                .build(),
        )
        .await
        .map_err(|e| unavailable("create kv index", e))?;

        let messages = db.collection::<MessageDoc>("messages");
        messages
            .create_indexes(vec![
                IndexModel::builder()
                    .keys(doc! { "created_at": 1 })
                    .options(IndexOptions::builder().expire_after(MESSAGE_RETENTION).build())
                    .build(),
                IndexModel::builder().keys(doc! { "channel": 1, "_id": 1 }).build(),
            ])
            .await
            .map_err(|e| unavailable("create message indexes", e))?;

        info!(db = %self.db_name, "Connected to MongoDB");
        *self.collections.write().await = Some(Collections { kv, messages });
        Ok(())
    }

    async fn disconnect(&self) -> BackendResult<()> {
        self.collections.write().await.take();
        Ok(())
    }

    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        let cols = self.collections().await?;
        let found = cols
            .kv
            .find_one(doc! { "_id": key })
            .await
            .map_err(|e| unavailable("find", e))?;
        let now = DateTime::now();
        Ok(found.filter(|d| d.is_live(now)).map(|d| d.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> BackendResult<()> {
        validate_key(key)?;
        let cols = self.collections().await?;
        let document = KvDoc {
            key: key.to_string(),
            value: value.to_string(),
            expires_at: expires_at(ttl),
        };
        cols.kv
            .replace_one(doc! { "_id": key }, document)
            .upsert(true)
            .await
            .map_err(|e| unavailable("replace", e))?;
        Ok(())
    }

    async fn set_if_not_exists(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> BackendResult<bool> {
        validate_key(key)?;
        let cols = self.collections().await?;

        // Clear an expired holder the TTL monitor has not reaped yet
        cols.kv
            .delete_one(doc! { "_id": key, "expires_at": { "$lte": DateTime::now() } })
            .await
            .map_err(|e| unavailable("delete expired", e))?;

        let document = KvDoc {
            key: key.to_string(),
            value: value.to_string(),
            expires_at: expires_at(ttl),
        };
        match cols.kv.insert_one(document).await {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key(&e) => Ok(false),
            Err(e) => Err(unavailable("insert", e)),
        }
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        let cols = self.collections().await?;
        let result = cols
            .kv
            .delete_one(doc! {
                "_id": key,
                "$or": [ { "expires_at": null }, { "expires_at": { "$gt": DateTime::now() } } ],
            })
            .await
            .map_err(|e| unavailable("delete", e))?;
        if result.deleted_count == 0 {
            // Remove an expired leftover without reporting it
            cols.kv
                .delete_one(doc! { "_id": key })
                .await
                .map_err(|e| unavailable("delete", e))?;
        }
        Ok(result.deleted_count > 0)
    }

    async fn keys(&self, pattern: &str) -> BackendResult<Vec<String>> {
        let matcher = compile_pattern(pattern)?;
        let cols = self.collections().await?;
        let filter = doc! {
            "_id": { "$regex": format!("^{}", regex_escape(pattern_prefix(pattern))) },
            "$or": [ { "expires_at": null }, { "expires_at": { "$gt": DateTime::now() } } ],
        };
        let docs: Vec<KvDoc> = cols
            .kv
            .find(filter)
            .await
            .map_err(|e| unavailable("find", e))?
            .try_collect()
            .await
            .map_err(|e| unavailable("cursor", e))?;

        let mut keys: Vec<String> = docs
            .into_iter()
            .map(|d| d.key)
            .filter(|k| matcher.matches(k))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, message: &str) -> BackendResult<()> {
        let cols = self.collections().await?;
        cols.messages
            .insert_one(MessageDoc {
                id: None,
                channel: channel.to_string(),
                message: message.to_string(),
                created_at: DateTime::now(),
            })
            .await
            .map_err(|e| unavailable("publish", e))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BackendResult<Subscription> {
        let cols = self.collections().await?;
        let (tx, rx) = mpsc::channel(256);
        let channel = channel.to_string();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            // ObjectIds are time-ordered; only messages after subscription are delivered
            let mut last_seen = ObjectId::new();
            loop {
                if tx.is_closed() {
                    debug!(channel = %channel, "Channel subscriber dropped");
                    return;
                }
                let cursor = cols
                    .messages
                    .find(doc! { "channel": channel.clone(), "_id": { "$gt": last_seen } })
                    .sort(doc! { "_id": 1 })
                    .await;
                match cursor {
                    Ok(mut cursor) => {
                        while let Some(next) = cursor.next().await {
                            match next {
                                Ok(msg) => {
                                    if let Some(id) = msg.id {
                                        last_seen = id;
                                    }
                                    if tx.send(msg.message).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    warn!(channel = %channel, error = %e, "Error reading message");
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => warn!(channel = %channel, error = %e, "Message poll failed"),
                }
                tokio::time::sleep(poll_interval).await;
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regex_escape() {
        assert_eq!(regex_escape("work:"), "work:");
        assert_eq!(regex_escape("a.b(c)"), "a\\.b\\(c\\)");
    }

    #[test]
    fn test_with_timeouts() {
        assert_eq!(
            with_timeouts("mongodb://localhost:27017"),
            "mongodb://localhost:27017/?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000"
        );
        assert!(with_timeouts("mongodb://localhost:27017/buildnet").starts_with("mongodb://localhost:27017/buildnet?"));
        assert!(with_timeouts("mongodb://h/?replicaSet=rs0").contains("rs0&serverSelection"));
    }

    #[test]
    fn test_kv_doc_expiry() {
        let now = DateTime::now();
        let doc = KvDoc {
            key: "k".into(),
            value: "v".into(),
            expires_at: Some(DateTime::from_millis(now.timestamp_millis() - 10)),
        };
        assert!(!doc.is_live(now));
        let forever = KvDoc { expires_at: None, ..doc };
        assert!(forever.is_live(now));
    }

    #[tokio::test]
    async fn test_not_connected_is_unavailable() {
        let backend = MongoBackend::new("mongodb://127.0.0.1:27017", "buildnet");
        assert!(backend.keys("*").await.unwrap_err().is_retryable());
    }
}
