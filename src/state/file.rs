//! File-system backend
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/keys/<url-encoded key>.json      {key, value, expires_at_ms}
//! <root>/locks/<url-encoded key>.lock     held for the duration of a mutation
//! <root>/channels/<url-encoded name>.log  one JSON string per line
//! ```
//!
//! Writes go to a temp file and are renamed into place, so readers never
//! see a partial value. Mutations of a key are serialized through its lock
//! file (`create_new`), which is what makes `set_if_not_exists` atomic
//! across processes sharing the directory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use futures::StreamExt;
use tracing::{debug, warn};

use super::{
    compile_pattern, expiry_ms, now_ms, pattern_prefix, validate_key, BackendResult,
    StateBackend, Subscription,
};
use crate::error::BackendError;

const KEY_SUFFIX: &str = ".json";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    key: String,
    value: String,
    #[serde(default)]
    expires_at_ms: Option<i64>,
}

impl Envelope {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at_ms.map_or(true, |at| at > now)
    }
}

/// Removes the lock file when dropped
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to release lock file");
            }
        }
    }
}

pub struct FileBackend {
    root: PathBuf,
    /// Locks older than this are assumed abandoned by a dead process
    lock_stale_after: Duration,
    lock_wait: Duration,
    poll_interval: Duration,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_stale_after: Duration::from_secs(10),
            lock_wait: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn keys_dir(&self) -> PathBuf {
        self.root.join("keys")
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.keys_dir()
            .join(format!("{}{}", urlencoding::encode(key), KEY_SUFFIX))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.root
            .join("locks")
            .join(format!("{}.lock", urlencoding::encode(key)))
    }

    fn channel_path(&self, channel: &str) -> PathBuf {
        self.root
            .join("channels")
            .join(format!("{}.log", urlencoding::encode(channel)))
    }

    async fn lock(&self, key: &str) -> BackendResult<LockGuard> {
        let path = self.lock_path(key);
        let started = Instant::now();
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(LockGuard { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.is_stale(&path).await {
                        if self.break_stale_lock(&path).await {
                            warn!(key, "Broke stale lock file");
                        }
                        continue;
                    }
                    if started.elapsed() > self.lock_wait {
                        return Err(BackendError::Unavailable(format!(
                            "timed out waiting for lock on '{}'",
                            key
                        )));
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                Err(e) => return Err(unavailable(e)),
            }
        }
    }

    /// Move the lock aside under a unique name, then delete it only if what
    /// was moved is still stale. A fresh lock taken in the meantime by someone
    /// else is put back.
    async fn break_stale_lock(&self, path: &Path) -> bool {
        let mut tombstone = path.as_os_str().to_owned();
        tombstone.push(format!(".stale-{}", uuid::Uuid::new_v4()));
        let tombstone = PathBuf::from(tombstone);

        // someone else already moved it
        if tokio::fs::rename(path, &tombstone).await.is_err() {
            return false;
        }
        if self.is_stale(&tombstone).await {
            let _ = tokio::fs::remove_file(&tombstone).await;
            return true;
        }

        // hard_link refuses to replace a lock created since the rename
        if let Err(e) = tokio::fs::hard_link(&tombstone, path).await {
            warn!(path = %path.display(), error = %e, "Could not restore a live lock moved aside");
        }
        let _ = tokio::fs::remove_file(&tombstone).await;
        false
    }

    async fn is_stale(&self, path: &Path) -> bool {
        match tokio::fs::metadata(path).await {
            Ok(meta) => meta
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .map_or(false, |age| age > self.lock_stale_after),
            Err(_) => false,
        }
    }

    async fn read_envelope(&self, key: &str) -> BackendResult<Option<Envelope>> {
        read_envelope_at(&self.key_path(key)).await
    }

    async fn write_envelope(&self, envelope: &Envelope) -> BackendResult<()> {
        let path = self.key_path(&envelope.key);
        let tmp = self.keys_dir().join(format!(
            "{}.{}.tmp",
            urlencoding::encode(&envelope.key),
            uuid::Uuid::new_v4()
        ));
        let raw = serde_json::to_vec(envelope)?;
        tokio::fs::write(&tmp, raw).await.map_err(unavailable)?;
        tokio::fs::rename(&tmp, &path).await.map_err(unavailable)?;
        Ok(())
    }
}

async fn read_envelope_at(path: &Path) -> BackendResult<Option<Envelope>> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(unavailable(e)),
    }
}

fn unavailable(e: std::io::Error) -> BackendError {
    BackendError::Unavailable(format!("file backend: {}", e))
}

#[async_trait]
impl StateBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn connect(&self) -> BackendResult<()> {
        for dir in ["keys", "locks", "channels"] {
            tokio::fs::create_dir_all(self.root.join(dir))
                .await
                .map_err(unavailable)?;
        }
        // Prove the directory is writable
        let marker = self.root.join(".writable");
        tokio::fs::write(&marker, b"ok").await.map_err(unavailable)?;
        let _ = tokio::fs::remove_file(&marker).await;
        debug!(root = %self.root.display(), "File backend ready");
        Ok(())
    }

    async fn disconnect(&self) -> BackendResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        let now = now_ms();
        Ok(self
            .read_envelope(key)
            .await?
            .filter(|e| e.is_live(now))
            .map(|e| e.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> BackendResult<()> {
        validate_key(key)?;
        let _guard = self.lock(key).await?;
        self.write_envelope(&Envelope {
            key: key.to_string(),
            value: value.to_string(),
            expires_at_ms: expiry_ms(ttl),
        })
        .await
    }

    async fn set_if_not_exists(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> BackendResult<bool> {
        validate_key(key)?;
        let _guard = self.lock(key).await?;
        if let Some(existing) = self.read_envelope(key).await? {
            if existing.is_live(now_ms()) {
                return Ok(false);
            }
        }
        self.write_envelope(&Envelope {
            key: key.to_string(),
            value: value.to_string(),
            expires_at_ms: expiry_ms(ttl),
        })
        .await?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        let _guard = self.lock(key).await?;
        let live = self
            .read_envelope(key)
            .await?
            .map_or(false, |e| e.is_live(now_ms()));
        match tokio::fs::remove_file(self.key_path(key)).await {
            Ok(()) => Ok(live),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn keys(&self, pattern: &str) -> BackendResult<Vec<String>> {
        let matcher = compile_pattern(pattern)?;
        let encoded_prefix = urlencoding::encode(pattern_prefix(pattern)).into_owned();
        let now = now_ms();

        let mut dir = match tokio::fs::read_dir(self.keys_dir()).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(unavailable(e)),
        };

        let mut keys = Vec::new();
        while let Some(item) = dir.next_entry().await.map_err(unavailable)? {
            let file_name = item.file_name();
            let Some(name) = file_name.to_str() else { continue };
            let Some(encoded) = name.strip_suffix(KEY_SUFFIX) else { continue };
            if !encoded.starts_with(&encoded_prefix) {
                continue;
            }
            let Ok(key) = urlencoding::decode(encoded) else { continue };
            if !matcher.matches(&key) {
                continue;
            }
            // A concurrent delete between listing and reading is fine
            match read_envelope_at(&item.path()).await {
                Ok(Some(envelope)) if envelope.is_live(now) => keys.push(key.into_owned()),
                Ok(_) => {}
                Err(BackendError::Serialization(e)) => {
                    warn!(key = %key, error = %e, "Skipping unreadable key file");
                }
                Err(e) => return Err(e),
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, message: &str) -> BackendResult<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.channel_path(channel))
            .await
            .map_err(unavailable)?;
        file.write_all(line.as_bytes()).await.map_err(unavailable)?;
        file.flush().await.map_err(unavailable)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BackendResult<Subscription> {
        let path = self.channel_path(channel);
        // Start from the current end; history is not replayed
        let start = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(unavailable(e)),
        };

        let (tx, rx) = mpsc::channel(256);
        let poll_interval = self.poll_interval;
        let channel = channel.to_string();
        tokio::spawn(async move {
            tail_channel(path, start, poll_interval, tx, channel).await;
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Follow a channel log until the subscriber goes away
async fn tail_channel(
    path: PathBuf,
    mut offset: u64,
    poll_interval: Duration,
    tx: mpsc::Sender<String>,
    channel: String,
) {
    let mut pending: Vec<u8> = Vec::new();
    loop {
        if tx.is_closed() {
            debug!(channel = %channel, "Channel subscriber dropped");
            return;
        }

        let len = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        if len < offset {
            // Log was truncated or replaced
            offset = 0;
            pending.clear();
        }
        if len > offset {
            if let Ok(mut file) = tokio::fs::File::open(&path).await {
                let mut buf = Vec::new();
                if file.seek(std::io::SeekFrom::Start(offset)).await.is_ok()
                    && file.read_to_end(&mut buf).await.is_ok()
                {
                    offset += buf.len() as u64;
                    pending.extend_from_slice(&buf);
                    while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = pending.drain(..=pos).collect();
                        match serde_json::from_slice::<String>(&line[..line.len() - 1]) {
                            Ok(message) => {
                                if tx.send(message).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!(channel = %channel, error = %e, "Bad channel line"),
                        }
                    }
                }
            }
        }

        tokio::time::sleep(poll_interval).await;
    }
}
