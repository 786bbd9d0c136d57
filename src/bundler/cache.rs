//! Content-addressed artifact cache
//!
//! ```text
//!   key = sha256(package, mode, entry, source tree hash)
//!
//!   <root>/<package>/<key>/meta.json
//!                         /files/...     copy of the output directory
//! ```
//!
//! Before a unit builds, its key is looked up: if the output directory still
//! hashes to the stored output hash the build is skipped outright, otherwise
//! a cached copy is restored. Entries are written to a temporary directory
//! and renamed into place, so concurrent stores of the same key are harmless.
//! Everything here is blocking filesystem work; async callers go through
//! `spawn_blocking`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use super::adapter::BuildContext;
use super::command::{hash_tree, hash_tree_excluding};
use crate::config::Config;
use crate::error::Result;
use crate::model::CacheTier;

const META_FILE: &str = "meta.json";
const FILES_DIR: &str = "files";

/// Directories never part of a package's source hash
const SOURCE_EXCLUDES: &[&str] = &["node_modules", ".git", ".buildnet", "target"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub package: String,
    pub key: String,
    pub output_hash: String,
    pub size: u64,
    pub file_count: usize,
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_used_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
    pub tier: CacheTier,
    pub output_hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactStats {
    pub dir: PathBuf,
    pub artifacts: usize,
    pub total_size: u64,
    pub max_size: u64,
    pub skips: u64,
    pub restores: u64,
    pub misses: u64,
    pub stores: u64,
}

pub struct ArtifactCache {
    root: PathBuf,
    /// Bytes; 0 disables eviction
    max_size: u64,
    skips: AtomicU64,
    restores: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>, max_size: u64) -> Self {
        Self {
            root: root.into(),
            max_size,
            skips: AtomicU64::new(0),
            restores: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
        }
    }

    /// The configured node-local cache, `None` when disabled
    pub fn from_config(config: &Config) -> Option<Self> {
        config
            .cache
            .enabled
            .then(|| Self::new(config.cache_dir(), config.cache.max_size_mb * 1024 * 1024))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cache key for a unit, `None` when the package directory is unreadable
    pub fn source_key(ctx: &BuildContext) -> Option<String> {
        let sources = hash_tree_excluding(&ctx.package_dir, |dir| {
            dir == ctx.output_dir.as_path()
                || dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| SOURCE_EXCLUDES.contains(&n))
        })?;
        let mut hasher = Sha256::new();
        for part in [
            ctx.package.as_str(),
            mode_tag(ctx),
            ctx.entry.as_str(),
            sources.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        Some(hex::encode(hasher.finalize()))
    }

    fn entry_dir(&self, package: &str, key: &str) -> PathBuf {
        self.root
            .join(urlencoding::encode(package).into_owned())
            .join(key)
    }

    fn read_meta(dir: &Path) -> Option<ArtifactMeta> {
        let raw = std::fs::read(dir.join(META_FILE)).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    fn write_meta(dir: &Path, meta: &ArtifactMeta) -> Result<()> {
        std::fs::write(dir.join(META_FILE), serde_json::to_vec_pretty(meta)?)?;
        Ok(())
    }

    /// Best-effort LRU bookkeeping
    fn touch(dir: &Path, mut meta: ArtifactMeta) {
        meta.last_used_at = Utc::now();
        if let Err(e) = Self::write_meta(dir, &meta) {
            debug!(error = %e, "Could not update artifact access time");
        }
    }

    /// Skip or restore the unit's output if its sources are cached
    pub fn lookup(&self, ctx: &BuildContext, key: &str) -> Result<Option<CacheHit>> {
        let dir = self.entry_dir(&ctx.package, key);
        let Some(meta) = Self::read_meta(&dir) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        if hash_tree(&ctx.output_dir).as_deref() == Some(meta.output_hash.as_str()) {
            self.skips.fetch_add(1, Ordering::Relaxed);
            debug!(package = %ctx.package, key = %short(key), "Output current, skipping build");
            let output_hash = meta.output_hash.clone();
            Self::touch(&dir, meta);
            return Ok(Some(CacheHit {
                tier: CacheTier::InstantSkip,
                output_hash,
            }));
        }

        let files = dir.join(FILES_DIR);
        if !files.is_dir() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        match std::fs::remove_dir_all(&ctx.output_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        copy_tree(&files, &ctx.output_dir)?;

        if hash_tree(&ctx.output_dir).as_deref() != Some(meta.output_hash.as_str()) {
            warn!(package = %ctx.package, key = %short(key), "Cached artifact corrupt, discarding");
            let _ = std::fs::remove_dir_all(&dir);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        self.restores.fetch_add(1, Ordering::Relaxed);
        info!(package = %ctx.package, key = %short(key), size = meta.size, "Restored output from cache");
        let output_hash = meta.output_hash.clone();
        Self::touch(&dir, meta);
        Ok(Some(CacheHit {
            tier: CacheTier::CacheRestore,
            output_hash,
        }))
    }

    /// Copy a fresh output directory into the cache. Returns false when
    /// there is nothing to store or the key is already cached.
    pub fn store(&self, ctx: &BuildContext, key: &str) -> Result<bool> {
        let Some(output_hash) = hash_tree(&ctx.output_dir) else {
            return Ok(false);
        };
        let dir = self.entry_dir(&ctx.package, key);
        if let Some(meta) = Self::read_meta(&dir) {
            Self::touch(&dir, meta);
            return Ok(false);
        }
        let parent = dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        std::fs::create_dir_all(&parent)?;

        let staging = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        let (size, file_count) = copy_tree(&ctx.output_dir, &staging.join(FILES_DIR))?;
        let now = Utc::now();
        let meta = ArtifactMeta {
            package: ctx.package.clone(),
            key: key.to_string(),
            output_hash,
            size,
            file_count,
            created_at: now,
            last_used_at: now,
        };
        Self::write_meta(&staging, &meta)?;

        if let Err(e) = std::fs::rename(&staging, &dir) {
            // another store of the same key won
            let _ = std::fs::remove_dir_all(&staging);
            debug!(package = %ctx.package, error = %e, "Artifact already stored");
            return Ok(false);
        }
        self.stores.fetch_add(1, Ordering::Relaxed);
        info!(package = %ctx.package, key = %short(key), size, files = file_count, "Stored artifact");

        if self.max_size > 0 {
            self.clean(self.max_size)?;
        }
        Ok(true)
    }

    fn entries(&self) -> Vec<(PathBuf, ArtifactMeta)> {
        let mut entries = Vec::new();
        let Ok(packages) = std::fs::read_dir(&self.root) else {
            return entries;
        };
        for package in packages.flatten() {
            let Ok(keys) = std::fs::read_dir(package.path()) else {
                continue;
            };
            for entry in keys.flatten() {
                if entry.file_name().to_string_lossy().starts_with(".tmp-") {
                    continue;
                }
                let path = entry.path();
                if let Some(meta) = Self::read_meta(&path) {
                    entries.push((path, meta));
                }
            }
        }
        entries
    }

    /// Evict least recently used artifacts until the cache fits `max_size` bytes
    pub fn clean(&self, max_size: u64) -> Result<usize> {
        let mut entries = self.entries();
        let mut total: u64 = entries.iter().map(|(_, m)| m.size).sum();
        if total <= max_size {
            return Ok(0);
        }
        entries.sort_by(|a, b| a.1.last_used_at.cmp(&b.1.last_used_at));

        let mut removed = 0;
        for (path, meta) in entries {
            if total <= max_size {
                break;
            }
            std::fs::remove_dir_all(&path)?;
            total = total.saturating_sub(meta.size);
            removed += 1;
            debug!(package = %meta.package, key = %short(&meta.key), size = meta.size, "Evicted artifact");
        }
        if removed > 0 {
            info!(removed, remaining_bytes = total, "Artifact cache trimmed");
        }
        Ok(removed)
    }

    /// Remove every artifact, returning how many there were
    pub fn clear(&self) -> Result<usize> {
        let count = self.entries().len();
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(count)
    }

    pub fn stats(&self) -> ArtifactStats {
        let entries = self.entries();
        ArtifactStats {
            dir: self.root.clone(),
            artifacts: entries.len(),
            total_size: entries.iter().map(|(_, m)| m.size).sum(),
            max_size: self.max_size,
            skips: self.skips.load(Ordering::Relaxed),
            restores: self.restores.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
        }
    }
}

fn mode_tag(ctx: &BuildContext) -> &'static str {
    match ctx.mode {
        crate::model::BuildMode::Development => "development",
        crate::model::BuildMode::Production => "production",
    }
}

fn short(key: &str) -> &str {
    &key[..key.len().min(12)]
}

/// Recursive copy; returns (bytes, files)
fn copy_tree(from: &Path, to: &Path) -> Result<(u64, usize)> {
    let mut bytes = 0;
    let mut files = 0;
    let mut stack = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((src, dst)) = stack.pop() {
        std::fs::create_dir_all(&dst)?;
        for entry in std::fs::read_dir(&src)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let target = dst.join(entry.file_name());
            if file_type.is_dir() {
                stack.push((entry.path(), target));
            } else if file_type.is_file() {
                bytes += std::fs::copy(entry.path(), &target)?;
                files += 1;
            }
        }
    }
    Ok((bytes, files))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BuildMode;
    use std::time::Duration;

    fn ctx(root: &Path, package: &str) -> BuildContext {
        let package_dir = root.join("packages").join(package);
        BuildContext {
            package: package.into(),
            project_root: root.to_path_buf(),
            output_dir: package_dir.join("dist"),
            package_dir,
            entry: "src/index.ts".into(),
            mode: BuildMode::Production,
            timeout: Duration::from_secs(10),
        }
    }

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn built(ctx: &BuildContext, bundle: &str) {
        write(&ctx.output_dir.join("index.js"), bundle);
        write(&ctx.output_dir.join("assets/app.css"), "body{}");
    }

    fn setup() -> (tempfile::TempDir, BuildContext, ArtifactCache) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path(), "app");
        write(&ctx.package_dir.join("src/index.ts"), "export const a = 1;");
        let cache = ArtifactCache::new(dir.path().join(".buildnet/cache"), 0);
        (dir, ctx, cache)
    }

    #[test]
    fn test_source_key_ignores_output_and_node_modules() {
        let (_dir, ctx, _) = setup();
        let before = ArtifactCache::source_key(&ctx).unwrap();

        built(&ctx, "console.log(1)");
        write(&ctx.package_dir.join("node_modules/dep/index.js"), "x");
        assert_eq!(ArtifactCache::source_key(&ctx).unwrap(), before);

        write(&ctx.package_dir.join("src/index.ts"), "export const a = 2;");
        assert_ne!(ArtifactCache::source_key(&ctx).unwrap(), before);

        let mut dev = ctx.clone();
        dev.mode = BuildMode::Development;
        assert_ne!(ArtifactCache::source_key(&dev), ArtifactCache::source_key(&ctx));
    }

    #[test]
    fn test_skip_then_restore() {
        let (_dir, ctx, cache) = setup();
        let key = ArtifactCache::source_key(&ctx).unwrap();
        assert_eq!(cache.lookup(&ctx, &key).unwrap(), None);

        built(&ctx, "console.log(1)");
        assert!(cache.store(&ctx, &key).unwrap());
        // same key again is a no-op
        assert!(!cache.store(&ctx, &key).unwrap());

        let hit = cache.lookup(&ctx, &key).unwrap().unwrap();
        assert_eq!(hit.tier, CacheTier::InstantSkip);
        assert_eq!(Some(hit.output_hash.clone()), hash_tree(&ctx.output_dir));

        std::fs::remove_dir_all(&ctx.output_dir).unwrap();
        let restored = cache.lookup(&ctx, &key).unwrap().unwrap();
        assert_eq!(restored.tier, CacheTier::CacheRestore);
        assert_eq!(
            std::fs::read_to_string(ctx.output_dir.join("index.js")).unwrap(),
            "console.log(1)"
        );
        assert!(ctx.output_dir.join("assets/app.css").is_file());

        let stats = cache.stats();
        assert_eq!((stats.artifacts, stats.skips, stats.restores, stats.misses), (1, 1, 1, 1));
        assert_eq!(stats.stores, 1);
    }

    #[test]
    fn test_tampered_output_is_restored() {
        let (_dir, ctx, cache) = setup();
        let key = ArtifactCache::source_key(&ctx).unwrap();
        built(&ctx, "console.log(1)");
        cache.store(&ctx, &key).unwrap();

        write(&ctx.output_dir.join("index.js"), "edited by hand");
        let hit = cache.lookup(&ctx, &key).unwrap().unwrap();
        assert_eq!(hit.tier, CacheTier::CacheRestore);
        assert_eq!(
            std::fs::read_to_string(ctx.output_dir.join("index.js")).unwrap(),
            "console.log(1)"
        );
    }

    #[test]
    fn test_clean_evicts_least_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path().join("cache"), 0);
        let mut keys = Vec::new();
        for name in ["old", "mid", "new"] {
            let ctx = ctx(dir.path(), name);
            write(&ctx.package_dir.join("src/index.ts"), name);
            built(&ctx, &"x".repeat(100));
            let key = ArtifactCache::source_key(&ctx).unwrap();
            cache.store(&ctx, &key).unwrap();
            keys.push((ctx, key));
            std::thread::sleep(Duration::from_millis(5));
        }
        // "old" was used most recently
        let (old_ctx, old_key) = &keys[0];
        cache.lookup(old_ctx, old_key).unwrap();

        let per_artifact = cache.stats().total_size / 3;
        assert_eq!(cache.clean(per_artifact * 2).unwrap(), 1);
        let left: Vec<String> = cache.entries().into_iter().map(|(_, m)| m.package).collect();
        assert!(!left.contains(&"mid".to_string()));
        assert_eq!(left.len(), 2);
        assert_eq!(cache.clean(u64::MAX).unwrap(), 0);
    }

    #[test]
    fn test_clear_removes_everything() {
        let (_dir, ctx, cache) = setup();
        let key = ArtifactCache::source_key(&ctx).unwrap();
        built(&ctx, "console.log(1)");
        cache.store(&ctx, &key).unwrap();

        assert_eq!(cache.clear().unwrap(), 1);
        assert_eq!(cache.stats().artifacts, 0);
        assert_eq!(cache.clear().unwrap(), 0);
        assert_eq!(cache.lookup(&ctx, &key).unwrap(), None);
    }
}
