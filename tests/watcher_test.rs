//! Watcher pipeline: live notify events through to affected packages

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

use buildnet::config::{Config, WatcherConfig};
use buildnet::model::{FileChangeEvent, FileChangeKind};
use buildnet::watcher::{ChangeBatch, DebounceBuffer, FileWatcher, ImpactTier, Preparer};

const PACKAGES: &str = r#"
[[packages]]
name = "shared"
path = "packages/shared"

[[packages]]
name = "app"
path = "packages/app"
dependencies = ["shared"]

[[packages]]
name = "admin"
path = "packages/admin"
dependencies = ["shared"]

[[packages]]
name = "docs-site"
path = "apps/docs-site"
"#;

fn config() -> Config {
    toml::from_str(PACKAGES).unwrap()
}

fn change(path: &str) -> FileChangeEvent {
    FileChangeEvent {
        path: PathBuf::from(path),
        kind: FileChangeKind::Change,
        timestamp: Utc::now(),
        size: Some(10),
    }
}

async fn next_batch_with(rx: &mut mpsc::Receiver<ChangeBatch>, path: &str) -> ChangeBatch {
    let wanted = Path::new(path);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let batch = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("no batch containing {}", path))
            .expect("watcher channel closed");
        if batch.paths.iter().any(|p| p == wanted) {
            return batch;
        }
    }
}

#[test]
fn test_preparer_expands_shared_changes_to_dependents() {
    let config = config();
    let preparer = Preparer::new(&config.packages);

    let prep = preparer.prepare(Path::new("packages/shared/src/util.ts"), ImpactTier::PackageRebuild);
    assert_eq!(prep.affected_packages, vec!["admin", "app", "shared"]);

    let prep = preparer.prepare(Path::new("packages/app/src/main.ts"), ImpactTier::Incremental);
    assert_eq!(prep.affected_packages, vec!["app"]);

    let prep = preparer.prepare(Path::new("scripts/release.sh"), ImpactTier::Incremental);
    assert!(prep.affected_packages.is_empty());
    assert_eq!(prep.estimated_workers, 0);
}

#[test]
fn test_worker_estimate_bounded_by_idle_workers() {
    let config = config();
    let preparer = Preparer::new(&config.packages);
    preparer.set_idle_workers(2);

    let prep = preparer.prepare(Path::new("package.json"), ImpactTier::FullRebuild);
    assert_eq!(prep.affected_packages.len(), 4);
    assert_eq!(prep.estimated_workers, 2);
}

#[test]
fn test_cache_hits_and_clear() {
    let config = config();
    let preparer = Preparer::new(&config.packages);
    let path = Path::new("packages/admin/src/page.tsx");

    assert!(preparer.lookup(path, ImpactTier::Incremental).is_none());
    preparer.prepare(path, ImpactTier::Incremental);
    assert!(preparer.lookup(path, ImpactTier::Incremental).is_some());
    // A different tier for the same path is not a hit
    assert!(preparer.lookup(path, ImpactTier::FullRebuild).is_none());

    let stats = preparer.stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);

    assert_eq!(preparer.clear(), 1);
    let stats = preparer.stats();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.hits + stats.misses, 0);
}

#[tokio::test]
async fn test_ingest_batches_to_max_impact() {
    let config = config();
    let preparer = Arc::new(Preparer::new(&config.packages));
    let watcher = assert_ok!(FileWatcher::new(
        "/srv/monorepo",
        WatcherConfig::default(),
        Some(preparer.clone()),
    ));

    let window = Duration::from_millis(50);
    let mut buffer = DebounceBuffer::new(window);
    let start = Instant::now();
    watcher.ingest(&mut buffer, change("packages/app/src/app.css"), start);
    watcher.ingest(&mut buffer, change("packages/app/src/main.ts"), start);
    watcher.ingest(&mut buffer, change("packages/app/src/main.ts"), start + Duration::from_millis(10));
    assert!(!buffer.is_due(start + Duration::from_millis(30)));
    assert!(buffer.is_due(start + Duration::from_millis(60)));

    let batch = buffer.take().unwrap();
    assert_eq!(batch.impact, ImpactTier::Incremental);
    assert_eq!(batch.paths.len(), 2);
    assert_eq!(batch.events.len(), 3);
    assert!(buffer.is_empty());

    let affected = preparer.affected_for_batch(&batch);
    assert_eq!(affected, vec!["app"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_live_changes_are_batched_and_classified() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    std::fs::create_dir_all(root.join("packages/app/src")).unwrap();
    std::fs::create_dir_all(root.join("node_modules/left-pad")).unwrap();

    let watcher_config = WatcherConfig {
        debounce_ms: 100,
        preemptive: false,
        ..WatcherConfig::default()
    };
    let watcher = assert_ok!(FileWatcher::new(&root, watcher_config, None));
    let (tx, mut rx) = mpsc::channel(16);
    let handle = assert_ok!(watcher.start(tx));
    // Let the OS watch settle
    tokio::time::sleep(Duration::from_millis(100)).await;

    std::fs::write(root.join("node_modules/left-pad/index.js"), "module.exports = 1").unwrap();
    std::fs::write(root.join("packages/app/src/index.ts"), "export const x = 1;").unwrap();
    let batch = next_batch_with(&mut rx, "packages/app/src/index.ts").await;
    assert_eq!(batch.impact, ImpactTier::Incremental);
    assert!(batch
        .paths
        .iter()
        .all(|p| !p.starts_with("node_modules")));

    std::fs::write(root.join("package.json"), "{}").unwrap();
    let batch = next_batch_with(&mut rx, "package.json").await;
    assert_eq!(batch.impact, ImpactTier::FullRebuild);

    handle.stop().await;
}
