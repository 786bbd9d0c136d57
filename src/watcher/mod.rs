//! Source tree watcher
//!
//! ```text
//! notify ──► filter (include/exclude) ──► classify ──► DebounceBuffer ──► ChangeBatch
//!                                            │
//!                                            └──► Preparer (best-effort, cached)
//! ```
//!
//! One [`ChangeBatch`] is emitted per debounce window, carrying every path
//! seen and the maximum impact among them.

pub mod impact;
pub mod prepare;

use chrono::{DateTime, Utc};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WatcherConfig;
use crate::error::{BuildNetError, Result};
use crate::model::{FileChangeEvent, FileChangeKind};

pub use impact::{ImpactClassifier, ImpactTier};
pub use prepare::{CacheStats, Preparation, Preparer};

/// Everything observed during one debounce window
#[derive(Debug, Clone, Serialize)]
pub struct ChangeBatch {
    pub paths: Vec<PathBuf>,
    pub impact: ImpactTier,
    /// Highest impact seen per path
    pub classified: Vec<(PathBuf, ImpactTier)>,
    pub events: Vec<FileChangeEvent>,
    pub detected_at: DateTime<Utc>,
}

// ============================================================================
// Filtering
// ============================================================================

#[derive(Debug, Clone)]
pub struct PathFilter {
    include: Vec<glob::Pattern>,
    exclude: Vec<glob::Pattern>,
}

impl PathFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<glob::Pattern>> {
            patterns
                .iter()
                .map(|p| {
                    glob::Pattern::new(p)
                        .map_err(|e| BuildNetError::Config(format!("bad glob '{}': {}", p, e)))
                })
                .collect()
        };
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// Paths are relative to the project root
    pub fn accepts(&self, path: &Path) -> bool {
        let options = glob::MatchOptions {
            case_sensitive: true,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };
        // `**/x/**` should also match a top-level `x/...`
        let rooted = Path::new("_").join(path);
        let matches = |p: &glob::Pattern| {
            p.matches_path_with(path, options) || p.matches_path_with(&rooted, options)
        };
        if self.exclude.iter().any(matches) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(matches)
    }
}

// ============================================================================
// Debounce
// ============================================================================

/// Pure debounce state; the clock is passed in
#[derive(Debug)]
pub struct DebounceBuffer {
    window: Duration,
    max_wait: Duration,
    classified: BTreeMap<PathBuf, ImpactTier>,
    events: Vec<FileChangeEvent>,
    max_impact: Option<ImpactTier>,
    first_at: Option<Instant>,
    last_at: Option<Instant>,
}

impl DebounceBuffer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            max_wait: window * 10,
            classified: BTreeMap::new(),
            events: Vec::new(),
            max_impact: None,
            first_at: None,
            last_at: None,
        }
    }

    pub fn push(&mut self, event: FileChangeEvent, impact: ImpactTier, now: Instant) {
        let slot = self
            .classified
            .entry(event.path.clone())
            .or_insert(impact);
        *slot = (*slot).max(impact);
        self.max_impact = Some(self.max_impact.map_or(impact, |m| m.max(impact)));
        self.events.push(event);
        self.first_at.get_or_insert(now);
        self.last_at = Some(now);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Quiet for a full window, or held too long under constant churn
    pub fn is_due(&self, now: Instant) -> bool {
        match (self.first_at, self.last_at) {
            (Some(first), Some(last)) => {
                now.duration_since(last) >= self.window || now.duration_since(first) >= self.max_wait
            }
            _ => false,
        }
    }

    pub fn take(&mut self) -> Option<ChangeBatch> {
        let impact = self.max_impact.take()?;
        let classified: Vec<(PathBuf, ImpactTier)> = std::mem::take(&mut self.classified).into_iter().collect();
        self.first_at = None;
        self.last_at = None;
        Some(ChangeBatch {
            paths: classified.iter().map(|(p, _)| p.clone()).collect(),
            impact,
            classified,
            events: std::mem::take(&mut self.events),
            detected_at: Utc::now(),
        })
    }
}

// ============================================================================
// Watcher
// ============================================================================

pub struct FileWatcher {
    root: PathBuf,
    config: WatcherConfig,
    filter: PathFilter,
    classifier: ImpactClassifier,
    preparer: Option<Arc<Preparer>>,
}

/// Running watcher; dropping it without `stop` leaves the task running
pub struct WatcherHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}

impl FileWatcher {
    pub fn new(root: impl Into<PathBuf>, config: WatcherConfig, preparer: Option<Arc<Preparer>>) -> Result<Self> {
        let filter = PathFilter::new(&config.include, &config.exclude)?;
        let classifier = ImpactClassifier::new(&config.shared_paths);
        let preparer = if config.preemptive { preparer } else { None };
        Ok(Self {
            root: root.into(),
            config,
            filter,
            classifier,
            preparer,
        })
    }

    /// Turn a raw notify event into filtered, relative change events
    pub async fn convert(&self, event: notify::Event) -> Vec<FileChangeEvent> {
        let kind = match event.kind {
            EventKind::Create(_) => FileChangeKind::Add,
            EventKind::Modify(_) => FileChangeKind::Change,
            EventKind::Remove(_) => FileChangeKind::Unlink,
            _ => return Vec::new(),
        };
        let mut changes = Vec::with_capacity(event.paths.len());
        for abs in event.paths {
            let Ok(relative) = abs.strip_prefix(&self.root).map(Path::to_path_buf) else {
                continue;
            };
            if relative.as_os_str().is_empty() || !self.filter.accepts(&relative) {
                continue;
            }
            let size = match kind {
                FileChangeKind::Unlink => None,
                _ => tokio::fs::metadata(&abs)
                    .await
                    .ok()
                    .filter(|m| m.is_file())
                    .map(|m| m.len()),
            };
            // Directory events carry no build signal
            if kind != FileChangeKind::Unlink && size.is_none() {
                continue;
            }
            changes.push(FileChangeEvent {
                path: relative,
                kind,
                timestamp: Utc::now(),
                size,
            });
        }
        changes
    }

    /// Classify and buffer one event, kicking off preparation
    pub fn ingest(&self, buffer: &mut DebounceBuffer, event: FileChangeEvent, now: Instant) -> ImpactTier {
        let impact = self.classifier.classify(&event.path);
        debug!(path = %event.path.display(), ?impact, "File change");
        if impact > ImpactTier::Ignored {
            if let Some(preparer) = &self.preparer {
                let preparer = preparer.clone();
                let path = event.path.clone();
                tokio::spawn(async move {
                    preparer.prepare(&path, impact);
                });
            }
        }
        buffer.push(event, impact, now);
        impact
    }

    /// Start watching; batches are sent on `tx`
    pub fn start(self, tx: mpsc::Sender<ChangeBatch>) -> Result<WatcherHandle> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = raw_tx.send(res);
        })?;

        for path in &self.config.paths {
            let dir = if path == Path::new(".") {
                self.root.clone()
            } else {
                self.root.join(path)
            };
            watcher.watch(&dir, RecursiveMode::Recursive)?;
            info!(path = %dir.display(), "Watching");
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let window = Duration::from_millis(self.config.debounce_ms.max(1));
        let tick = (window / 2).max(Duration::from_millis(5));

        let task = tokio::spawn(async move {
            // Keeps the OS watch alive for the task's lifetime
            let _watcher = watcher;
            let mut buffer = DebounceBuffer::new(window);
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    Some(res) = raw_rx.recv() => match res {
                        Ok(event) => {
                            for change in self.convert(event).await {
                                self.ingest(&mut buffer, change, Instant::now());
                            }
                        }
                        Err(e) => warn!(error = %e, "Watch error"),
                    },
                    _ = interval.tick() => {
                        if buffer.is_due(Instant::now()) {
                            if let Some(batch) = buffer.take() {
                                info!(
                                    paths = batch.paths.len(),
                                    impact = %batch.impact,
                                    "Changes detected"
                                );
                                if tx.send(batch).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("File watcher stopping");
                        break;
                    }
                }
            }
        });

        Ok(WatcherHandle { shutdown_tx, task })
    }
}
