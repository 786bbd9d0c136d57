//! Bundler manager
//!
//! Registry of interchangeable build-tool adapters behind one contract.
//!
//! ```text
//!   initialize()
//!     │  check every registered adapter (disabled ones are skipped)
//!     ├─ auto enabled? ── EnvironmentSignals ──► auto_select table
//!     └─ default ─► fallback[0] ─► fallback[1] ─► ...  first available wins
//!
//!   build(ctx) ── clone active Arc ──► adapter.build(ctx)
//!   switch_to(name) ── swap Arc (in-flight builds keep the old one)
//! ```

pub mod adapter;
pub mod cache;
pub mod command;
pub mod diagnostics;

pub use adapter::{
    AdapterKind, BuildContext, BuildFailure, BuildOutput, BundlerAdapter, OnChange, WatchEvent,
    WatchHandle,
};
pub use cache::{ArtifactCache, ArtifactStats, CacheHit};
pub use command::CommandAdapter;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::BundlerConfig;
use crate::error::{BuildError, BuildNetError, Result};
use crate::scheduler::events::{BuildEvent, EventBus};

/// Environment facts consulted by `auto_select`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSignals {
    pub ci: bool,
    pub development: bool,
    pub legacy_config: bool,
}

impl EnvironmentSignals {
    pub fn detect(project_root: &Path) -> Self {
        let ci = std::env::var("CI")
            .map(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(false);
        let development = ["BUILDNET_ENV", "NODE_ENV"]
            .iter()
            .filter_map(|k| std::env::var(k).ok())
            .any(|v| v.eq_ignore_ascii_case("development"));
        let legacy_config = ["webpack.config.js", "webpack.config.cjs", "webpack.config.mjs", "webpack.config.ts"]
            .iter()
            .any(|f| project_root.join(f).is_file());
        Self {
            ci,
            development,
            legacy_config,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AdapterStats {
    pub builds: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
    pub last_build_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterStatus {
    pub name: String,
    pub kind: AdapterKind,
    pub available: bool,
    pub disabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BundlerStatus {
    pub active: Option<String>,
    pub adapters: Vec<AdapterStatus>,
}

pub struct BundlerManager {
    config: BundlerConfig,
    project_root: PathBuf,
    adapters: Vec<Arc<dyn BundlerAdapter>>,
    active: RwLock<Option<Arc<dyn BundlerAdapter>>>,
    available: DashMap<String, bool>,
    stats: DashMap<String, AdapterStats>,
    events: Option<EventBus>,
}

impl BundlerManager {
    /// Empty registry; see [`BundlerManager::with_defaults`]
    pub fn new(config: BundlerConfig, project_root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            project_root: project_root.into(),
            adapters: Vec::new(),
            active: RwLock::new(None),
            available: DashMap::new(),
            stats: DashMap::new(),
            events: None,
        }
    }

    /// Registry with a command adapter for every known kind
    pub fn with_defaults(config: BundlerConfig, project_root: impl Into<PathBuf>) -> Self {
        let mut manager = Self::new(config, project_root);
        for kind in AdapterKind::ALL {
            let adapter = match kind {
                AdapterKind::Shell => match &manager.config.shell_command {
                    Some(cmd) => CommandAdapter::shell(cmd.clone()),
                    None => continue,
                },
                _ => match manager.config.commands.get(kind.name()) {
                    Some(program) => CommandAdapter::new(kind).with_program(program.clone()),
                    None => CommandAdapter::new(kind),
                },
            };
            manager.register(Arc::new(adapter));
        }
        manager
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Later registrations with the same name shadow earlier ones
    pub fn register(&mut self, adapter: Arc<dyn BundlerAdapter>) {
        self.adapters.retain(|a| a.name() != adapter.name());
        self.adapters.push(adapter);
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn BundlerAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    fn is_disabled(&self, name: &str) -> bool {
        self.config
            .disabled
            .iter()
            .any(|d| d.eq_ignore_ascii_case(name))
    }

    async fn check_available(&self, adapter: &Arc<dyn BundlerAdapter>) -> bool {
        if self.is_disabled(adapter.name()) {
            self.available.insert(adapter.name().to_string(), false);
            return false;
        }
        let ok = adapter.is_available(&self.project_root).await;
        self.available.insert(adapter.name().to_string(), ok);
        ok
    }

    /// Check adapters and activate the preferred available one
    pub async fn initialize(&self) -> Result<String> {
        for adapter in &self.adapters {
            let ok = self.check_available(adapter).await;
            debug!(adapter = adapter.name(), available = ok, "Checked bundler");
        }

        if self.config.auto {
            let signals = EnvironmentSignals::detect(&self.project_root);
            if let Some(name) = self.auto_select(&signals).await? {
                return Ok(name);
            }
        }

        let preferred = self.config.default.clone();
        let chain = std::iter::once(preferred.clone()).chain(self.config.fallback.iter().cloned());
        for name in chain {
            let Some(adapter) = self.find(&name) else {
                continue;
            };
            let available = self.available.get(adapter.name()).map(|v| *v).unwrap_or(false);
            if !available {
                continue;
            }
            if !name.eq_ignore_ascii_case(&preferred) {
                warn!(requested = %preferred, using = %name, "Preferred bundler unavailable, falling back");
            }
            self.activate(adapter).await;
            return Ok(name);
        }

        Err(BuildNetError::Config(format!(
            "no bundler available (tried {} and fallbacks {:?})",
            preferred, self.config.fallback
        )))
    }

    async fn activate(&self, adapter: Arc<dyn BundlerAdapter>) {
        let to = adapter.name().to_string();
        let previous = self.active.write().await.replace(adapter);
        let from = previous.map(|a| a.name().to_string());
        if from.as_deref() == Some(to.as_str()) {
            return;
        }
        info!(from = ?from, to = %to, "Bundler activated");
        if let Some(events) = &self.events {
            events.publish(BuildEvent::AdapterSwitched { from, to });
        }
    }

    /// Hot-swap the active adapter; builds already running keep theirs
    pub async fn switch_to(&self, name: &str) -> Result<()> {
        let adapter = self
            .find(name)
            .ok_or_else(|| BuildNetError::NotFound(format!("bundler {}", name)))?;
        if self.is_disabled(adapter.name()) {
            return Err(BuildNetError::BadRequest(format!("bundler {} is disabled", name)));
        }
        if !self.check_available(&adapter).await {
            return Err(BuildNetError::BadRequest(format!("bundler {} is not available", name)));
        }
        self.activate(adapter).await;
        Ok(())
    }

    /// Activate the adapter the environment calls for; precedence is ci, legacy config, development
    pub async fn auto_select(&self, signals: &EnvironmentSignals) -> Result<Option<String>> {
        let table = &self.config.auto_select;
        let wanted = [
            (signals.ci, &table.ci),
            (signals.legacy_config, &table.legacy_config),
            (signals.development, &table.development),
        ]
        .into_iter()
        .filter(|(hit, _)| *hit)
        .find_map(|(_, name)| name.clone());

        let Some(name) = wanted else {
            return Ok(None);
        };
        match self.switch_to(&name).await {
            Ok(()) => Ok(Some(name)),
            Err(e) => {
                warn!(adapter = %name, error = %e, "Auto-selected bundler cannot be used");
                Ok(None)
            }
        }
    }

    pub async fn active_name(&self) -> Option<String> {
        self.active.read().await.as_ref().map(|a| a.name().to_string())
    }

    pub async fn build(&self, ctx: &BuildContext) -> std::result::Result<BuildOutput, BuildFailure> {
        let adapter = self.active.read().await.clone();
        let Some(adapter) = adapter else {
            return Err(BuildFailure::single(
                BuildError::new(diagnostics::ADAPTER_UNAVAILABLE, "no active bundler"),
                0,
            ));
        };

        let result = adapter.build(ctx).await;
        let mut stats = self.stats.entry(adapter.name().to_string()).or_default();
        stats.builds += 1;
        stats.last_build_at = Some(Utc::now());
        match &result {
            Ok(out) => stats.total_duration_ms += out.duration_ms,
            Err(failure) => {
                stats.failures += 1;
                stats.total_duration_ms += failure.duration_ms;
            }
        }
        result
    }

    pub async fn watch(
        &self,
        ctx: &BuildContext,
        on_change: OnChange,
    ) -> std::result::Result<WatchHandle, BuildError> {
        let adapter = self.active.read().await.clone().ok_or_else(|| {
            BuildError::new(diagnostics::ADAPTER_UNAVAILABLE, "no active bundler")
        })?;
        adapter.watch(ctx, on_change).await
    }

    pub fn stats(&self) -> HashMap<String, AdapterStats> {
        self.stats
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub async fn status(&self) -> BundlerStatus {
        BundlerStatus {
            active: self.active_name().await,
            adapters: self
                .adapters
                .iter()
                .map(|a| AdapterStatus {
                    name: a.name().to_string(),
                    kind: a.kind(),
                    available: self.available.get(a.name()).map(|v| *v).unwrap_or(false),
                    disabled: self.is_disabled(a.name()),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BuildMode;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct FakeAdapter {
        kind: AdapterKind,
        available: AtomicBool,
        fail: bool,
    }

    impl FakeAdapter {
        fn new(kind: AdapterKind, available: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                available: AtomicBool::new(available),
                fail: false,
            })
        }
    }

    #[async_trait]
    impl BundlerAdapter for FakeAdapter {
        fn kind(&self) -> AdapterKind {
            self.kind
        }

        async fn is_available(&self, _: &Path) -> bool {
            self.available.load(Ordering::SeqCst)
        }

        async fn build(&self, _: &BuildContext) -> std::result::Result<BuildOutput, BuildFailure> {
            if self.fail {
                return Err(BuildFailure::single(BuildError::new("X", "nope"), 3));
            }
            Ok(BuildOutput {
                adapter: self.kind.name().into(),
                duration_ms: 7,
                output_hash: None,
                warnings: vec![],
            })
        }

        async fn watch(&self, _: &BuildContext, _: OnChange) -> std::result::Result<WatchHandle, BuildError> {
            Err(BuildError::new("WATCH_UNSUPPORTED", "fake"))
        }
    }

    fn ctx() -> BuildContext {
        BuildContext {
            package: "app".into(),
            project_root: ".".into(),
            package_dir: ".".into(),
            entry: "index.ts".into(),
            output_dir: "dist".into(),
            mode: BuildMode::Development,
            timeout: Duration::from_secs(1),
        }
    }

    fn manager(adapters: Vec<Arc<FakeAdapter>>, config: BundlerConfig) -> BundlerManager {
        let mut m = BundlerManager::new(config, ".");
        for a in adapters {
            m.register(a);
        }
        m
    }

    #[tokio::test]
    async fn test_initialize_prefers_default() {
        let m = manager(
            vec![
                FakeAdapter::new(AdapterKind::Vite, true),
                FakeAdapter::new(AdapterKind::Esbuild, true),
            ],
            BundlerConfig::default(),
        );
        assert_eq!(m.initialize().await.unwrap(), "vite");
    }

    #[tokio::test]
    async fn test_initialize_walks_fallback() {
        let m = manager(
            vec![
                FakeAdapter::new(AdapterKind::Vite, false),
                FakeAdapter::new(AdapterKind::Esbuild, false),
                FakeAdapter::new(AdapterKind::Webpack, true),
            ],
            BundlerConfig::default(),
        );
        assert_eq!(m.initialize().await.unwrap(), "webpack");
        assert_eq!(m.active_name().await.as_deref(), Some("webpack"));
    }

    #[tokio::test]
    async fn test_disabled_adapter_skipped() {
        let config = BundlerConfig {
            disabled: vec!["vite".into()],
            ..Default::default()
        };
        let m = manager(
            vec![
                FakeAdapter::new(AdapterKind::Vite, true),
                FakeAdapter::new(AdapterKind::Esbuild, true),
            ],
            config,
        );
        assert_eq!(m.initialize().await.unwrap(), "esbuild");
        assert!(m.switch_to("vite").await.is_err());
    }

    #[tokio::test]
    async fn test_nothing_available() {
        let m = manager(vec![FakeAdapter::new(AdapterKind::Vite, false)], BundlerConfig::default());
        assert!(m.initialize().await.is_err());
        let failure = m.build(&ctx()).await.unwrap_err();
        assert_eq!(failure.errors[0].code, diagnostics::ADAPTER_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_switch_emits_event_and_records_stats() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let m = manager(
            vec![
                FakeAdapter::new(AdapterKind::Vite, true),
                FakeAdapter::new(AdapterKind::Esbuild, true),
            ],
            BundlerConfig::default(),
        )
        .with_events(bus);

        m.initialize().await.unwrap();
        assert_eq!(rx.recv().await.unwrap().event_type, "adapter_switched");

        m.switch_to("esbuild").await.unwrap();
        let envelope = rx.recv().await.unwrap();
        assert_eq!(
            envelope.details,
            BuildEvent::AdapterSwitched {
                from: Some("vite".into()),
                to: "esbuild".into()
            }
        );

        let out = m.build(&ctx()).await.unwrap();
        assert_eq!(out.adapter, "esbuild");
        assert_eq!(m.stats()["esbuild"].builds, 1);
    }

    #[tokio::test]
    async fn test_auto_select_precedence() {
        let m = manager(
            vec![
                FakeAdapter::new(AdapterKind::Vite, true),
                FakeAdapter::new(AdapterKind::Esbuild, true),
                FakeAdapter::new(AdapterKind::Webpack, true),
            ],
            BundlerConfig::default(),
        );
        let signals = EnvironmentSignals {
            ci: true,
            development: true,
            legacy_config: true,
        };
        assert_eq!(m.auto_select(&signals).await.unwrap().as_deref(), Some("esbuild"));

        let signals = EnvironmentSignals {
            development: true,
            legacy_config: true,
            ..Default::default()
        };
        assert_eq!(m.auto_select(&signals).await.unwrap().as_deref(), Some("webpack"));

        assert_eq!(m.auto_select(&EnvironmentSignals::default()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_build_counts() {
        let mut m = BundlerManager::new(BundlerConfig::default(), ".");
        m.register(Arc::new(FakeAdapter {
            kind: AdapterKind::Vite,
            available: AtomicBool::new(true),
            fail: true,
        }));
        m.initialize().await.unwrap();
        assert!(m.build(&ctx()).await.is_err());
        let stats = m.stats()["vite"].clone();
        assert_eq!((stats.builds, stats.failures), (1, 1));
    }
}
