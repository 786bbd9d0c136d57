//! Bundler adapter contract
//!
//! Every bundler (vite, esbuild, rspack, webpack, or an arbitrary shell
//! command) is driven through [`BundlerAdapter`]. The manager only ever
//! talks to this trait, so a new tool is a new impl plus a `register` call.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::BuildError;
use crate::model::BuildMode;

/// Known adapter kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Vite,
    Esbuild,
    Rspack,
    Webpack,
    Shell,
}

impl AdapterKind {
    pub const ALL: [AdapterKind; 5] = [
        AdapterKind::Vite,
        AdapterKind::Esbuild,
        AdapterKind::Rspack,
        AdapterKind::Webpack,
        AdapterKind::Shell,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AdapterKind::Vite => "vite",
            AdapterKind::Esbuild => "esbuild",
            AdapterKind::Rspack => "rspack",
            AdapterKind::Webpack => "webpack",
            AdapterKind::Shell => "shell",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything an adapter needs to build one package
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub package: String,
    pub project_root: PathBuf,
    /// Absolute package directory
    pub package_dir: PathBuf,
    /// Entry relative to `package_dir`
    pub entry: String,
    /// Absolute output directory
    pub output_dir: PathBuf,
    pub mode: BuildMode,
    pub timeout: Duration,
}

impl BuildContext {
    pub fn entry_path(&self) -> PathBuf {
        self.package_dir.join(&self.entry)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildOutput {
    pub adapter: String,
    pub duration_ms: u64,
    /// SHA-256 over the produced output tree, hex
    pub output_hash: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// A failed build: normalized errors plus how long it ran
#[derive(Debug, Clone, thiserror::Error)]
#[error("build failed with {} error(s)", .errors.len())]
pub struct BuildFailure {
    pub errors: Vec<BuildError>,
    pub duration_ms: u64,
}

impl BuildFailure {
    pub fn single(error: BuildError, duration_ms: u64) -> Self {
        Self {
            errors: vec![error],
            duration_ms,
        }
    }
}

/// Notification from an adapter's watch mode
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Rebuilt { duration_ms: Option<u64> },
    Failed { errors: Vec<BuildError> },
    Output(String),
}

pub type OnChange = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// Handle to a running watch session; dropping it leaves the session running
pub struct WatchHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl WatchHandle {
    pub fn new(stop_tx: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

#[async_trait]
pub trait BundlerAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    fn name(&self) -> &str {
        self.kind().name()
    }

    /// Whether the underlying tool can run on this host
    async fn is_available(&self, project_root: &std::path::Path) -> bool;

    async fn build(&self, ctx: &BuildContext) -> Result<BuildOutput, BuildFailure>;

    async fn watch(&self, ctx: &BuildContext, on_change: OnChange) -> Result<WatchHandle, BuildError>;
}
