//! BuildNet configuration
//!
//! Loaded from `buildnet.toml`; every section and field has a default so an
//! empty file (or no file at all) yields a working single-machine setup.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BuildNetError, Result};
use crate::scheduler::graph::DependencyGraph;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub bundler: BundlerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub packages: Vec<PackageConfig>,
}

impl Config {
    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.worker.concurrency == 0 {
            return Err(BuildNetError::Config(
                "worker.concurrency must be at least 1".into(),
            ));
        }
        if self.scheduler.offline_after_secs < self.scheduler.heartbeat_timeout_secs {
            return Err(BuildNetError::Config(format!(
                "scheduler.offline_after_secs ({}) must be >= heartbeat_timeout_secs ({})",
                self.scheduler.offline_after_secs, self.scheduler.heartbeat_timeout_secs
            )));
        }
        if self.scheduler.max_attempts == 0 {
            return Err(BuildNetError::Config(
                "scheduler.max_attempts must be at least 1".into(),
            ));
        }
        if self.scheduler.claim_ttl_secs == 0 {
            return Err(BuildNetError::Config(
                "scheduler.claim_ttl_secs must be at least 1".into(),
            ));
        }
        if self.worker.renew_claims {
            if self.worker.heartbeat_interval_ms >= self.scheduler.claim_ttl_secs * 1000 {
                return Err(BuildNetError::Config(format!(
                    "worker.heartbeat_interval_ms ({}) must be shorter than scheduler.claim_ttl_secs ({}s) to renew claims",
                    self.worker.heartbeat_interval_ms, self.scheduler.claim_ttl_secs
                )));
            }
        } else if self.worker.unit_timeout_secs > self.scheduler.claim_ttl_secs {
            return Err(BuildNetError::Config(format!(
                "worker.unit_timeout_secs ({}) exceeds scheduler.claim_ttl_secs ({}) and worker.renew_claims is off",
                self.worker.unit_timeout_secs, self.scheduler.claim_ttl_secs
            )));
        }
        if !(0.0..=1.0).contains(&self.worker.ema_alpha) || self.worker.ema_alpha == 0.0 {
            return Err(BuildNetError::Config(
                "worker.ema_alpha must be in (0, 1]".into(),
            ));
        }

        let mut names = HashSet::new();
        for pkg in &self.packages {
            if !names.insert(pkg.name.as_str()) {
                return Err(BuildNetError::Config(format!(
                    "duplicate package '{}'",
                    pkg.name
                )));
            }
        }
        for pkg in &self.packages {
            for dep in &pkg.dependencies {
                if !names.contains(dep.as_str()) {
                    return Err(BuildNetError::Config(format!(
                        "package '{}' depends on unknown package '{}'",
                        pkg.name, dep
                    )));
                }
            }
        }

        // Rejects dependency cycles
        DependencyGraph::from_packages(&self.packages)
            .topological_order()
            .map_err(|e| BuildNetError::Config(e.to_string()))?;

        Ok(())
    }

    /// Root directory for the file backend
    pub fn file_backend_root(&self) -> PathBuf {
        self.backend
            .file_root
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("state"))
    }

    /// Artifact cache directory (defaults to `<data_dir>/cache`)
    pub fn cache_dir(&self) -> PathBuf {
        self.cache
            .dir
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("cache"))
    }

    pub fn package(&self, name: &str) -> Option<&PackageConfig> {
        self.packages.iter().find(|p| p.name == name)
    }
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    #[serde(default = "default_node_id")]
    pub id: String,

    /// Root of the source tree being built
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,

    /// Local data directory (file backend, logs)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            project_root: default_project_root(),
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Auto,
    Memory,
    File,
    Nats,
    Mongo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    /// File backend root (defaults to `<data_dir>/state`)
    #[serde(default)]
    pub file_root: Option<PathBuf>,

    /// NATS server URL; auto-detection skips NATS when unset
    #[serde(default)]
    pub nats_url: Option<String>,

    /// JetStream key/value bucket name
    #[serde(default = "default_bucket")]
    pub nats_bucket: String,

    /// MongoDB connection URI; auto-detection skips MongoDB when unset
    #[serde(default)]
    pub mongo_uri: Option<String>,

    #[serde(default = "default_bucket")]
    pub mongo_db: String,

    /// Retry attempts for transient backend failures
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Auto,
            file_root: None,
            nats_url: None,
            nats_bucket: default_bucket(),
            mongo_uri: None,
            mongo_db: default_bucket(),
            retry_attempts: default_retry_attempts(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Silence after which a worker is unhealthy
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    /// Silence after which a worker is offline and its resource removed
    #[serde(default = "default_offline_after")]
    pub offline_after_secs: u64,

    /// TTL on `work:{id}:claimed` keys
    #[serde(default = "default_claim_ttl")]
    pub claim_ttl_secs: u64,

    /// Attempts per bundle before the request fails
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_health_interval")]
    pub health_interval_ms: u64,

    #[serde(default = "default_result_poll_interval")]
    pub result_poll_interval_ms: u64,

    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    /// Finished requests kept in memory for `/builds`
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Age after which finished `builds:*` records are pruned
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    #[serde(default = "default_retention_interval")]
    pub retention_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            offline_after_secs: default_offline_after(),
            claim_ttl_secs: default_claim_ttl(),
            max_attempts: default_max_attempts(),
            health_interval_ms: default_health_interval(),
            result_poll_interval_ms: default_result_poll_interval(),
            build_timeout_secs: default_build_timeout(),
            history_limit: default_history_limit(),
            retention_secs: default_retention(),
            retention_interval_secs: default_retention_interval(),
        }
    }
}

impl SchedulerConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn offline_after(&self) -> Duration {
        Duration::from_secs(self.offline_after_secs)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent build slots
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,

    /// TTL on `workers:{id}`
    #[serde(default = "default_state_ttl")]
    pub state_ttl_secs: u64,

    /// Peers silent for longer are pruned from the gossip view
    #[serde(default = "default_peer_stale")]
    pub peer_stale_secs: u64,

    /// Interval between scans for claimable work
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    #[serde(default = "default_deregister_timeout")]
    pub deregister_timeout_secs: u64,

    /// Per-unit build timeout
    #[serde(default = "default_unit_timeout")]
    pub unit_timeout_secs: u64,

    /// Refresh owned claims on every heartbeat
    #[serde(default = "default_true")]
    pub renew_claims: bool,

    /// Smoothing factor for performance stats
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,

    /// Advertised capabilities (adapter names, platform tags)
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            gossip_interval_ms: default_gossip_interval(),
            state_ttl_secs: default_state_ttl(),
            peer_stale_secs: default_peer_stale(),
            poll_interval_ms: default_poll_interval(),
            drain_timeout_secs: default_drain_timeout(),
            deregister_timeout_secs: default_deregister_timeout(),
            unit_timeout_secs: default_unit_timeout(),
            renew_claims: true,
            ema_alpha: default_ema_alpha(),
            capabilities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directories to watch, relative to the project root
    #[serde(default = "default_watch_paths")]
    pub paths: Vec<PathBuf>,

    /// Glob patterns a path must match (empty = everything)
    #[serde(default)]
    pub include: Vec<String>,

    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Paths whose changes force dependent packages to rebuild
    #[serde(default = "default_shared_paths")]
    pub shared_paths: Vec<String>,

    /// Precompute affected packages as events arrive
    #[serde(default = "default_true")]
    pub preemptive: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            paths: default_watch_paths(),
            include: Vec::new(),
            exclude: default_exclude(),
            debounce_ms: default_debounce(),
            shared_paths: default_shared_paths(),
            preemptive: true,
        }
    }
}

/// Adapter chosen per environment signal by `auto_select`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoSelectTable {
    #[serde(default)]
    pub ci: Option<String>,
    #[serde(default)]
    pub development: Option<String>,
    #[serde(default)]
    pub legacy_config: Option<String>,
}

impl Default for AutoSelectTable {
    fn default() -> Self {
        Self {
            ci: Some("esbuild".into()),
            development: Some("vite".into()),
            legacy_config: Some("webpack".into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundlerConfig {
    /// Preferred adapter name
    #[serde(default = "default_adapter")]
    pub default: String,

    /// Tried in order when the preferred adapter is unavailable
    #[serde(default = "default_fallback")]
    pub fallback: Vec<String>,

    #[serde(default)]
    pub disabled: Vec<String>,

    /// Run `auto_select` during initialization
    #[serde(default)]
    pub auto: bool,

    #[serde(default)]
    pub auto_select: AutoSelectTable,

    /// Binary overrides per adapter name
    #[serde(default)]
    pub commands: HashMap<String, String>,

    /// Command run by the shell adapter; `{package}` and `{path}` are substituted
    #[serde(default)]
    pub shell_command: Option<String>,
}

impl Default for BundlerConfig {
    fn default() -> Self {
        Self {
            default: default_adapter(),
            fallback: default_fallback(),
            disabled: Vec::new(),
            auto: false,
            auto_select: AutoSelectTable::default(),
            commands: HashMap::new(),
            shell_command: None,
        }
    }
}

/// Local content-addressed artifact cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Least recently used artifacts are evicted past this size (0 = unbounded)
    #[serde(default = "default_cache_max_size")]
    pub max_size_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            max_size_mb: default_cache_max_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Interval of the background chain audit (0 disables)
    #[serde(default = "default_verify_interval")]
    pub verify_interval_secs: u64,

    /// TTL on the `ledger:lock` key
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_ms: u64,

    /// How long an append waits for the lock
    #[serde(default = "default_lock_wait")]
    pub lock_wait_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            verify_interval_secs: default_verify_interval(),
            lock_ttl_ms: default_lock_ttl(),
            lock_wait_ms: default_lock_wait(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Control-plane listen address
    #[serde(default = "default_control_addr")]
    pub control_addr: String,

    /// Dashboard / event stream listen address
    #[serde(default = "default_dashboard_addr")]
    pub dashboard_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            control_addr: default_control_addr(),
            dashboard_addr: default_dashboard_addr(),
        }
    }
}

/// One buildable package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageConfig {
    pub name: String,

    /// Directory relative to the project root
    pub path: PathBuf,

    /// Entry point relative to the package directory
    #[serde(default = "default_entry")]
    pub entry: String,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub estimated_size_kb: u64,

    #[serde(default = "default_estimated_time")]
    pub estimated_time_ms: u64,

    #[serde(default)]
    pub priority: i32,

    /// Output directory relative to the package directory
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

// Defaults
fn default_node_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "local".to_string());
    format!("buildnet-{}", host)
}
fn default_project_root() -> PathBuf { PathBuf::from(".") }
fn default_data_dir() -> PathBuf { PathBuf::from(".buildnet") }
fn default_bucket() -> String { "buildnet".to_string() }
fn default_retry_attempts() -> u32 { 5 }
fn default_retry_base_ms() -> u64 { 100 }
fn default_heartbeat_timeout() -> u64 { 30 }
fn default_offline_after() -> u64 { 90 }
fn default_claim_ttl() -> u64 { 120 }
fn default_max_attempts() -> u32 { 3 }
fn default_health_interval() -> u64 { 2000 }
fn default_result_poll_interval() -> u64 { 500 }
fn default_build_timeout() -> u64 { 600 }
fn default_history_limit() -> usize { 100 }
fn default_retention() -> u64 { 7 * 24 * 3600 }
fn default_retention_interval() -> u64 { 300 }
fn default_concurrency() -> u32 { num_cpus::get().clamp(1, 4) as u32 }
fn default_heartbeat_interval() -> u64 { 5000 }
fn default_gossip_interval() -> u64 { 2000 }
fn default_state_ttl() -> u64 { 15 }
fn default_peer_stale() -> u64 { 30 }
fn default_poll_interval() -> u64 { 250 }
fn default_drain_timeout() -> u64 { 120 }
fn default_deregister_timeout() -> u64 { 5 }
fn default_unit_timeout() -> u64 { 600 }
fn default_ema_alpha() -> f64 { 0.2 }
fn default_true() -> bool { true }
fn default_watch_paths() -> Vec<PathBuf> { vec![PathBuf::from(".")] }
fn default_exclude() -> Vec<String> {
    vec![
        "**/node_modules/**".to_string(),
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/dist/**".to_string(),
        "**/.buildnet/**".to_string(),
    ]
}
fn default_debounce() -> u64 { 100 }
fn default_shared_paths() -> Vec<String> {
    vec!["shared".to_string(), "packages/shared".to_string()]
}
fn default_adapter() -> String { "vite".to_string() }
fn default_fallback() -> Vec<String> {
    vec![
        "esbuild".to_string(),
        "rspack".to_string(),
        "webpack".to_string(),
        "shell".to_string(),
    ]
}
fn default_cache_max_size() -> u64 { 2048 }
fn default_verify_interval() -> u64 { 300 }
fn default_lock_ttl() -> u64 { 5000 }
fn default_lock_wait() -> u64 { 10_000 }
fn default_control_addr() -> String { "127.0.0.1:9876".to_string() }
fn default_dashboard_addr() -> String { "127.0.0.1:9877".to_string() }
fn default_entry() -> String { "src/index.ts".to_string() }
fn default_estimated_time() -> u64 { 1000 }
fn default_output_dir() -> String { "dist".to_string() }

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(name: &str, deps: &[&str]) -> PackageConfig {
        PackageConfig {
            name: name.into(),
            path: PathBuf::from(format!("packages/{}", name)),
            entry: default_entry(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            estimated_size_kb: 0,
            estimated_time_ms: 1000,
            priority: 0,
            output_dir: default_output_dir(),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.max_attempts, 3);
        assert_eq!(config.api.control_addr, "127.0.0.1:9876");
    }

    #[test]
    fn test_rejects_unknown_dependency() {
        let mut config = Config::default();
        config.packages = vec![pkg("app", &["missing"])];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown package"));
    }

    #[test]
    fn test_rejects_cycle() {
        let mut config = Config::default();
        config.packages = vec![pkg("a", &["b"]), pkg("b", &["a"])];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.worker.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_long_units_need_claim_renewal() {
        let mut config = Config::default();
        config.scheduler.claim_ttl_secs = 60;
        config.worker.unit_timeout_secs = 600;
        assert!(config.validate().is_ok());

        config.worker.renew_claims = false;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("renew_claims"));

        config.worker.unit_timeout_secs = 60;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_renewal_must_beat_claim_ttl() {
        let mut config = Config::default();
        config.scheduler.claim_ttl_secs = 2;
        config.worker.heartbeat_interval_ms = 2000;
        assert!(config.validate().is_err());
        config.worker.heartbeat_interval_ms = 500;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_offline_must_follow_unhealthy() {
        let mut config = Config::default();
        config.scheduler.heartbeat_timeout_secs = 60;
        config.scheduler.offline_after_secs = 30;
        assert!(config.validate().is_err());
    }
}
