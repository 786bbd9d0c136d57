//! Shared data model
//!
//! Everything that crosses the state backend (and therefore the process
//! boundary between controller and workers) is defined here and
//! serialized as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::BuildError;

/// Upper bound on `Resource::health_history`
pub const HEALTH_HISTORY_LIMIT: usize = 20;

// ============================================================================
// Actors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    User,
    Agent,
    Service,
    System,
}

/// Who initiated a state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorIdentity {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub actor_type: ActorType,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ActorIdentity {
    pub fn system() -> Self {
        Self {
            id: "system".to_string(),
            name: "BuildNet".to_string(),
            actor_type: ActorType::System,
            metadata: HashMap::new(),
        }
    }

    pub fn service(name: &str) -> Self {
        Self {
            id: format!("service:{}", name),
            name: name.to_string(),
            actor_type: ActorType::Service,
            metadata: HashMap::new(),
        }
    }

    /// A worker agent acting on its own behalf
    pub fn agent(worker_id: &str) -> Self {
        Self {
            id: worker_id.to_string(),
            name: worker_id.to_string(),
            actor_type: ActorType::Agent,
            metadata: HashMap::new(),
        }
    }

    pub fn user(name: &str) -> Self {
        Self {
            id: format!("user:{}", name),
            name: name.to_string(),
            actor_type: ActorType::User,
            metadata: HashMap::new(),
        }
    }
}

// ============================================================================
// Resources and worker state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Online,
    Offline,
    Draining,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub timestamp: DateTime<Utc>,
    pub status: ResourceStatus,
    #[serde(default)]
    pub detail: Option<String>,
}

/// A registered worker node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub status: ResourceStatus,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub concurrency: u32,
    #[serde(default)]
    pub health_history: Vec<HealthRecord>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Resource {
    pub fn new(id: &str, capabilities: Vec<String>, concurrency: u32) -> Self {
        let now = Utc::now();
        let mut resource = Self {
            id: id.to_string(),
            status: ResourceStatus::Online,
            capabilities,
            concurrency,
            health_history: Vec::new(),
            registered_at: now,
            last_seen: now,
        };
        resource.record_health(ResourceStatus::Online, Some("registered".into()));
        resource
    }

    /// Transition status and append to the bounded history
    pub fn record_health(&mut self, status: ResourceStatus, detail: Option<String>) {
        self.status = status;
        self.health_history.push(HealthRecord {
            timestamp: Utc::now(),
            status,
            detail,
        });
        if self.health_history.len() > HEALTH_HISTORY_LIMIT {
            let excess = self.health_history.len() - HEALTH_HISTORY_LIMIT;
            self.health_history.drain(..excess);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Draining,
    Offline,
}

/// Gossiped, TTL-bound view of a worker. Never authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub worker_id: String,
    pub status: WorkerStatus,
    #[serde(default)]
    pub current_task: Option<String>,
    pub load_percentage: f64,
    pub available_slots: u32,
    pub max_slots: u32,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,
    #[serde(default)]
    pub avg_duration_ms: f64,
}

fn default_success_rate() -> f64 {
    1.0
}

// ============================================================================
// Build requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    #[default]
    Development,
    Production,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Bypass the artifact cache and always run the bundler
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub mode: BuildMode,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub request_id: String,
    pub actor: ActorIdentity,
    pub targets: Vec<String>,
    #[serde(default)]
    pub options: BuildOptions,
    #[serde(default)]
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl BuildRequest {
    pub fn new(actor: ActorIdentity, targets: Vec<String>, options: BuildOptions) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            actor,
            targets,
            options,
            priority: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Units of work
// ============================================================================

/// Smallest schedulable unit of build work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicroBundle {
    pub id: String,
    pub package: String,
    pub entry: String,
    /// Bundle ids that must succeed first
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Kilobytes
    pub estimated_size: u64,
    /// Milliseconds
    pub estimated_time: u64,
    pub priority: i32,
}

/// Advisory mapping of a bundle to a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartAssignment {
    pub bundle: String,
    pub worker_id: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Offset from request start, milliseconds
    pub estimated_start: u64,
    pub estimated_duration: u64,
}

/// Published at `work:{bundle_id}:spec` when a bundle becomes claimable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub request_id: String,
    pub bundle: MicroBundle,
    pub attempt: u32,
    #[serde(default)]
    pub preferred_worker: Option<String>,
    #[serde(default)]
    pub options: BuildOptions,
    pub published_at: DateTime<Utc>,
}

/// Value stored at `work:{bundle_id}:claimed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
    #[serde(default)]
    pub attempt: u32,
}

/// Value stored at `work:{bundle_id}:result`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub request_id: String,
    pub bundle_id: String,
    pub package: String,
    pub attempt: u32,
    pub worker_id: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub output_hash: Option<String>,
    #[serde(default)]
    pub errors: Vec<BuildError>,
    /// Set when the artifact cache satisfied the unit without a build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<CacheTier>,
    pub finished_at: DateTime<Utc>,
}

/// How the artifact cache satisfied a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    /// Sources unchanged and the output directory already matches
    InstantSkip,
    /// Sources unchanged; output copied back from the cache
    CacheRestore,
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitResultStatus {
    Success,
    Failed,
    Skipped,
}

/// Per-package line of a `BuildResult`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageResult {
    pub package: String,
    pub status: UnitResultStatus,
    pub duration_ms: u64,
    pub attempts: u32,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub output_hash: Option<String>,
    #[serde(default)]
    pub errors: Vec<BuildError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<CacheTier>,
}

/// Terminal record of a build request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
    pub request_id: String,
    pub status: BuildStatus,
    pub success: bool,
    pub results: Vec<PackageResult>,
    #[serde(default)]
    pub errors: Vec<BuildError>,
    pub total_duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

/// Persisted at `builds:{request_id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub request: BuildRequest,
    pub status: BuildStatus,
    pub bundles: usize,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<BuildResult>,
}

// ============================================================================
// File changes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeKind {
    Add,
    Change,
    Unlink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeEvent {
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub kind: FileChangeKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_history_is_bounded() {
        let mut resource = Resource::new("w1", vec![], 2);
        for _ in 0..50 {
            resource.record_health(ResourceStatus::Unhealthy, None);
        }
        assert_eq!(resource.health_history.len(), HEALTH_HISTORY_LIMIT);
        assert_eq!(resource.status, ResourceStatus::Unhealthy);
    }

    #[test]
    fn test_actor_type_field_name() {
        let json = serde_json::to_value(ActorIdentity::system()).unwrap();
        assert_eq!(json["type"], "system");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!BuildStatus::Queued.is_terminal());
        assert!(!BuildStatus::Running.is_terminal());
        assert!(BuildStatus::Completed.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
        assert!(BuildStatus::Cancelled.is_terminal());
    }
}
