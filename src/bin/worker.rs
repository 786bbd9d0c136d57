//! BuildNet Worker - claims and builds micro-bundles
//!
//! Run one per build machine, pointed at the same state backend as the
//! controller.
//!
//! Usage:
//!   buildnet-worker --config buildnet.toml --backend nats --nats-url nats://127.0.0.1:4222
//!
//! Shutdown:
//!   First Ctrl-C drains (stop claiming, finish in-flight units, deregister).
//!   A second Ctrl-C forces deregistration; exit code 1 if that fails.
//!
//! Environment variables:
//!   WORKER_ID - Unique worker identifier (default: hostname + random suffix)
//!   WORKER_CONCURRENCY - Build slots (default: from config)
//!   NATS_URL / MONGODB_URI - Backend connection strings

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use buildnet::bundler::{ArtifactCache, BundlerManager};
use buildnet::config::{BackendKind, Config};
use buildnet::ledger::Ledger;
use buildnet::logging;
use buildnet::state::{connect_backend, RetryPolicy};
use buildnet::worker::{ShutdownMode, WorkerAgent};

#[derive(Parser, Debug)]
#[command(name = "buildnet-worker")]
#[command(about = "BuildNet worker agent")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "BUILDNET_CONFIG", default_value = "buildnet.toml")]
    config: PathBuf,

    /// Unique worker ID (auto-generated if not provided)
    #[arg(long, env = "WORKER_ID")]
    worker_id: Option<String>,

    /// State backend (overrides config file)
    #[arg(long, env = "BUILDNET_BACKEND", value_enum)]
    backend: Option<BackendKind>,

    /// Build slots (overrides config file)
    #[arg(long, env = "WORKER_CONCURRENCY")]
    concurrency: Option<u32>,

    /// Project root (overrides config file)
    #[arg(long, env = "BUILDNET_PROJECT_ROOT")]
    project_root: Option<PathBuf>,

    /// NATS server URL
    #[arg(long, env = "NATS_URL")]
    nats_url: Option<String>,

    /// MongoDB connection string
    #[arg(long, env = "MONGODB_URI")]
    mongo_uri: Option<String>,

    /// Log level for buildnet targets
    #[arg(long, env = "BUILDNET_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit JSON logs
    #[arg(long, env = "BUILDNET_LOG_JSON")]
    log_json: bool,
}

fn default_worker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "worker".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    logging::init(&args.log_level, args.log_json);

    if let Err(e) = run(args).await {
        error!("Worker failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = Config::load_or_default(&args.config)?;
    if let Some(kind) = args.backend {
        config.backend.kind = kind;
    }
    if let Some(slots) = args.concurrency {
        config.worker.concurrency = slots;
    }
    if let Some(root) = args.project_root {
        config.node.project_root = root;
    }
    if let Some(url) = args.nats_url {
        config.backend.nats_url = Some(url);
    }
    if let Some(uri) = args.mongo_uri {
        config.backend.mongo_uri = Some(uri);
    }
    config.validate()?;

    let worker_id = args.worker_id.unwrap_or_else(default_worker_id);
    info!(
        worker_id = %worker_id,
        slots = config.worker.concurrency,
        project_root = %config.node.project_root.display(),
        "Starting BuildNet worker"
    );

    let backend = connect_backend(&config).await?;
    let ledger = Arc::new(Ledger::new(
        backend.clone(),
        &config.ledger,
        RetryPolicy::from_config(&config.backend),
    ));

    let bundler = BundlerManager::with_defaults(config.bundler.clone(), config.node.project_root.clone());
    let active = bundler.initialize().await?;
    info!(bundler = %active, "Bundler ready");

    let mut agent = WorkerAgent::new(worker_id, &config, backend.clone(), ledger, Arc::new(bundler));
    if let Some(cache) = ArtifactCache::from_config(&config) {
        info!(dir = %cache.root().display(), "Artifact cache enabled");
        agent = agent.with_artifacts(Arc::new(cache));
    }
    let agent = Arc::new(agent);
    agent.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, draining (Ctrl-C again to force)");

    let graceful = agent.shutdown(ShutdownMode::Graceful);
    tokio::pin!(graceful);
    let result = tokio::select! {
        result = &mut graceful => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Second signal, forcing shutdown");
            agent.shutdown(ShutdownMode::Forced).await
        }
    };

    if let Err(e) = backend.disconnect().await {
        warn!(error = %e, "Backend disconnect failed");
    }
    result?;
    info!("Worker stopped");
    Ok(())
}
