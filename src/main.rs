//! buildnet: BuildNet controller daemon
//!
//! Runs the scheduler, node health monitor, file watcher and HTTP
//! surfaces against a shared state backend. Workers usually run as
//! separate `buildnet-worker` processes; `--local-workers N` embeds N of
//! them in this process for single-machine use.
//!
//! Usage:
//!   buildnet --config buildnet.toml --backend file --local-workers 2

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use buildnet::api::{self, ApiState};
use buildnet::bundler::{ArtifactCache, BundlerManager};
use buildnet::config::{BackendKind, Config};
use buildnet::ledger::Ledger;
use buildnet::logging;
use buildnet::model::WorkerState;
use buildnet::scheduler::{EventBus, HealthMonitor, Scheduler};
use buildnet::state::{connect_backend, keys, RetryPolicy, SharedBackend, StateBackendExt};
use buildnet::watcher::{FileWatcher, Preparer};
use buildnet::worker::{ShutdownMode, WorkerAgent};

#[derive(Parser, Debug)]
#[command(name = "buildnet")]
#[command(about = "Distributed build orchestration controller")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "BUILDNET_CONFIG", default_value = "buildnet.toml")]
    config: PathBuf,

    /// State backend (overrides config file)
    #[arg(long, env = "BUILDNET_BACKEND", value_enum)]
    backend: Option<BackendKind>,

    /// Node ID (overrides config file)
    #[arg(long, env = "BUILDNET_NODE_ID")]
    node_id: Option<String>,

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

    /// Workers to run inside this process
    #[arg(long, env = "BUILDNET_LOCAL_WORKERS", default_value_t = 0)]
    local_workers: u32,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(kind) = self.backend {
            config.backend.kind = kind;
        }
        if let Some(id) = &self.node_id {
            config.node.id = id.clone();
        }
        if let Some(root) = &self.project_root {
            config.node.project_root = root.clone();
        }
        if let Some(url) = &self.nats_url {
            config.backend.nats_url = Some(url.clone());
        }
        if let Some(uri) = &self.mongo_uri {
            config.backend.mongo_uri = Some(uri.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.log_json);

    let mut config = Config::load_or_default(&cli.config)?;
    cli.apply(&mut config);
    config.validate()?;

    info!(
        node_id = %config.node.id,
        config = %cli.config.display(),
        project_root = %config.node.project_root.display(),
        packages = config.packages.len(),
        "Starting BuildNet controller"
    );

    let backend = connect_backend(&config).await?;
    let retry = RetryPolicy::from_config(&config.backend);
    let ledger = Arc::new(Ledger::new(backend.clone(), &config.ledger, retry));
    let events = EventBus::default();

    let bundler = BundlerManager::with_defaults(config.bundler.clone(), config.node.project_root.clone())
        .with_events(events.clone());
    match bundler.initialize().await {
        Ok(active) => info!(bundler = %active, "Bundler ready"),
        Err(e) => warn!(error = %e, "No bundler available; local builds will fail"),
    }
    let bundler = Arc::new(bundler);

    let preparer = Arc::new(Preparer::new(&config.packages));
    let scheduler = Arc::new(Scheduler::new(&config, backend.clone(), ledger.clone(), events.clone()));
    let health = Arc::new(HealthMonitor::new(
        backend.clone(),
        ledger.clone(),
        events.clone(),
        config.scheduler.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = vec![
        tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx.clone())),
        tokio::spawn(Arc::clone(&health).run(shutdown_rx.clone())),
        tokio::spawn(track_idle_workers(
            backend.clone(),
            Arc::clone(&preparer),
            Duration::from_millis(config.scheduler.health_interval_ms.max(100)),
            shutdown_rx.clone(),
        )),
    ];

    // --- File watcher ---
    let watcher = if config.watcher.enabled {
        let (tx, rx) = mpsc::channel(64);
        let handle = FileWatcher::new(
            config.node.project_root.clone(),
            config.watcher.clone(),
            Some(Arc::clone(&preparer)),
        )?
        .start(tx)?;
        tasks.push(tokio::spawn(
            Arc::clone(&scheduler).consume_changes(Arc::clone(&preparer), rx),
        ));
        Some(handle)
    } else {
        info!("File watcher disabled");
        None
    };

    // --- Embedded workers ---
    let artifacts = ArtifactCache::from_config(&config).map(Arc::new);
    if let Some(cache) = &artifacts {
        info!(dir = %cache.root().display(), "Artifact cache enabled");
    }
    let mut workers = Vec::new();
    for n in 1..=cli.local_workers {
        let id = format!("{}-local-{}", config.node.id, n);
        let mut agent = WorkerAgent::new(
            id,
            &config,
            backend.clone(),
            Arc::clone(&ledger),
            Arc::clone(&bundler),
        );
        if let Some(cache) = &artifacts {
            agent = agent.with_artifacts(Arc::clone(cache));
        }
        let agent = Arc::new(agent);
        agent.start().await?;
        workers.push(agent);
    }

    // --- HTTP ---
    let state = Arc::new(ApiState {
        config: config.clone(),
        backend: backend.clone(),
        scheduler: Arc::clone(&scheduler),
        bundler: Arc::clone(&bundler),
        preparer: Arc::clone(&preparer),
        artifacts,
        health: Arc::clone(&health),
        ledger: Arc::clone(&ledger),
        events: events.clone(),
        shutdown: shutdown_tx.clone(),
        started_at: Instant::now(),
    });

    let control = TcpListener::bind(&config.api.control_addr).await?;
    info!("Control API listening on http://{}", config.api.control_addr);
    let dashboard = TcpListener::bind(&config.api.dashboard_addr).await?;
    info!("Dashboard listening on http://{}", config.api.dashboard_addr);

    let servers = vec![
        tokio::spawn(serve(control, api::control_router(Arc::clone(&state)), shutdown_rx.clone())),
        tokio::spawn(serve(dashboard, api::dashboard_router(state), shutdown_rx.clone())),
    ];

    let mut requested = shutdown_rx.clone();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
        _ = requested.wait_for(|stop| *stop) => info!("Shutdown requested"),
    }

    // Workers drain before the scheduler stops collecting their results
    for agent in &workers {
        if let Err(e) = agent.shutdown(ShutdownMode::Graceful).await {
            error!(worker_id = %agent.id(), error = %e, "Worker shutdown failed");
        }
    }
    shutdown_tx.send_replace(true);

    if let Some(handle) = watcher {
        handle.stop().await;
    }
    for task in tasks.into_iter().chain(servers) {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            warn!("Background task did not stop in time");
        }
    }
    if let Err(e) = backend.disconnect().await {
        warn!(error = %e, "Backend disconnect failed");
    }

    info!("BuildNet controller stopped");
    Ok(())
}

async fn serve(listener: TcpListener, router: axum::Router, mut shutdown: watch::Receiver<bool>) {
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await;
    if let Err(e) = result {
        error!(error = %e, "HTTP server failed");
    }
}

/// Feed the preparer's worker estimate from live worker state
async fn track_idle_workers(
    backend: SharedBackend,
    preparer: Arc<Preparer>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match idle_workers(&backend).await {
                    Ok(count) => preparer.set_idle_workers(count),
                    Err(e) => warn!(error = %e, "Could not count idle workers"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn idle_workers(backend: &SharedBackend) -> buildnet::Result<u32> {
    let mut count = 0;
    for key in backend.keys(keys::WORKERS).await? {
        if let Some(state) = backend.get_json::<WorkerState>(&key).await? {
            if state.available_slots > 0 {
                count += 1;
            }
        }
    }
    Ok(count)
}
