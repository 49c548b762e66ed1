//! GPU Inference Orchestrator
//!
//! The orchestrator accepts image-generation tasks over a REST interface,
//! dispatches them to a fixed pool of per-device worker processes, and
//! returns generated artifacts. It owns the queue, the scheduler, the worker
//! lifecycle, and the durable task log.
// This is the main entry point for the orchestrator. It is responsible for:
// - Initializing logging and configuration.
// - Bringing the components up in dependency order and tearing them down in
//   reverse.
// - Owning the background loops (scheduler ticks, health checks, metrics).
// - Handling graceful shutdown.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

mod api;
mod bus;
mod monitor;
mod queue;
mod registry;
mod scheduler;
mod store;

#[cfg(test)]
mod tests;

use bus::MessageBus;
use monitor::SystemMonitor;
use queue::TaskQueue;
use registry::{HealthEvent, WorkerRegistry};
use scheduler::Scheduler;
use shared::config::NodeConfig;
use shared::task::{error_kind, TaskStatus};
use shared::utils::current_timestamp_secs_f64;
use store::Store;

/// How long shutdown waits for each background task to finish.
const TASK_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// Command-line arguments for the orchestrator
#[derive(Parser, Debug)]
#[command(name = "orchestrator")]
#[command(about = "GPU inference orchestrator that schedules tasks across per-device workers", long_about = None)]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Override the API host from the config file
    #[arg(long = "host", value_name = "HOST")]
    host: Option<String>,

    /// Override the API port from the config file
    #[arg(long = "port", value_name = "PORT")]
    port: Option<u16>,

    /// Override the device list from the config file (comma-separated ids)
    #[arg(long = "device-list", value_name = "IDS")]
    device_list: Option<String>,

    /// Do not spawn workers automatically
    #[arg(long = "no-workers")]
    no_workers: bool,

    /// Override the worker binary path from the config file
    #[arg(long = "worker-binary", value_name = "PATH")]
    worker_binary: Option<PathBuf>,
}

/// The supervisor owning every component and background loop.
pub struct Orchestrator {
    config: Arc<NodeConfig>,
    store: Arc<Mutex<Store>>,
    queue: Arc<Mutex<TaskQueue>>,
    registry: Arc<Mutex<WorkerRegistry>>,
    bus: Arc<Mutex<MessageBus>>,
    scheduler_task: Option<JoinHandle<()>>,
    health_task: Option<JoinHandle<()>>,
    monitor_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl Orchestrator {
    /// Wire up the components. Nothing is started yet; `run` does that in
    /// dependency order.
    pub fn new(config: NodeConfig, config_path: PathBuf) -> Result<Self> {
        let config = Arc::new(config);

        let store = Arc::new(Mutex::new(Store::new(
            &config.store.data_dir,
            config.store.busy_timeout_seconds,
        )?));

        let bus = Arc::new(Mutex::new(MessageBus::new()));
        let queue = Arc::new(Mutex::new(TaskQueue::new(Arc::clone(&store))));
        let registry = Arc::new(Mutex::new(WorkerRegistry::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            config.workers.clone(),
            config.communication.clone(),
            config_path,
        )));

        Ok(Self {
            config,
            store,
            queue,
            registry,
            bus,
            scheduler_task: None,
            health_task: None,
            monitor_task: None,
            shutdown_tx: None,
        })
    }

    /// Start everything and serve the API until shutdown.
    ///
    /// Startup order: store, recovery pass, worker spawn, health monitor,
    /// scheduler, system monitor, API.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting GPU inference orchestrator");

        // A store that cannot be initialized is fatal; everything else
        // degrades gracefully.
        {
            let mut store = self.store.lock().await;
            store
                .initialize()
                .await
                .context("Failed to initialize store")?;
        }

        let mut scheduler = Scheduler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            Arc::clone(&self.registry),
            Arc::clone(&self.bus),
            self.config.processing.clone(),
            self.config.store.clone(),
            PathBuf::from(&self.config.paths.model_dir),
        );

        // Resolve what a previous lifetime left behind before any worker can
        // pick up new work.
        scheduler
            .recover_from_store()
            .await
            .context("Startup recovery pass failed")?;

        {
            let mut registry = self.registry.lock().await;
            registry.spawn_all().await?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        // Health monitor: twice per heartbeat timeout, per the registry
        // contract.
        let health_interval_secs =
            (self.config.communication.worker_timeout_seconds / 2).max(1);
        let registry_for_health = Arc::clone(&self.registry);
        let queue_for_health = Arc::clone(&self.queue);
        let store_for_health = Arc::clone(&self.store);
        let mut health_shutdown_rx = shutdown_tx.subscribe();
        let health_task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(health_interval_secs));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let events = {
                            let mut registry = registry_for_health.lock().await;
                            registry.check_worker_health().await
                        };
                        handle_health_events(
                            events,
                            &queue_for_health,
                            &store_for_health,
                        ).await;
                    }
                    _ = health_shutdown_rx.recv() => {
                        info!("Health monitor received shutdown signal");
                        break;
                    }
                }
            }
        });
        self.health_task = Some(health_task);

        // Scheduler tick loop.
        let tick_ms = self.config.processing.scheduler_interval_ms;
        let mut scheduler_shutdown_rx = shutdown_tx.subscribe();
        let scheduler_task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(tick_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = scheduler.tick().await {
                            error!("Scheduler tick failed: {}", e);
                        }
                    }
                    _ = scheduler_shutdown_rx.recv() => {
                        info!("Scheduler received shutdown signal");
                        break;
                    }
                }
            }
        });
        self.scheduler_task = Some(scheduler_task);

        // System metrics snapshots.
        let metrics_interval_secs = self.config.monitoring.metrics_interval_seconds.max(1);
        let mut system_monitor = SystemMonitor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            Arc::clone(&self.registry),
        );
        let mut monitor_shutdown_rx = shutdown_tx.subscribe();
        let monitor_task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(metrics_interval_secs));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        system_monitor.collect_and_store().await;
                    }
                    _ = monitor_shutdown_rx.recv() => {
                        info!("System monitor received shutdown signal");
                        break;
                    }
                }
            }
        });
        self.monitor_task = Some(monitor_task);

        // Finally the API, on top of everything else.
        let app_state = api::AppState {
            config: Arc::clone(&self.config),
            store: Arc::clone(&self.store),
            queue: Arc::clone(&self.queue),
            registry: Arc::clone(&self.registry),
            started_at: current_timestamp_secs_f64(),
        };
        let app = api::create_router(app_state);

        let listen_address = self.config.api.socket_addr()?;
        info!("Starting HTTP API on {}", listen_address);

        let listener = tokio::net::TcpListener::bind(listen_address)
            .await
            .with_context(|| {
                format!(
                    "Failed to bind TCP listener to {}. \
                     Check if the port is already in use (EADDRINUSE) or requires \
                     elevated permissions (EACCES).",
                    listen_address
                )
            })?;

        let shutdown_signal = {
            let mut rx = shutdown_tx.subscribe();
            async move {
                let _ = rx.recv().await;
                info!("HTTP API received shutdown signal");
            }
        };

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| anyhow::anyhow!("API server error: {}", e))?;

        Ok(())
    }

    /// Graceful shutdown, reverse of startup: API (already unblocked by the
    /// broadcast), background loops, workers, store.
    pub async fn shutdown(&mut self) {
        info!("Shutting down orchestrator gracefully");

        if let Some(shutdown_tx) = &self.shutdown_tx {
            if let Err(e) = shutdown_tx.send(()) {
                warn!("Failed to send shutdown signal: {}", e);
            }
        }

        for (name, handle) in [
            ("scheduler", self.scheduler_task.take()),
            ("health monitor", self.health_task.take()),
            ("system monitor", self.monitor_task.take()),
        ] {
            let Some(handle) = handle else { continue };
            match tokio::time::timeout(
                std::time::Duration::from_secs(TASK_SHUTDOWN_TIMEOUT_SECS),
                handle,
            )
            .await
            {
                Ok(Ok(())) => debug!("{} task completed", name),
                Ok(Err(e)) => warn!("{} task panicked: {}", name, e),
                Err(_) => warn!("{} task shutdown timeout reached", name),
            }
        }

        {
            let mut registry = self.registry.lock().await;
            registry.teardown().await;
        }

        {
            let mut store = self.store.lock().await;
            if let Err(e) = store.checkpoint_wal().await {
                warn!("Final WAL checkpoint failed: {}", e);
            }
            store.close().await;
        }

        info!("Orchestrator shutdown complete");
    }
}

/// Act on health-check findings: a dead worker fails its owned task.
async fn handle_health_events(
    events: Vec<HealthEvent>,
    queue: &Arc<Mutex<TaskQueue>>,
    store: &Arc<Mutex<Store>>,
) {
    for event in events {
        match event {
            HealthEvent::WorkerStale { worker_id } => {
                debug!("Worker {} marked offline after missed heartbeats", worker_id);
            }
            HealthEvent::WorkerDied {
                worker_id,
                owned_task,
                ..
            } => {
                let Some(task_id) = owned_task else { continue };
                let error = format!("worker {} died while owning the task", worker_id);

                let failed = {
                    let mut queue = queue.lock().await;
                    queue.fail(&task_id, error.clone(), error_kind::WORKER_DIED)
                };
                if failed.is_none() {
                    continue;
                }
                warn!("Task {} failed: {}", task_id, error);

                let mut store = store.lock().await;
                if let Err(e) = store
                    .update_task_status(
                        &task_id,
                        TaskStatus::Failed,
                        Some(&worker_id),
                        None,
                        Some(&error),
                        Some(error_kind::WORKER_DIED),
                        None,
                    )
                    .await
                {
                    warn!("Failed to persist failure of {}: {}", task_id, e);
                }
            }
        }
    }
}

/// Sets up signal handlers for graceful shutdown.
///
/// On Unix systems, handles SIGTERM and SIGINT. Elsewhere, Ctrl+C.
async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to register signal handlers: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to wait for Ctrl+C: {}", e);
                } else {
                    info!("Received Ctrl+C");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to receive Ctrl+C signal: {}", e);
        } else {
            info!("Received Ctrl+C");
        }
    }
}

/// Orchestrator entry point.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging before anything can fail.
    let file_appender = tracing_appender::rolling::daily("./logs", "orchestrator.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("orchestrator=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let cli_args = CliArgs::parse();

    info!("GPU inference orchestrator starting up");
    info!("Configuration file: {}", cli_args.config_file.display());

    let mut config = match NodeConfig::load(&cli_args.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Command-line overrides on top of file and environment values.
    if let Some(host) = cli_args.host {
        info!("API host override provided via command line");
        config.api.host = host;
    }
    if let Some(port) = cli_args.port {
        info!("API port override provided via command line");
        config.api.port = port;
    }
    if let Some(devices) = cli_args.device_list {
        let parsed: Result<Vec<u32>, _> =
            devices.split(',').map(|s| s.trim().parse::<u32>()).collect();
        match parsed {
            Ok(list) if !list.is_empty() => {
                info!("Device list override provided via command line: {:?}", list);
                config.workers.device_list = list;
            }
            _ => {
                error!("Invalid --device-list value: {}", devices);
                std::process::exit(1);
            }
        }
    }
    if cli_args.no_workers {
        info!("Worker auto-start disabled via command line");
        config.workers.auto_start_workers = false;
    }
    if let Some(path) = cli_args.worker_binary {
        config.workers.worker_binary = Some(path);
    }

    let mut orchestrator = match Orchestrator::new(config, cli_args.config_file) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!("Failed to initialize orchestrator: {}", e);
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = orchestrator.run() => {
            if let Err(e) = result {
                error!("Orchestrator error: {}", e);
                orchestrator.shutdown().await;
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown");
        }
    }

    orchestrator.shutdown().await;
    info!("Orchestrator shutdown complete");
    Ok(())
}
