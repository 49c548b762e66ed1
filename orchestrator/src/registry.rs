//! Worker process lifecycle and status registry
//!
//! The registry owns the worker-id to process mapping and the worker-id to
//! status mapping, and is their single writer. It spawns one child process
//! per configured device, bridges each child's stdio pipes to the message bus
//! with a pair of pump tasks, watches liveness, and tears everything down on
//! shutdown.
//!
//! Readers (the scheduler, the API, the monitor) take snapshots; they never
//! mutate entries directly.

use crate::bus::MessageBus;
use crate::store::Store;
use anyhow::{Context, Result};
use shared::config::{CommunicationConfig, WorkerPoolConfig};
use shared::message::{Message, MessagePayload};
use shared::utils::{current_timestamp_secs_f64, worker_id_for_device};
use shared::worker::{DeviceUsage, WorkerCapabilities, WorkerState, WorkerStats};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long teardown waits for workers to exit after the shutdown
/// instruction before killing them.
const SHUTDOWN_GRACE_SECS: u64 = 5;

/// Offline entries with no process are removed after this many heartbeat
/// timeouts without activity.
const OFFLINE_PRUNE_MULTIPLIER: u64 = 3;

/// The registry's in-memory view of one worker.
#[derive(Debug, Clone)]
pub struct WorkerEntry {
    pub worker_id: String,
    pub device_id: u32,
    pub state: WorkerState,
    pub current_task: Option<String>,
    pub current_model: Option<String>,
    pub vram_usage_mb: u64,
    pub last_activity: f64,
    pub capabilities: WorkerCapabilities,
}

/// Handle to a spawned worker process and its pipe pumps.
struct WorkerHandle {
    child: Child,
    stdin_pump: JoinHandle<()>,
    stdout_pump: JoinHandle<()>,
}

/// Findings of one health-check pass that require action outside the
/// registry (failing owned tasks is the task queue's business).
#[derive(Debug, Clone)]
pub enum HealthEvent {
    /// No activity within the timeout; the entry was marked offline.
    WorkerStale { worker_id: String },
    /// The OS process is gone. The entry was removed and, if auto-restart is
    /// enabled, a replacement was spawned for the same device.
    WorkerDied {
        worker_id: String,
        device_id: u32,
        owned_task: Option<String>,
    },
}

pub struct WorkerRegistry {
    store: Arc<Mutex<Store>>,
    bus: Arc<Mutex<MessageBus>>,
    pool: WorkerPoolConfig,
    comm: CommunicationConfig,
    /// Config file path handed to spawned workers.
    config_path: PathBuf,
    workers: HashMap<String, WorkerEntry>,
    processes: HashMap<u32, WorkerHandle>,
}

impl WorkerRegistry {
    pub fn new(
        store: Arc<Mutex<Store>>,
        bus: Arc<Mutex<MessageBus>>,
        pool: WorkerPoolConfig,
        comm: CommunicationConfig,
        config_path: PathBuf,
    ) -> Self {
        Self {
            store,
            bus,
            pool,
            comm,
            config_path,
            workers: HashMap::new(),
            processes: HashMap::new(),
        }
    }

    /// Resolve the worker executable: configured path, or a `worker` binary
    /// next to the running orchestrator.
    fn worker_binary(&self) -> Result<PathBuf> {
        if let Some(path) = &self.pool.worker_binary {
            return Ok(path.clone());
        }
        let exe = std::env::current_exe().context("Failed to locate current executable")?;
        let dir = exe
            .parent()
            .context("Current executable has no parent directory")?;
        Ok(dir.join("worker"))
    }

    /// Spawn a worker process bound to one device and bridge its pipes to the
    /// bus. A live process for the device makes this a no-op.
    pub async fn spawn_worker(&mut self, device_id: u32) -> Result<()> {
        if let Some(handle) = self.processes.get_mut(&device_id) {
            if handle.child.try_wait()?.is_none() {
                warn!("Worker process for device {} already running", device_id);
                return Ok(());
            }
            // Reap the dead handle before respawning.
            self.remove_process(device_id).await;
        }

        let worker_id = worker_id_for_device(device_id);
        let binary = self.worker_binary()?;

        let (inbound_rx, results_tx, statuses_tx) = {
            let mut bus = self.bus.lock().await;
            let rx = bus.register_worker(&worker_id);
            let (results_tx, statuses_tx) = bus.outbound_senders();
            (rx, results_tx, statuses_tx)
        };

        let mut child = Command::new(&binary)
            .arg(&self.config_path)
            .arg("--device-id")
            .arg(device_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "Failed to spawn worker for device {} from {}",
                    device_id,
                    binary.display()
                )
            })?;

        let stdin = child
            .stdin
            .take()
            .context("Spawned worker has no stdin pipe")?;
        let stdout = child
            .stdout
            .take()
            .context("Spawned worker has no stdout pipe")?;

        let stdin_pump = tokio::spawn(run_stdin_pump(worker_id.clone(), inbound_rx, stdin));
        let stdout_pump = tokio::spawn(run_stdout_pump(
            worker_id.clone(),
            stdout,
            results_tx,
            statuses_tx,
        ));

        self.processes.insert(
            device_id,
            WorkerHandle {
                child,
                stdin_pump,
                stdout_pump,
            },
        );

        self.workers.insert(
            worker_id.clone(),
            WorkerEntry {
                worker_id: worker_id.clone(),
                device_id,
                state: WorkerState::Starting,
                current_task: None,
                current_model: None,
                vram_usage_mb: 0,
                last_activity: current_timestamp_secs_f64(),
                capabilities: WorkerCapabilities::default(),
            },
        );

        {
            let mut store = self.store.lock().await;
            if let Err(e) = store.register_worker(&worker_id, device_id).await {
                warn!("Failed to register worker {} in store: {}", worker_id, e);
            }
        }

        info!(
            "Worker process spawned for device {} ({})",
            device_id, worker_id
        );
        Ok(())
    }

    /// Spawn workers for every configured device. With parallel spawn the
    /// processes are started back to back; otherwise the configured delay is
    /// inserted between devices.
    pub async fn spawn_all(&mut self) -> Result<()> {
        if !self.pool.auto_start_workers {
            info!("Auto-start of workers is disabled");
            return Ok(());
        }

        info!("Starting workers for devices: {:?}", self.pool.device_list);
        let devices = self.pool.device_list.clone();
        for (i, device_id) in devices.iter().enumerate() {
            if let Err(e) = self.spawn_worker(*device_id).await {
                error!("Failed to spawn worker for device {}: {}", device_id, e);
            }
            if !self.pool.parallel_worker_spawn && i + 1 < devices.len() {
                sleep(Duration::from_millis(self.pool.worker_spawn_delay_ms)).await;
            }
        }
        Ok(())
    }

    /// Handle a worker's registration message: the worker is now idle.
    pub async fn register(
        &mut self,
        worker_id: &str,
        device_id: u32,
        capabilities: WorkerCapabilities,
    ) {
        let now = current_timestamp_secs_f64();
        let entry = self
            .workers
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerEntry {
                worker_id: worker_id.to_string(),
                device_id,
                state: WorkerState::Starting,
                current_task: None,
                current_model: None,
                vram_usage_mb: 0,
                last_activity: now,
                capabilities: WorkerCapabilities::default(),
            });
        entry.device_id = device_id;
        entry.state = WorkerState::Idle;
        entry.capabilities = capabilities;
        entry.last_activity = now;

        info!("Worker {} registered on device {}", worker_id, device_id);
        self.persist_worker(worker_id).await;
    }

    /// Handle a heartbeat: refresh activity and the mutable fields.
    pub fn heartbeat(
        &mut self,
        worker_id: &str,
        current_model: Option<String>,
        vram_usage_mb: u64,
    ) {
        match self.workers.get_mut(worker_id) {
            Some(entry) => {
                entry.last_activity = current_timestamp_secs_f64();
                entry.current_model = current_model;
                entry.vram_usage_mb = vram_usage_mb;
                // A heartbeat proves a stale-marked worker is actually alive.
                if entry.state == WorkerState::Offline {
                    entry.state = WorkerState::Idle;
                    info!("Worker {} back online after heartbeat", worker_id);
                }
            }
            None => warn!("Heartbeat from unregistered worker {}", worker_id),
        }
    }

    /// Refresh a worker's activity timestamp.
    pub fn touch(&mut self, worker_id: &str) {
        if let Some(entry) = self.workers.get_mut(worker_id) {
            entry.last_activity = current_timestamp_secs_f64();
        }
    }

    /// Dispatch mark: idle worker takes ownership of a task.
    pub fn mark_busy(&mut self, worker_id: &str, task_id: &str) -> bool {
        match self.workers.get_mut(worker_id) {
            Some(entry) if entry.state == WorkerState::Idle => {
                entry.state = WorkerState::Busy;
                entry.current_task = Some(task_id.to_string());
                entry.last_activity = current_timestamp_secs_f64();
                true
            }
            Some(entry) => {
                warn!(
                    "Worker {} is not idle (status: {}), cannot dispatch",
                    worker_id, entry.state
                );
                false
            }
            None => {
                warn!("Worker {} not found for dispatch", worker_id);
                false
            }
        }
    }

    /// Ready event or dispatch revert: the worker is idle again.
    pub async fn mark_idle(&mut self, worker_id: &str) {
        if let Some(entry) = self.workers.get_mut(worker_id) {
            entry.state = WorkerState::Idle;
            entry.current_task = None;
            entry.last_activity = current_timestamp_secs_f64();
        }
        self.persist_worker(worker_id).await;
    }

    /// Error event: the worker stays out of rotation until it reports ready.
    pub async fn mark_error(&mut self, worker_id: &str, error: &str) {
        let entry = match self.workers.get_mut(worker_id) {
            Some(entry) => {
                entry.state = WorkerState::Error;
                entry.last_activity = current_timestamp_secs_f64();
                entry.clone()
            }
            None => return,
        };

        let mut store = self.store.lock().await;
        if let Err(e) = store
            .update_worker_status(
                &entry.worker_id,
                entry.device_id,
                WorkerState::Error,
                entry.current_model.as_deref(),
                entry.vram_usage_mb,
                Some(error),
            )
            .await
        {
            warn!("Failed to persist error status for {}: {}", worker_id, e);
        }
    }

    /// Disconnect message: the worker is leaving on its own terms.
    pub async fn mark_offline(&mut self, worker_id: &str) {
        if let Some(entry) = self.workers.get_mut(worker_id) {
            entry.state = WorkerState::Offline;
        }
        self.persist_worker(worker_id).await;
    }

    /// Write a worker's current entry through to the store.
    async fn persist_worker(&self, worker_id: &str) {
        let Some(entry) = self.workers.get(worker_id) else {
            return;
        };
        let mut store = self.store.lock().await;
        if let Err(e) = store
            .update_worker_status(
                &entry.worker_id,
                entry.device_id,
                entry.state,
                entry.current_model.as_deref(),
                entry.vram_usage_mb,
                None,
            )
            .await
        {
            warn!("Failed to persist status for {}: {}", worker_id, e);
        }
    }

    /// Pick the idle worker whose last activity is most recent, ties broken
    /// by device id. `None` when no worker is idle.
    pub fn find_optimal_worker(&self) -> Option<String> {
        self.workers
            .values()
            .filter(|e| e.state == WorkerState::Idle)
            .max_by(|a, b| {
                a.last_activity
                    .partial_cmp(&b.last_activity)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // Reversed so the max picks the smaller device id on ties.
                    .then(b.device_id.cmp(&a.device_id))
            })
            .map(|e| e.worker_id.clone())
    }

    /// Number of idle workers.
    pub fn idle_count(&self) -> usize {
        self.workers
            .values()
            .filter(|e| e.state == WorkerState::Idle)
            .count()
    }

    /// One health-check pass: mark stale entries offline and clean up dead
    /// processes, respawning when auto-restart is enabled. The caller acts on
    /// the returned events (failing owned tasks).
    pub async fn check_worker_health(&mut self) -> Vec<HealthEvent> {
        let mut events = Vec::new();
        let now = current_timestamp_secs_f64();
        let timeout = self.comm.worker_timeout_seconds as f64;

        for entry in self.workers.values_mut() {
            if entry.state != WorkerState::Offline && now - entry.last_activity > timeout {
                warn!(
                    "Worker {} appears stale (last activity {:.1}s ago)",
                    entry.worker_id,
                    now - entry.last_activity
                );
                entry.state = WorkerState::Offline;
                events.push(HealthEvent::WorkerStale {
                    worker_id: entry.worker_id.clone(),
                });
            }
        }

        // Process liveness. Dead children are removed and optionally respawned.
        let mut dead_devices = Vec::new();
        for (device_id, handle) in self.processes.iter_mut() {
            match handle.child.try_wait() {
                Ok(Some(status)) => {
                    warn!(
                        "Worker process for device {} has died ({})",
                        device_id, status
                    );
                    dead_devices.push(*device_id);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "Failed to poll worker process for device {}: {}",
                        device_id, e
                    );
                }
            }
        }

        for device_id in dead_devices {
            let worker_id = worker_id_for_device(device_id);
            let owned_task = self
                .workers
                .get(&worker_id)
                .and_then(|e| e.current_task.clone());

            self.remove_process(device_id).await;
            self.workers.remove(&worker_id);

            {
                let mut store = self.store.lock().await;
                if let Err(e) = store
                    .update_worker_status(
                        &worker_id,
                        device_id,
                        WorkerState::Offline,
                        None,
                        0,
                        Some("worker process died"),
                    )
                    .await
                {
                    warn!("Failed to persist death of {}: {}", worker_id, e);
                }
            }

            events.push(HealthEvent::WorkerDied {
                worker_id: worker_id.clone(),
                device_id,
                owned_task,
            });

            if self.pool.auto_start_workers {
                info!("Attempting to restart worker for device {}", device_id);
                if let Err(e) = self.spawn_worker(device_id).await {
                    error!("Failed to restart worker for device {}: {}", device_id, e);
                }
            }
        }

        events
    }

    /// Remove offline entries that have no process and have been silent past
    /// the cleanup grace period.
    pub fn prune_offline(&mut self) {
        let now = current_timestamp_secs_f64();
        let grace = (self.comm.worker_timeout_seconds * OFFLINE_PRUNE_MULTIPLIER) as f64;
        let processes = &self.processes;
        self.workers.retain(|worker_id, entry| {
            let expired = entry.state == WorkerState::Offline
                && now - entry.last_activity > grace
                && !processes.contains_key(&entry.device_id);
            if expired {
                info!("Pruning offline worker {}", worker_id);
            }
            !expired
        });
    }

    /// Drop a process handle, aborting its pumps and unregistering its queue.
    async fn remove_process(&mut self, device_id: u32) {
        if let Some(handle) = self.processes.remove(&device_id) {
            handle.stdin_pump.abort();
            handle.stdout_pump.abort();
            let worker_id = worker_id_for_device(device_id);
            self.bus.lock().await.unregister_worker(&worker_id);
        }
    }

    /// Graceful teardown: shutdown instruction to every live worker, a grace
    /// period to exit, then kill whatever is left.
    pub async fn teardown(&mut self) {
        info!("Stopping all workers");

        let worker_ids: Vec<String> = self
            .processes
            .keys()
            .map(|device_id| worker_id_for_device(*device_id))
            .collect();

        {
            let bus = self.bus.lock().await;
            for worker_id in &worker_ids {
                let message = Message::new(worker_id.clone(), MessagePayload::Shutdown);
                if let Err(e) = bus
                    .send_instruction(worker_id, message, Duration::from_secs(1))
                    .await
                {
                    warn!("Failed to send shutdown to {}: {}", worker_id, e);
                }
            }
        }

        let deadline = Instant::now() + Duration::from_secs(SHUTDOWN_GRACE_SECS);
        loop {
            let mut alive = 0;
            for handle in self.processes.values_mut() {
                if matches!(handle.child.try_wait(), Ok(None)) {
                    alive += 1;
                }
            }
            if alive == 0 || Instant::now() >= deadline {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }

        for (device_id, handle) in self.processes.iter_mut() {
            if matches!(handle.child.try_wait(), Ok(None)) {
                warn!("Killing worker process for device {}", device_id);
                if let Err(e) = handle.child.start_kill() {
                    error!("Failed to kill worker for device {}: {}", device_id, e);
                }
            }
        }

        let devices: Vec<u32> = self.processes.keys().copied().collect();
        for device_id in devices {
            self.remove_process(device_id).await;
        }
        self.workers.clear();

        info!("All workers stopped");
    }

    /// Consistent snapshot of all entries.
    pub fn snapshot(&self) -> Vec<WorkerEntry> {
        self.workers.values().cloned().collect()
    }

    pub fn get(&self, worker_id: &str) -> Option<&WorkerEntry> {
        self.workers.get(worker_id)
    }

    /// Aggregate counters for the API.
    pub fn stats(&self) -> WorkerStats {
        let mut stats = WorkerStats {
            total_workers: self.workers.len(),
            active_processes: self.processes.len(),
            ..Default::default()
        };

        for entry in self.workers.values() {
            *stats
                .status_breakdown
                .entry(entry.state.as_str().to_string())
                .or_insert(0) += 1;
            stats.device_usage.insert(
                entry.device_id,
                DeviceUsage {
                    worker_id: entry.worker_id.clone(),
                    status: entry.state,
                    current_task: entry.current_task.clone(),
                    vram_usage_mb: entry.vram_usage_mb,
                },
            );
        }

        stats
    }

    #[cfg(test)]
    pub(crate) fn insert_process_for_tests(&mut self, device_id: u32, child: Child) {
        self.processes.insert(
            device_id,
            WorkerHandle {
                child,
                stdin_pump: tokio::spawn(async {}),
                stdout_pump: tokio::spawn(async {}),
            },
        );
    }
}

/// Drain a worker's inbound queue into its stdin, one JSON line per message.
async fn run_stdin_pump(
    worker_id: String,
    mut inbound: mpsc::Receiver<Message>,
    mut stdin: ChildStdin,
) {
    while let Some(message) = inbound.recv().await {
        let mut line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode message for {}: {}", worker_id, e);
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            warn!("stdin pipe to {} broke: {}", worker_id, e);
            break;
        }
        if let Err(e) = stdin.flush().await {
            warn!("stdin flush to {} failed: {}", worker_id, e);
            break;
        }
    }
    debug!("stdin pump for {} stopped", worker_id);
}

/// Parse a worker's stdout lines and route them onto the shared outbound
/// queues: results to the results queue, everything else to the status queue.
async fn run_stdout_pump(
    worker_id: String,
    stdout: ChildStdout,
    results_tx: mpsc::Sender<Message>,
    statuses_tx: mpsc::Sender<Message>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Message>(&line) {
                    Ok(message) => {
                        let target = match &message.payload {
                            MessagePayload::Result { .. } => &results_tx,
                            _ => &statuses_tx,
                        };
                        if target.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Unparseable message from {}: {}", worker_id, e);
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("stdout pipe from {} broke: {}", worker_id, e);
                break;
            }
        }
    }
    debug!("stdout pump for {} stopped", worker_id);
}
