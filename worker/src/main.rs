//! GPU worker process
//!
//! One worker owns one device. It is spawned by the orchestrator with its
//! stdio pipes wired to the message bus, drains its instruction queue
//! serially, and drives a model-memory state machine plus an inference
//! engine. It holds no durable state: everything worth keeping flows back to
//! the orchestrator as messages.
// Loop layout:
// - instruction reader (stdin), outbound writer (stdout), and idle heartbeat
//   all live in comm.rs, spawned as tasks.
// - the action loop below, which is the only consumer of instructions and
//   the only owner of memory/engine state.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

mod comm;
mod engine;
mod memory;

#[cfg(test)]
mod tests;

use comm::HeartbeatState;
use engine::InferenceEngine;
use memory::ModelMemory;
use shared::config::NodeConfig;
use shared::message::{
    Action, ActionResult, Message, MessagePayload, StatusKind, StatusUpdate, TaskAssignment,
};
use shared::task::ModelInfo;
use shared::utils::worker_id_for_device;
use shared::worker::WorkerCapabilities;

/// Command-line arguments for the worker
#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "Per-device GPU worker that executes generation tasks", long_about = None)]
struct CliArgs {
    /// Path to the JSON configuration file (shared with the orchestrator)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Device id this worker is bound to
    #[arg(long = "device-id", value_name = "ID")]
    device_id: u32,

    /// Custom worker id (defaults to worker_<device_id>)
    #[arg(long = "worker-id", value_name = "ID")]
    worker_id: Option<String>,
}

/// The worker's action-loop state: one device, one memory manager, one
/// engine, and the outbound message channel.
pub struct Worker {
    worker_id: String,
    device_id: u32,
    model_dir: PathBuf,
    memory: ModelMemory,
    engine: InferenceEngine,
    outbound: mpsc::Sender<Message>,
    heartbeat_state: Arc<Mutex<HeartbeatState>>,
}

impl Worker {
    pub fn new(
        worker_id: String,
        device_id: u32,
        config: &NodeConfig,
        outbound: mpsc::Sender<Message>,
        heartbeat_state: Arc<Mutex<HeartbeatState>>,
    ) -> Result<Self> {
        let engine = InferenceEngine::new(
            worker_id.clone(),
            device_id,
            PathBuf::from(&config.paths.output_dir),
        )?;

        Ok(Self {
            worker_id,
            device_id,
            model_dir: PathBuf::from(&config.paths.model_dir),
            memory: ModelMemory::new(device_id),
            engine,
            outbound,
            heartbeat_state,
        })
    }

    async fn send(&self, payload: MessagePayload) {
        let message = Message::new(self.worker_id.clone(), payload);
        if self.outbound.send(message).await.is_err() {
            warn!("Outbound channel closed, dropping message");
        }
    }

    async fn send_status(&self, status: StatusKind, task_id: &str, error: Option<String>) {
        self.send(MessagePayload::Status {
            update: StatusUpdate {
                status,
                task_id: Some(task_id.to_string()),
                error,
            },
        })
        .await;
        info!("Sent status {} for task {}", status.as_str(), task_id);
    }

    async fn send_result(&self, result: ActionResult) {
        self.send(MessagePayload::Result { result }).await;
    }

    /// Announce this worker to the orchestrator.
    pub async fn register(&self) {
        self.send(MessagePayload::Registration {
            device_id: self.device_id,
            capabilities: WorkerCapabilities::default(),
        })
        .await;
        info!("Registration sent for {}", self.worker_id);
    }

    /// Mirror the memory state into the heartbeat snapshot.
    fn sync_heartbeat_state(&self) {
        let mut state = self
            .heartbeat_state
            .lock()
            .expect("heartbeat state lock poisoned");
        state.current_model = self.memory.current_model().map(str::to_string);
        state.vram_usage_mb = self.memory.vram_usage_mb();
    }

    /// Execute one instruction. Returns false when the worker should stop.
    pub async fn handle_action(&mut self, action: Action) -> bool {
        match action {
            Action::Shutdown => {
                info!("Shutdown instruction received, beginning teardown");
                self.memory.clear_ram();
                self.memory.clear_vram();
                self.send(MessagePayload::Disconnect {
                    reason: "shutdown".to_string(),
                })
                .await;
                return false;
            }
            Action::LoadModelToRam { model } => {
                let result = match self.memory.load_model_to_ram(&model) {
                    Ok(stats) => ActionResult {
                        success: true,
                        ram_usage_mb: Some(stats.ram_usage_mb),
                        duration_secs: Some(stats.duration_secs),
                        ..Default::default()
                    },
                    Err(e) => ActionResult::failure(None, e.to_string()),
                };
                self.send_result(result).await;
            }
            Action::LoadModelFromRamToVram => {
                let result = match self.memory.load_model_from_ram_to_vram() {
                    Ok(stats) => ActionResult {
                        success: true,
                        vram_usage_mb: Some(stats.vram_usage_mb),
                        duration_secs: Some(stats.duration_secs),
                        ..Default::default()
                    },
                    Err(e) => ActionResult::failure(None, e.to_string()),
                };
                self.send_result(result).await;
            }
            Action::ClearRam => {
                self.memory.clear_ram();
                self.send_result(ActionResult {
                    success: true,
                    ..Default::default()
                })
                .await;
            }
            Action::ClearVram => {
                self.memory.clear_vram();
                self.send_result(ActionResult {
                    success: true,
                    ..Default::default()
                })
                .await;
            }
            Action::CleanVram => {
                let cleaned = self.memory.clean_vram();
                self.send_result(ActionResult {
                    success: true,
                    vram_cleaned_mb: Some(cleaned),
                    ..Default::default()
                })
                .await;
            }
            Action::RunInference { request } => {
                let resident = self.memory.resident_model().map(str::to_string);
                let outcome = self
                    .engine
                    .run(&request.task_id, &request.params, resident.as_deref())
                    .await;
                let result = match outcome {
                    Ok(outcome) => {
                        self.memory
                            .note_inference_residuals(request.params.width, request.params.height);
                        ActionResult {
                            task_id: Some(request.task_id.clone()),
                            success: true,
                            output_path: Some(outcome.output_path),
                            seed: Some(outcome.seed),
                            duration_secs: Some(outcome.duration_secs),
                            ..Default::default()
                        }
                    }
                    Err(e) => ActionResult::failure(Some(request.task_id.clone()), e.to_string()),
                };
                self.send_result(result).await;
            }
            Action::RunTask { task } => {
                self.run_complete_task(task).await;
            }
        }

        self.sync_heartbeat_state();
        true
    }

    /// Make the task's model VRAM-resident, replacing whatever was loaded.
    fn ensure_model(&mut self, task: &TaskAssignment) -> Result<()> {
        let model_info = task.model.clone().unwrap_or_else(|| {
            let path = self
                .model_dir
                .join(format!("{}.safetensors", task.params.model_name));
            ModelInfo {
                name: task.params.model_name.clone(),
                path: path.to_string_lossy().into_owned(),
                size_mb: None,
                last_used: None,
                usage_count: 0,
            }
        });

        if self.memory.resident_model() == Some(model_info.name.as_str()) {
            return Ok(());
        }

        if self.memory.resident_model().is_some() {
            info!(
                "Swapping resident model for {} on device {}",
                model_info.name, self.device_id
            );
            self.memory.clear_vram();
        }

        self.memory
            .load_model_to_ram(&model_info)
            .with_context(|| format!("Failed to load model {} to RAM", model_info.name))?;
        self.memory
            .load_model_from_ram_to_vram()
            .with_context(|| format!("Failed to move model {} to VRAM", model_info.name))?;
        Ok(())
    }

    /// The composite task flow: `accepted`, model preparation,
    /// `processing_started`, inference, residual cleanup, the final result,
    /// `completed`, `ready`. Failures emit `error` and still return the
    /// worker to `ready` after best-effort cleanup.
    async fn run_complete_task(&mut self, task: TaskAssignment) {
        let task_id = task.task_id.clone();
        self.send_status(StatusKind::Accepted, &task_id, None).await;

        if let Err(e) = self.ensure_model(&task) {
            let error = format!("{:#}", e);
            error!("Task {} model preparation failed: {}", task_id, error);
            self.send_result(ActionResult::failure(Some(task_id.clone()), error.clone()))
                .await;
            self.send_status(StatusKind::Error, &task_id, Some(error)).await;
            self.memory.clear_ram();
            self.send_status(StatusKind::Ready, &task_id, None).await;
            return;
        }

        self.send_status(StatusKind::ProcessingStarted, &task_id, None)
            .await;

        let compute_start = Instant::now();
        let resident = self.memory.resident_model().map(str::to_string);
        let outcome = self
            .engine
            .run(&task_id, &task.params, resident.as_deref())
            .await;
        match outcome {
            Ok(outcome) => {
                self.memory
                    .note_inference_residuals(task.params.width, task.params.height);
                self.memory.clean_vram();

                self.send_result(ActionResult {
                    task_id: Some(task_id.clone()),
                    success: true,
                    output_path: Some(outcome.output_path),
                    seed: Some(outcome.seed),
                    duration_secs: Some(outcome.duration_secs),
                    processing_time_secs: Some(compute_start.elapsed().as_secs_f64()),
                    ..Default::default()
                })
                .await;
                self.send_status(StatusKind::Completed, &task_id, None).await;
                self.send_status(StatusKind::Ready, &task_id, None).await;
            }
            Err(e) => {
                let error = e.to_string();
                error!("Task {} failed: {}", task_id, error);
                self.send_result(ActionResult::failure(Some(task_id.clone()), error.clone()))
                    .await;
                self.send_status(StatusKind::Error, &task_id, Some(error)).await;
                self.memory.clean_vram();
                self.send_status(StatusKind::Ready, &task_id, None).await;
            }
        }
    }
}

/// Worker entry point.
#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();
    let worker_id = cli_args
        .worker_id
        .unwrap_or_else(|| worker_id_for_device(cli_args.device_id));

    let config = NodeConfig::load(&cli_args.config_file)?;

    // File-only logging: stdout carries the message protocol.
    let file_appender = tracing_appender::rolling::daily(
        &config.paths.log_dir,
        format!("{}.log", worker_id),
    );
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("worker=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    info!(
        "Worker {} starting for device {}",
        worker_id, cli_args.device_id
    );

    let (outbound_tx, outbound_rx) = mpsc::channel::<Message>(256);
    let (actions_tx, mut actions_rx) = mpsc::channel::<Action>(64);
    let busy = Arc::new(AtomicBool::new(false));
    let heartbeat_state = Arc::new(Mutex::new(HeartbeatState::default()));

    let writer_task = tokio::spawn(comm::run_message_writer(outbound_rx));
    let reader_task = tokio::spawn(comm::run_instruction_reader(
        worker_id.clone(),
        actions_tx.clone(),
    ));
    let heartbeat_task = tokio::spawn(comm::run_heartbeat_loop(
        worker_id.clone(),
        outbound_tx.clone(),
        Arc::clone(&busy),
        Arc::clone(&heartbeat_state),
        config.communication.heartbeat_interval_seconds,
    ));

    let mut worker = Worker::new(
        worker_id.clone(),
        cli_args.device_id,
        &config,
        outbound_tx.clone(),
        Arc::clone(&heartbeat_state),
    )?;
    worker.register().await;

    // The action loop: strictly serial, one instruction at a time.
    while let Some(action) = actions_rx.recv().await {
        busy.store(true, Ordering::Relaxed);
        let keep_going = worker.handle_action(action).await;
        busy.store(false, Ordering::Relaxed);
        if !keep_going {
            break;
        }
    }

    // Stop the producers, then let the writer drain the final messages.
    reader_task.abort();
    heartbeat_task.abort();
    drop(worker);
    drop(actions_tx);
    drop(outbound_tx);
    if tokio::time::timeout(std::time::Duration::from_secs(5), writer_task)
        .await
        .is_err()
    {
        warn!("Message writer did not drain in time");
    }

    info!("Worker {} shutdown complete", worker_id);
    Ok(())
}
