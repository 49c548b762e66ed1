//! The dispatch loop at the center of the orchestrator
//!
//! The scheduler is the single hub: workers send events, every other
//! component is called from here by method. Each tick it drains worker
//! events, applies them to the Store and the in-memory state, then dispatches
//! at most one queued task to the best idle worker. Dispatch marks are
//! applied in memory before the instruction is put on the bus and reverted if
//! the put fails, so a task and a worker can never disagree about ownership.

use crate::bus::MessageBus;
use crate::queue::TaskQueue;
use crate::registry::WorkerRegistry;
use crate::store::Store;
use anyhow::Result;
use shared::config::{ProcessingConfig, StoreConfig};
use shared::message::{Action, Message, MessagePayload, StatusKind, StatusUpdate, TaskAssignment};
use shared::task::{error_kind, ModelInfo, TaskStatus};
use shared::utils::{current_timestamp_secs_f64, truncate_string};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on messages drained from each outbound queue per tick.
const DRAIN_LIMIT: usize = 256;

/// Upper bound a recorded error message may occupy in the Store.
const MAX_ERROR_LEN: usize = 512;

/// A terminal `completed` write that has not yet succeeded in the Store.
///
/// A task is never surfaced as completed before its terminal write has
/// succeeded at least once, so on Store failure the completion is parked here
/// and retried every tick.
#[derive(Debug, Clone)]
struct PendingCompletion {
    task_id: String,
    worker_id: String,
    output_path: String,
    seed: Option<u64>,
    completed_at: f64,
}

pub struct Scheduler {
    store: Arc<Mutex<Store>>,
    queue: Arc<Mutex<TaskQueue>>,
    registry: Arc<Mutex<WorkerRegistry>>,
    bus: Arc<Mutex<MessageBus>>,
    processing: ProcessingConfig,
    store_config: StoreConfig,
    model_dir: PathBuf,
    deferred_completions: Vec<PendingCompletion>,
    last_cleanup: f64,
}

impl Scheduler {
    pub fn new(
        store: Arc<Mutex<Store>>,
        queue: Arc<Mutex<TaskQueue>>,
        registry: Arc<Mutex<WorkerRegistry>>,
        bus: Arc<Mutex<MessageBus>>,
        processing: ProcessingConfig,
        store_config: StoreConfig,
        model_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            bus,
            processing,
            store_config,
            model_dir,
            deferred_completions: Vec::new(),
            last_cleanup: current_timestamp_secs_f64(),
        }
    }

    /// One scheduler tick.
    pub async fn tick(&mut self) -> Result<()> {
        self.retry_deferred_completions().await;

        // Statuses before results: processing_started must be observed
        // before the final result of the same task so processing time can be
        // measured from the worker's own emission timestamps.
        let statuses = self.bus.lock().await.drain_statuses(DRAIN_LIMIT);
        for message in statuses {
            self.handle_status_message(message).await;
        }

        let results = self.bus.lock().await.drain_results(DRAIN_LIMIT);
        for message in results {
            self.handle_result_message(message).await;
        }

        self.dispatch_next().await;
        self.maybe_cleanup().await;

        Ok(())
    }

    /// Re-enqueue durable state at startup: interrupted tasks are failed and
    /// still-queued rows come back onto the in-memory queue.
    pub async fn recover_from_store(&mut self) -> Result<()> {
        let mut store = self.store.lock().await;
        store.recover_interrupted_tasks().await?;

        let pending = store.get_pending_tasks(256).await?;
        drop(store);

        let mut restored = 0;
        let mut queue = self.queue.lock().await;
        for row in pending {
            if row.status == TaskStatus::Queued.as_str() {
                let record = shared::task::TaskRecord::new(
                    row.task_id.clone(),
                    row.params(),
                    row.submit_time,
                );
                queue.restore(record);
                restored += 1;
            }
        }
        if restored > 0 {
            info!("Restored {} queued task(s) from store", restored);
        }
        Ok(())
    }

    // ========== Worker events ==========

    async fn handle_status_message(&mut self, message: Message) {
        let worker_id = message.worker_id.clone();
        match message.payload {
            MessagePayload::Registration {
                device_id,
                capabilities,
            } => {
                let mut registry = self.registry.lock().await;
                registry.register(&worker_id, device_id, capabilities).await;
            }
            MessagePayload::Heartbeat {
                current_model,
                vram_usage_mb,
                ..
            } => {
                let mut registry = self.registry.lock().await;
                registry.heartbeat(&worker_id, current_model, vram_usage_mb);
            }
            MessagePayload::Status { update } => {
                self.handle_status_update(&worker_id, update, message.timestamp)
                    .await;
            }
            MessagePayload::Error { task_id, error } => {
                warn!("Worker {} reported error: {}", worker_id, error);
                if let Some(task_id) = task_id {
                    self.fail_task(&task_id, &error, error_kind::WORKER_ERROR)
                        .await;
                }
                self.registry.lock().await.mark_error(&worker_id, &error).await;
            }
            MessagePayload::Disconnect { reason } => {
                info!("Worker {} disconnected: {}", worker_id, reason);
                self.registry.lock().await.mark_offline(&worker_id).await;
            }
            other => {
                debug!(
                    "Unexpected payload on status queue from {}: {:?}",
                    worker_id, other
                );
            }
        }
    }

    /// Apply one worker status event per the callback table.
    async fn handle_status_update(
        &mut self,
        worker_id: &str,
        update: StatusUpdate,
        message_timestamp: f64,
    ) {
        self.registry.lock().await.touch(worker_id);

        match update.status {
            StatusKind::Accepted => {
                debug!(
                    "Worker {} accepted task {:?}",
                    worker_id, update.task_id
                );
            }
            StatusKind::ProcessingStarted => {
                let Some(task_id) = update.task_id else {
                    warn!("processing_started from {} without task id", worker_id);
                    return;
                };
                let marked = self
                    .queue
                    .lock()
                    .await
                    .mark_running(&task_id, message_timestamp)
                    .is_some();
                if marked {
                    let mut store = self.store.lock().await;
                    if let Err(e) = store
                        .update_task_status(
                            &task_id,
                            TaskStatus::Running,
                            Some(worker_id),
                            None,
                            None,
                            None,
                            None,
                        )
                        .await
                    {
                        warn!("Failed to persist running status for {}: {}", task_id, e);
                    }
                }
            }
            StatusKind::Completed => {
                // The terminal transition is applied when the result message
                // (which carries the artifact path) is handled; this event is
                // the worker-side acknowledgement.
                debug!(
                    "Worker {} reports task {:?} completed",
                    worker_id, update.task_id
                );
            }
            StatusKind::Ready => {
                self.registry.lock().await.mark_idle(worker_id).await;
            }
            StatusKind::Error => {
                let error = update
                    .error
                    .unwrap_or_else(|| "unknown worker error".to_string());
                warn!("Worker {} error: {}", worker_id, error);
                if let Some(task_id) = update.task_id {
                    self.fail_task(&task_id, &error, error_kind::WORKER_ERROR)
                        .await;
                }
                self.registry.lock().await.mark_error(worker_id, &error).await;
            }
        }
    }

    async fn handle_result_message(&mut self, message: Message) {
        let result = match message.payload {
            MessagePayload::Result { result } => result,
            other => {
                debug!("Non-result payload on results queue: {:?}", other);
                return;
            }
        };

        let Some(task_id) = result.task_id.clone() else {
            debug!(
                "Result without task id from {} (administrative action)",
                message.worker_id
            );
            return;
        };

        if result.success {
            let Some(output_path) = result.output_path.clone() else {
                warn!(
                    "Successful result for task {} carries no output path",
                    task_id
                );
                self.fail_task(&task_id, "worker returned no output path", error_kind::WORKER_ERROR)
                    .await;
                return;
            };

            let completion = PendingCompletion {
                task_id,
                worker_id: message.worker_id,
                output_path,
                seed: result.seed,
                completed_at: message.timestamp,
            };
            if !self.finalize_completion(&completion).await {
                self.deferred_completions.push(completion);
            }
        } else {
            let error = result
                .error
                .unwrap_or_else(|| "unknown worker error".to_string());
            self.fail_task(&task_id, &error, error_kind::WORKER_ERROR).await;
        }
    }

    /// Attempt the terminal write and, only once it has succeeded, surface
    /// the task as completed in memory. Returns false when the Store write
    /// failed and the completion must be retried.
    async fn finalize_completion(&mut self, completion: &PendingCompletion) -> bool {
        let (processing_time, model_name) = {
            let queue = self.queue.lock().await;
            match queue.get(&completion.task_id) {
                Some(record) => (
                    record
                        .started_at
                        .or(record.assigned_at)
                        .map(|start| (completion.completed_at - start).max(0.0)),
                    Some(record.params.model_name.clone()),
                ),
                None => (None, None),
            }
        };

        {
            let mut store = self.store.lock().await;
            if let Err(e) = store
                .update_task_status(
                    &completion.task_id,
                    TaskStatus::Completed,
                    Some(&completion.worker_id),
                    Some(&completion.output_path),
                    None,
                    None,
                    processing_time,
                )
                .await
            {
                warn!(
                    "Terminal write for task {} failed, will retry: {}",
                    completion.task_id, e
                );
                return false;
            }

            if let Some(model_name) = &model_name {
                if let Err(e) = store.touch_model_usage(model_name).await {
                    debug!("Failed to bump usage for model {}: {}", model_name, e);
                }
            }
        }

        let record = self.queue.lock().await.complete(
            &completion.task_id,
            completion.output_path.clone(),
            completion.seed,
            completion.completed_at,
        );
        if let Some(record) = record {
            info!(
                "Task {} completed by {} in {:.2}s",
                completion.task_id,
                completion.worker_id,
                record.processing_time_secs.unwrap_or_default()
            );
        }
        true
    }

    async fn retry_deferred_completions(&mut self) {
        if self.deferred_completions.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.deferred_completions);
        for completion in pending {
            if !self.finalize_completion(&completion).await {
                self.deferred_completions.push(completion);
            }
        }
    }

    /// Fail a task in memory and best-effort in the Store.
    async fn fail_task(&mut self, task_id: &str, error: &str, kind: &'static str) {
        let error = truncate_string(error, MAX_ERROR_LEN);
        let failed = {
            let mut queue = self.queue.lock().await;
            queue.fail(task_id, error.clone(), kind)
        };

        if failed.is_some() {
            info!("Task {} failed: {}", task_id, error);
        }

        let mut store = self.store.lock().await;
        if let Err(e) = store
            .update_task_status(
                task_id,
                TaskStatus::Failed,
                None,
                None,
                Some(&error),
                Some(kind),
                None,
            )
            .await
        {
            warn!("Failed to persist failure of {}: {}", task_id, e);
        }
    }

    // ========== Dispatch ==========

    /// Dispatch the head of the queue to the best idle worker, if both exist.
    async fn dispatch_next(&mut self) {
        {
            let queue = self.queue.lock().await;
            let registry = self.registry.lock().await;
            if queue.queued_count() == 0 || registry.idle_count() == 0 {
                return;
            }
        }

        let Some(task) = self.queue.lock().await.next() else {
            return;
        };
        let task_id = task.task_id.clone();

        let Some(worker_id) = self.registry.lock().await.find_optimal_worker() else {
            self.queue.lock().await.requeue_front(&task_id);
            return;
        };

        let model = self.resolve_model(&task.params.model_name).await;

        // Both marks land in memory before the put; a put failure reverts
        // them and the task goes back to the head of the queue. An assign
        // refusal means the task stopped being dispatchable (cancelled in the
        // pop window) and is simply dropped from dispatch.
        if !self.queue.lock().await.assign(&task_id, &worker_id) {
            return;
        }
        if !self.registry.lock().await.mark_busy(&worker_id, &task_id) {
            self.queue.lock().await.requeue_front(&task_id);
            return;
        }

        let assignment = TaskAssignment {
            task_id: task_id.clone(),
            params: task.params.clone(),
            model: Some(model),
        };
        let message = Message::new(
            worker_id.clone(),
            MessagePayload::Instruction {
                action: Action::RunTask { task: assignment },
            },
        );

        let put_timeout = Duration::from_millis(self.processing.scheduler_interval_ms);
        let put = {
            let bus = self.bus.lock().await;
            bus.send_instruction(&worker_id, message, put_timeout).await
        };

        match put {
            Ok(()) => {
                info!("Task {} dispatched to {}", task_id, worker_id);
                let mut store = self.store.lock().await;
                if let Err(e) = store
                    .update_task_status(
                        &task_id,
                        TaskStatus::Assigned,
                        Some(&worker_id),
                        None,
                        None,
                        None,
                        None,
                    )
                    .await
                {
                    warn!("Failed to persist assignment of {}: {}", task_id, e);
                }
            }
            Err(e) => {
                warn!(
                    "Dispatch of {} to {} failed, reverting marks: {}",
                    task_id, worker_id, e
                );
                self.queue.lock().await.requeue_front(&task_id);
                self.registry.lock().await.mark_idle(&worker_id).await;
            }
        }
    }

    /// Attach the model catalog row for a dispatch, resolving relative paths
    /// against the configured models root. Unknown models fall back to the
    /// conventional `<model_dir>/<name>.safetensors` location.
    async fn resolve_model(&mut self, model_name: &str) -> ModelInfo {
        let catalog_row = {
            let mut store = self.store.lock().await;
            store.get_model(model_name).await.unwrap_or_else(|e| {
                warn!("Model lookup for {} failed: {}", model_name, e);
                None
            })
        };

        let mut info = catalog_row.unwrap_or_else(|| {
            let path = self.model_dir.join(format!("{}.safetensors", model_name));
            debug!(
                "No catalog row for model {}, assuming {}",
                model_name,
                path.display()
            );
            ModelInfo {
                name: model_name.to_string(),
                path: path.to_string_lossy().into_owned(),
                size_mb: None,
                last_used: None,
                usage_count: 0,
            }
        });

        if Path::new(&info.path).is_relative() {
            info.path = self
                .model_dir
                .join(&info.path)
                .to_string_lossy()
                .into_owned();
        }

        if info.size_mb.is_none() {
            if let Ok(meta) = std::fs::metadata(&info.path) {
                info.size_mb = Some(meta.len() / (1024 * 1024));
            }
        }

        info
    }

    // ========== Periodic maintenance ==========

    async fn maybe_cleanup(&mut self) {
        let now = current_timestamp_secs_f64();
        if now - self.last_cleanup < self.processing.cleanup_interval_seconds as f64 {
            return;
        }
        self.last_cleanup = now;

        debug!("Running periodic cleanup");
        self.queue
            .lock()
            .await
            .cleanup(self.processing.completed_task_retention_hours * 3600);

        self.registry.lock().await.prune_offline();

        let mut store = self.store.lock().await;
        if let Err(e) = store
            .cleanup_old_records(self.store_config.retention_days)
            .await
        {
            warn!("Store cleanup failed: {}", e);
        }
    }
}
