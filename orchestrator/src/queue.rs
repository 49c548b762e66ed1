//! FIFO task queue and in-memory task records
//!
//! Holds accepted-but-undispatched tasks in submission order plus the mirrors
//! of active and completed tasks. A task id lives in exactly one of
//! {pending, active, completed} at any time; movement between the three is
//! the only mutation and always goes through the methods here, which makes
//! the lifecycle invariants checkable in one place.

use crate::store::{CreateTaskOutcome, Store};
use shared::task::{TaskParams, TaskRecord, TaskStats, TaskStatus};
use shared::utils::{current_timestamp_secs_f64, derive_task_id, mint_task_id};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Maximum attempts at deriving a unique task id before giving up.
const MAX_ID_ATTEMPTS: u32 = 5;

/// Admission failures surfaced to the API caller. Not recorded in the Store.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Failed to create a unique task id after {0} attempts")]
    DuplicateTaskId(u32),
}

/// The task queue plus active/completed record mirrors.
pub struct TaskQueue {
    store: Arc<Mutex<Store>>,
    /// Accepted tasks awaiting dispatch, oldest first.
    pending: VecDeque<TaskRecord>,
    /// Tasks popped for dispatch, assigned, or running.
    active: HashMap<String, TaskRecord>,
    /// Terminal tasks, bounded by the periodic cleanup.
    completed: HashMap<String, TaskRecord>,
    /// Lifetime count of tasks that reached a terminal state.
    total_processed: usize,
}

impl TaskQueue {
    pub fn new(store: Arc<Mutex<Store>>) -> Self {
        Self {
            store,
            pending: VecDeque::new(),
            active: HashMap::new(),
            completed: HashMap::new(),
            total_processed: 0,
        }
    }

    /// Admit a task: make it durable under a unique id and enqueue it.
    ///
    /// When the requested id (or a minted one) collides, the id is re-derived
    /// with a timestamp suffix up to [`MAX_ID_ATTEMPTS`] times. A Store
    /// outage does not block admission; the task proceeds in memory and the
    /// durable row is caught up by later status writes.
    pub async fn submit(
        &mut self,
        task_id: Option<String>,
        params: TaskParams,
    ) -> Result<String, AdmissionError> {
        let original_id = task_id.unwrap_or_else(mint_task_id);
        let mut candidate = original_id.clone();

        let mut attempts = 0;
        loop {
            if attempts >= MAX_ID_ATTEMPTS {
                return Err(AdmissionError::DuplicateTaskId(attempts));
            }

            // The in-memory maps are authoritative while a Store outage
            // lasts, so collisions must be caught here as well.
            if self.knows(&candidate) {
                candidate = derive_task_id(&original_id, attempts);
                attempts += 1;
                continue;
            }

            let outcome = {
                let mut store = self.store.lock().await;
                store.create_task(&candidate, &params).await
            };

            match outcome {
                Ok(CreateTaskOutcome::Created) => break,
                Ok(CreateTaskOutcome::Duplicate) => {
                    warn!(
                        "Task id {} already exists in store, deriving a new id",
                        candidate
                    );
                    candidate = derive_task_id(&original_id, attempts);
                    attempts += 1;
                }
                Err(e) => {
                    warn!(
                        "Store unavailable during admission of {}: {} (continuing in memory)",
                        candidate, e
                    );
                    break;
                }
            }
        }

        let record = TaskRecord::new(candidate.clone(), params, current_timestamp_secs_f64());
        self.pending.push_back(record);
        info!("Task {} submitted ({} queued)", candidate, self.pending.len());
        Ok(candidate)
    }

    /// Re-enqueue a durable `queued` row at startup recovery.
    pub fn restore(&mut self, record: TaskRecord) {
        if !self.knows(&record.task_id) {
            debug!("Restored task {} from store", record.task_id);
            self.pending.push_back(record);
        }
    }

    /// Pop the next task for dispatch. The record moves to the active map
    /// (still `queued`) so its id stays in exactly one container.
    pub fn next(&mut self) -> Option<TaskRecord> {
        let record = self.pending.pop_front()?;
        self.active.insert(record.task_id.clone(), record.clone());
        Some(record)
    }

    /// Undo a failed dispatch: the task returns to the head of the queue.
    pub fn requeue_front(&mut self, task_id: &str) {
        if let Some(mut record) = self.active.remove(task_id) {
            record.status = TaskStatus::Queued;
            record.worker_id = None;
            record.assigned_at = None;
            self.pending.push_front(record);
            debug!("Task {} re-queued at head after dispatch failure", task_id);
        }
    }

    /// Mark a popped task as handed to a worker.
    pub fn assign(&mut self, task_id: &str, worker_id: &str) -> bool {
        match self.active.get_mut(task_id) {
            Some(record) if record.status.can_transition_to(TaskStatus::Assigned) => {
                record.status = TaskStatus::Assigned;
                record.worker_id = Some(worker_id.to_string());
                record.assigned_at = Some(current_timestamp_secs_f64());
                true
            }
            Some(record) => {
                warn!(
                    "Refusing to assign task {} in status {}",
                    task_id, record.status
                );
                false
            }
            None => {
                warn!("Task {} not found for assignment", task_id);
                false
            }
        }
    }

    /// Record the worker's `processing_started` event. `started_at` keeps the
    /// message's own timestamp so processing time is measured from worker
    /// emission times, not orchestrator poll times.
    pub fn mark_running(&mut self, task_id: &str, message_timestamp: f64) -> Option<&TaskRecord> {
        match self.active.get_mut(task_id) {
            Some(record) if record.status.can_transition_to(TaskStatus::Running) => {
                record.status = TaskStatus::Running;
                record.started_at = Some(message_timestamp);
                Some(record)
            }
            Some(record) => {
                debug!(
                    "Ignoring processing_started for task {} in status {}",
                    task_id, record.status
                );
                None
            }
            None => {
                warn!("processing_started for unknown task {}", task_id);
                None
            }
        }
    }

    /// Apply the terminal `completed` transition and move the record to the
    /// completed map. Returns the final record for the durable write.
    pub fn complete(
        &mut self,
        task_id: &str,
        output_path: String,
        seed_used: Option<u64>,
        completed_at: f64,
    ) -> Option<TaskRecord> {
        let record = self.active.get_mut(task_id)?;
        if !record.status.can_transition_to(TaskStatus::Completed) {
            warn!(
                "Ignoring completion for task {} in status {}",
                task_id, record.status
            );
            return None;
        }

        record.status = TaskStatus::Completed;
        record.completed_at = Some(completed_at);
        record.output_path = Some(output_path);
        record.seed_used = seed_used;
        record.processing_time_secs = record
            .started_at
            .or(record.assigned_at)
            .map(|start| (completed_at - start).max(0.0));

        let record = self.active.remove(task_id)?;
        self.total_processed += 1;
        self.completed.insert(task_id.to_string(), record.clone());
        Some(record)
    }

    /// Apply the terminal `failed` transition. Works from any non-terminal
    /// status; a task can fail before its worker ever started compute.
    pub fn fail(
        &mut self,
        task_id: &str,
        error: String,
        kind: &'static str,
    ) -> Option<TaskRecord> {
        let record = self.active.get_mut(task_id)?;
        if !record.status.can_transition_to(TaskStatus::Failed) {
            warn!(
                "Ignoring failure for task {} in status {}",
                task_id, record.status
            );
            return None;
        }

        record.status = TaskStatus::Failed;
        record.completed_at = Some(current_timestamp_secs_f64());
        record.error_message = Some(error);
        record.error_kind = Some(kind.to_string());

        let record = self.active.remove(task_id)?;
        self.total_processed += 1;
        self.completed.insert(task_id.to_string(), record.clone());
        Some(record)
    }

    /// Cancel a still-queued task. Removes it from the pending deque so a
    /// cancelled task can never be dispatched. Returns false for tasks that
    /// are already dispatched, terminal, or unknown.
    pub fn cancel(&mut self, task_id: &str) -> bool {
        let position = self.pending.iter().position(|r| r.task_id == task_id);
        let mut record = match position {
            Some(idx) => self
                .pending
                .remove(idx)
                .expect("position was just found in the deque"),
            None => {
                // A task popped for dispatch this tick is still queued until
                // the assign mark lands; it is cancellable in that window.
                match self.active.get(task_id) {
                    Some(r) if r.status == TaskStatus::Queued => {
                        self.active.remove(task_id).expect("entry checked above")
                    }
                    _ => {
                        warn!("Task {} not cancellable", task_id);
                        return false;
                    }
                }
            }
        };

        record.status = TaskStatus::Cancelled;
        record.completed_at = Some(current_timestamp_secs_f64());
        self.total_processed += 1;
        self.completed.insert(task_id.to_string(), record);
        info!("Task {} cancelled", task_id);
        true
    }

    /// Look up a task in whichever container currently holds it.
    pub fn get(&self, task_id: &str) -> Option<&TaskRecord> {
        self.active
            .get(task_id)
            .or_else(|| self.completed.get(task_id))
            .or_else(|| self.pending.iter().find(|r| r.task_id == task_id))
    }

    /// Whether any container holds this id.
    pub fn knows(&self, task_id: &str) -> bool {
        self.get(task_id).is_some()
    }

    /// Tasks currently owned by a worker (assigned or running).
    pub fn tasks_owned_by(&self, worker_id: &str) -> Vec<String> {
        self.active
            .values()
            .filter(|r| r.worker_id.as_deref() == Some(worker_id) && !r.status.is_terminal())
            .map(|r| r.task_id.clone())
            .collect()
    }

    pub fn queued_count(&self) -> usize {
        self.pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn stats(&self) -> TaskStats {
        TaskStats {
            queued_tasks: self.pending.len(),
            active_tasks: self.active.len(),
            completed_tasks: self.completed.len(),
            total_processed: self.total_processed,
        }
    }

    /// Drop completed records older than `max_age_secs`. The durable rows
    /// outlive these mirrors; this only bounds memory.
    pub fn cleanup(&mut self, max_age_secs: u64) {
        let cutoff = current_timestamp_secs_f64() - max_age_secs as f64;
        let before = self.completed.len();
        self.completed
            .retain(|_, record| record.completed_at.unwrap_or(record.submitted_at) >= cutoff);
        let removed = before - self.completed.len();
        if removed > 0 {
            debug!("Dropped {} old completed task record(s)", removed);
        }
    }
}
