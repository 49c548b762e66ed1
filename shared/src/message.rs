//! Wire messages exchanged between the orchestrator and workers
//!
//! Every message carries an envelope (id, target worker, timestamp) and a
//! typed payload. Instructions name one action out of a closed sum type; the
//! worker matches on the variant, there is no string dispatch.
//!
//! Messages travel as one JSON object per line over the worker's stdio pipes.
//! They are not durable: anything in flight at a crash is lost, and recovery
//! relies on the Store.

use crate::task::{ModelInfo, TaskParams};
use crate::utils::current_timestamp_secs_f64;
use crate::worker::{WorkerCapabilities, WorkerState};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-local counter feeding monotone message ids.
static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// The message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Monotone, timestamped id: `msg_<counter>_<unix seconds>`.
    pub message_id: String,
    /// The worker this message targets (instructions) or originates from
    /// (everything else).
    pub worker_id: String,
    /// Emission time as fractional Unix seconds.
    pub timestamp: f64,
    #[serde(flatten)]
    pub payload: MessagePayload,
}

impl Message {
    /// Build a message with a fresh id and the current timestamp.
    pub fn new(worker_id: impl Into<String>, payload: MessagePayload) -> Self {
        let counter = MESSAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let timestamp = current_timestamp_secs_f64();
        Self {
            message_id: format!("msg_{}_{}", counter, timestamp as u64),
            worker_id: worker_id.into(),
            timestamp,
            payload,
        }
    }
}

/// Typed message payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Worker announces itself after startup.
    Registration {
        device_id: u32,
        capabilities: WorkerCapabilities,
    },
    /// Periodic liveness signal sent while the worker is idle.
    Heartbeat {
        state: WorkerState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_model: Option<String>,
        #[serde(default)]
        vram_usage_mb: u64,
    },
    /// Orchestrator-to-worker command naming one action.
    Instruction { action: Action },
    /// Worker-to-orchestrator lifecycle transition for a task.
    Status { update: StatusUpdate },
    /// Worker-to-orchestrator outcome of one executed action.
    Result { result: ActionResult },
    /// Worker-level error not tied to the status protocol.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        error: String,
    },
    /// Worker announces orderly departure.
    Disconnect { reason: String },
    /// Orchestrator tells the worker to begin graceful teardown.
    Shutdown,
}

/// The closed instruction set workers execute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Read weights from disk into the host RAM staging area.
    LoadModelToRam { model: ModelInfo },
    /// Promote the staged weights to device memory, releasing the staging
    /// copy before returning.
    LoadModelFromRamToVram,
    /// Drop the host staging copy.
    ClearRam,
    /// Drop the device-resident pipeline.
    ClearVram,
    /// Reclaim transient device memory between tasks, keeping the model.
    CleanVram,
    /// Execute one generation with fully pre-configured parameters.
    RunInference { request: InferenceRequest },
    /// Composite: ensure the required model is resident, run inference, then
    /// clean residual device memory, emitting status events around compute.
    RunTask { task: TaskAssignment },
    /// Begin graceful teardown.
    Shutdown,
}

impl Action {
    /// The action's wire name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Action::LoadModelToRam { .. } => "load_model_to_ram",
            Action::LoadModelFromRamToVram => "load_model_from_ram_to_vram",
            Action::ClearRam => "clear_ram",
            Action::ClearVram => "clear_vram",
            Action::CleanVram => "clean_vram",
            Action::RunInference { .. } => "run_inference",
            Action::RunTask { .. } => "run_task",
            Action::Shutdown => "shutdown",
        }
    }
}

/// Parameters for a bare `run_inference` action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InferenceRequest {
    pub task_id: String,
    pub params: TaskParams,
}

/// A dispatched task, with the model catalog row attached by the scheduler so
/// the worker can resolve the weight file without Store access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskAssignment {
    pub task_id: String,
    pub params: TaskParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelInfo>,
}

/// The worker-side lifecycle transitions emitted around `run_task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// Instruction received.
    Accepted,
    /// About to begin the first compute step.
    ProcessingStarted,
    /// Artifact written successfully.
    Completed,
    /// Post-run cleanup done; the worker can take new work.
    Ready,
    /// The task failed inside the worker.
    Error,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Accepted => "accepted",
            StatusKind::ProcessingStarted => "processing_started",
            StatusKind::Completed => "completed",
            StatusKind::Ready => "ready",
            StatusKind::Error => "error",
        }
    }
}

/// Body of a status message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusUpdate {
    pub status: StatusKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one executed action.
///
/// Only the fields relevant to the executed action are populated; the rest
/// stay `None` and are omitted on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ActionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Wall-clock duration of the action in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_usage_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vram_usage_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vram_cleaned_mb: Option<u64>,
    /// The worker's own compute-time measurement for `run_task`. Recorded for
    /// diagnostics; the Store's value is computed by the orchestrator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_secs: Option<f64>,
}

impl ActionResult {
    /// A failed result carrying only an error message.
    pub fn failure(task_id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            task_id,
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_wire_format_uses_action_names() {
        let msg = Message::new("worker_0", MessagePayload::Instruction {
            action: Action::CleanVram,
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"instruction""#));
        assert!(json.contains(r#""action":"clean_vram""#));

        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_status_wire_format_uses_snake_case_kinds() {
        let msg = Message::new("worker_1", MessagePayload::Status {
            update: StatusUpdate {
                status: StatusKind::ProcessingStarted,
                task_id: Some("task_1".to_string()),
                error: None,
            },
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""status":"processing_started""#));
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_message_ids_are_monotone() {
        let a = Message::new("worker_0", MessagePayload::Shutdown);
        let b = Message::new("worker_0", MessagePayload::Shutdown);
        let counter = |m: &Message| -> u64 {
            m.message_id.split('_').nth(1).unwrap().parse().unwrap()
        };
        assert!(counter(&b) > counter(&a));
    }
}
