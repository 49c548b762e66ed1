//! Task types and the task lifecycle state machine
//!
//! A task is immutable after admission: its parameters never change, only its
//! lifecycle status advances. The status state machine is strict and forward
//! only; every transition the orchestrator applies goes through
//! [`TaskStatus::can_transition_to`].

use crate::defaults::*;
use serde::{Deserialize, Serialize};

/// Error kind tags recorded alongside a `failed` transition.
pub mod error_kind {
    /// The owning worker's OS process died while the task was in flight.
    pub const WORKER_DIED: &str = "worker_died";
    /// The orchestrator was restarted while the task was in flight; resolved
    /// by the startup recovery pass.
    pub const ORCHESTRATOR_SHUTDOWN: &str = "orchestrator_shutdown";
    /// The worker reported an error status for the task.
    pub const WORKER_ERROR: &str = "worker_error";
}

/// Lifecycle status of a task.
///
/// `queued → assigned → running → (completed | failed | cancelled)`; once a
/// terminal state is reached the record is immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted and durable, not yet dispatched.
    Queued,
    /// Sent to a worker which has not yet begun compute.
    Assigned,
    /// The worker reported compute start.
    Running,
    /// The worker reported success with an output artifact path.
    Completed,
    /// The worker reported an error, or the orchestrator gave up.
    Failed,
    /// Cancelled before dispatch.
    Cancelled,
}

impl TaskStatus {
    /// The status as its persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the persisted string form back into a status.
    pub fn parse(s: &str) -> Option<TaskStatus> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "assigned" => Some(TaskStatus::Assigned),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether this status is terminal. Terminal records never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the state machine permits advancing from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Queued, Assigned) | (Queued, Cancelled) | (Queued, Failed) => true,
            (Assigned, Running) | (Assigned, Failed) => true,
            // A worker may report a terminal result without the orchestrator
            // having observed the intermediate processing_started event.
            (Assigned, Completed) => true,
            (Running, Completed) | (Running, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generation parameters, immutable after admission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskParams {
    /// Positive prompt. The only mandatory field at admission.
    pub prompt: String,
    /// Negative prompt.
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: String,
    /// Output width in pixels.
    #[serde(default = "default_width")]
    pub width: u32,
    /// Output height in pixels.
    #[serde(default = "default_height")]
    pub height: u32,
    /// Number of sampling steps.
    #[serde(default = "default_steps")]
    pub steps: u32,
    /// Classifier-free guidance scale.
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    /// Seed; `None` means the worker picks a random seed at inference time.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Name of the model to generate with.
    #[serde(default = "default_model_name")]
    pub model_name: String,
}

impl Default for TaskParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: default_negative_prompt(),
            width: default_width(),
            height: default_height(),
            steps: default_steps(),
            guidance_scale: default_guidance_scale(),
            seed: None,
            model_name: default_model_name(),
        }
    }
}

/// A row from the model catalog, attached to dispatched tasks so workers do
/// not need Store access to resolve weight files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelInfo {
    /// Model name, the catalog primary key.
    pub name: String,
    /// Filesystem path of the weight file. Absolute once the scheduler has
    /// resolved it against the configured models root.
    pub path: String,
    /// Weight file size in megabytes, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_mb: Option<u64>,
    /// Unix timestamp of the last successful load, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<i64>,
    /// Number of successful loads recorded for this model.
    #[serde(default)]
    pub usage_count: u64,
}

/// The orchestrator's in-memory view of one task.
///
/// Timestamps are fractional Unix seconds as observed by the orchestrator;
/// the Store keeps its own copies set on the corresponding transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub params: TaskParams,
    pub status: TaskStatus,
    /// The single worker owning this task while `assigned` or `running`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub submitted_at: f64,
    /// When the task was handed to a worker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<f64>,
    /// Worker-emitted `processing_started` timestamp, as carried on the
    /// status message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<f64>,
    /// Timestamp of the terminal transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// Compute duration in seconds, measured from message timestamps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_secs: Option<f64>,
    /// Seed actually used by the worker (differs from `params.seed` only when
    /// that was `None`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed_used: Option<u64>,
}

impl TaskRecord {
    /// Create a fresh record in `queued` state.
    pub fn new(task_id: String, params: TaskParams, submitted_at: f64) -> Self {
        Self {
            task_id,
            params,
            status: TaskStatus::Queued,
            worker_id: None,
            submitted_at,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            output_path: None,
            error_message: None,
            error_kind: None,
            processing_time_secs: None,
            seed_used: None,
        }
    }
}

/// Aggregate task counters served by the API.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskStats {
    pub queued_tasks: usize,
    pub active_tasks: usize,
    pub completed_tasks: usize,
    pub total_processed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Assigned,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn test_forward_transitions_are_permitted() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Assigned));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Assigned.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
    }

    #[test]
    fn test_backward_and_terminal_transitions_are_rejected() {
        assert!(!TaskStatus::Assigned.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Assigned));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Running));
        // Cancellation is only possible before dispatch.
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Assigned.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn test_task_params_defaults_apply_on_deserialize() {
        let params: TaskParams = serde_json::from_str(r#"{"prompt":"a cat"}"#).unwrap();
        assert_eq!(params.width, 832);
        assert_eq!(params.height, 1216);
        assert_eq!(params.steps, 15);
        assert_eq!(params.guidance_scale, 7.0);
        assert_eq!(params.seed, None);
        assert_eq!(params.model_name, "cyberrealistic_pony_v110");
        assert_eq!(params.negative_prompt, "");
    }
}
