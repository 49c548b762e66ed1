//! Worker status types shared by the registry and the worker binary

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Process spawned, registration not yet confirmed.
    Starting,
    /// Registered, no current task.
    Idle,
    /// Owns a task in `assigned` or `running`.
    Busy,
    /// Reported an error and has not yet returned to ready.
    Error,
    /// No heartbeat within the timeout, or the OS process is gone.
    Offline,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Error => "error",
            WorkerState::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<WorkerState> {
        match s {
            "starting" => Some(WorkerState::Starting),
            "idle" => Some(WorkerState::Idle),
            "busy" => Some(WorkerState::Busy),
            "error" => Some(WorkerState::Error),
            "offline" => Some(WorkerState::Offline),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capabilities a worker declares at registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerCapabilities {
    /// The inference pipeline kind this worker runs.
    pub pipeline: String,
    /// Number of tasks the worker processes concurrently. Always 1 in this
    /// version; instructions are executed serially.
    pub max_concurrent_tasks: u32,
}

impl Default for WorkerCapabilities {
    fn default() -> Self {
        Self {
            pipeline: "sdxl".to_string(),
            max_concurrent_tasks: 1,
        }
    }
}

/// Per-device usage entry inside [`WorkerStats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceUsage {
    pub worker_id: String,
    pub status: WorkerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    pub vram_usage_mb: u64,
}

/// Aggregate worker counters served by the API.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkerStats {
    pub total_workers: usize,
    pub active_processes: usize,
    /// Count of workers per status label.
    pub status_breakdown: HashMap<String, usize>,
    /// Usage entry per device id.
    pub device_usage: HashMap<u32, DeviceUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_state_round_trips_through_strings() {
        for state in [
            WorkerState::Starting,
            WorkerState::Idle,
            WorkerState::Busy,
            WorkerState::Error,
            WorkerState::Offline,
        ] {
            assert_eq!(WorkerState::parse(state.as_str()), Some(state));
        }
        assert_eq!(WorkerState::parse("resting"), None);
    }
}
