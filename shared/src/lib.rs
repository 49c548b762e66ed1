//! Shared data structures and utilities for the GPU inference orchestration
//! system
//!
//! This crate contains the task and worker types, the orchestrator/worker
//! wire protocol, configuration structures, and utilities used by both the
//! orchestrator and worker binaries.

pub mod config;
pub mod defaults;
pub mod message;
pub mod task;
pub mod utils;
pub mod worker;

// Re-export commonly used types for convenience
pub use config::NodeConfig;
pub use message::{Action, ActionResult, Message, MessagePayload, StatusKind, StatusUpdate};
pub use task::{ModelInfo, TaskParams, TaskRecord, TaskStats, TaskStatus};
pub use utils::{current_timestamp, mint_task_id, worker_id_for_device};
pub use worker::{WorkerCapabilities, WorkerState, WorkerStats};

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;
