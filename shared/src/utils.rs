//! Utility functions for the GPU inference orchestration system
//!
//! This module provides common helpers used across the orchestrator and worker
//! components, including timestamps, task-id minting, and artifact naming.

use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in seconds
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get current Unix timestamp in milliseconds
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Get current Unix timestamp as fractional seconds
///
/// Message envelopes and in-memory task records use fractional timestamps so
/// processing times shorter than one second stay measurable.
pub fn current_timestamp_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Mint a fresh task id for submissions that did not supply one
///
/// Format: `task_<unix seconds>_<4-digit random>`. Uniqueness is ultimately
/// enforced by the Store's primary key; this format merely makes collisions
/// unlikely and ids greppable in logs.
pub fn mint_task_id() -> String {
    let suffix: u32 = rand::rng().random_range(1000..10000);
    format!("task_{}_{}", current_timestamp(), suffix)
}

/// Derive a replacement task id after a duplicate-key conflict
///
/// Format: `<original>_<unix millis>_<attempt>`, matching the id the caller
/// asked for closely enough to remain recognizable.
pub fn derive_task_id(original: &str, attempt: u32) -> String {
    format!("{}_{}_{}", original, current_timestamp_millis(), attempt)
}

/// Build the worker id for a device
///
/// There is at most one worker per device, so the mapping is fixed.
pub fn worker_id_for_device(device_id: u32) -> String {
    format!("worker_{}", device_id)
}

/// Build the artifact file name for a finished generation
///
/// The same name is used by the worker when writing the file and by the
/// orchestrator when surfacing `output_path`, so the two must never diverge.
pub fn artifact_file_name(
    worker_id: &str,
    task_id: &str,
    width: u32,
    height: u32,
    seed: u64,
) -> String {
    format!("{}_{}_{}x{}_s{}.png", worker_id, task_id, width, height, seed)
}

/// Truncate a string to a maximum byte length with an ellipsis
///
/// Used when recording worker error messages so a pathological error cannot
/// bloat the Store. Worker-reported errors carry arbitrary path and OS error
/// text, so the cut must land on a char boundary, never inside a multibyte
/// scalar.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    if max_len <= 3 {
        return "...".to_string();
    }

    let mut cut = max_len - 3;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &s[..cut])
}
