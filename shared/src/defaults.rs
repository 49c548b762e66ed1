//! Default values for configuration parameters and task admission
//!
//! This module centralizes all default value functions used by the
//! configuration and task structures. These functions are used by serde when
//! deserializing files or request bodies that don't specify optional fields.

// Task admission defaults

/// Default negative prompt (empty; callers may supply their own)
pub fn default_negative_prompt() -> String {
    String::new()
}

/// Default output width in pixels
pub fn default_width() -> u32 {
    832
}

/// Default output height in pixels
pub fn default_height() -> u32 {
    1216
}

/// Default number of sampling steps
pub fn default_steps() -> u32 {
    15
}

/// Default classifier-free guidance scale
pub fn default_guidance_scale() -> f64 {
    7.0
}

/// Default model used when a task does not name one
pub fn default_model_name() -> String {
    "cyberrealistic_pony_v110".to_string()
}

// API defaults

/// Default API bind host
pub fn default_api_host() -> String {
    "127.0.0.1".to_string()
}

/// Default API bind port
pub fn default_api_port() -> u16 {
    8080
}

// Worker pool defaults

/// Default list of device ids to spawn workers for
pub fn default_device_list() -> Vec<u32> {
    vec![0]
}

/// Workers are spawned automatically at startup by default
pub fn default_auto_start_workers() -> bool {
    true
}

/// Workers are spawned in parallel by default
pub fn default_parallel_worker_spawn() -> bool {
    true
}

/// Default delay between sequential worker spawns (milliseconds)
pub fn default_worker_spawn_delay_ms() -> u64 {
    100
}

// Communication defaults

/// Default worker heartbeat timeout (seconds)
pub fn default_worker_timeout() -> u64 {
    60
}

/// Default interval between idle-worker heartbeats (seconds)
pub fn default_heartbeat_interval() -> u64 {
    10
}

/// Default timeout for a single message-bus put (seconds)
pub fn default_message_timeout() -> u64 {
    30
}

/// Default number of retry attempts for transient communication failures
pub fn default_retry_attempts() -> u32 {
    3
}

// Processing defaults

/// Default task timeout, reported but never enforced by interruption (seconds)
pub fn default_task_timeout() -> u64 {
    300
}

/// Default scheduler tick cadence (milliseconds)
pub fn default_scheduler_interval_ms() -> u64 {
    100
}

/// Default interval between periodic cleanup passes (seconds)
pub fn default_cleanup_interval() -> u64 {
    300
}

/// Default age bound for in-memory completed task records (hours)
pub fn default_completed_task_retention_hours() -> u64 {
    24
}

// Path defaults

/// Default directory holding model weight files
pub fn default_model_dir() -> String {
    "models".to_string()
}

/// Default directory for generated artifacts
pub fn default_output_dir() -> String {
    "outputs".to_string()
}

/// Default directory for rolling log files
pub fn default_log_dir() -> String {
    "logs".to_string()
}

// Store defaults

/// Default directory for the SQLite database file
pub fn default_store_data_dir() -> String {
    "data".to_string()
}

/// Default SQLite busy timeout (seconds)
pub fn default_store_busy_timeout() -> u64 {
    5
}

/// Default retention for completed tasks and metric rows (days)
pub fn default_retention_days() -> u32 {
    7
}

// Monitoring defaults

/// Default interval between system metric snapshots (seconds)
pub fn default_metrics_interval() -> u64 {
    30
}
