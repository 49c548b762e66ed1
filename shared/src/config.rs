//! Configuration types for the GPU inference orchestration system
//!
//! Configuration is loaded at startup from a single JSON file shared by the
//! orchestrator and the workers it spawns. Every field has a default, so an
//! empty file (or none at all) yields a working single-device setup, and a
//! small set of environment variables can override the most commonly tuned
//! values without editing the file.

use crate::defaults::*;
use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Top-level configuration, one section per subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub workers: WorkerPoolConfig,
    #[serde(default)]
    pub communication: CommunicationConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// REST API bind settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

impl ApiConfig {
    /// Parse the configured bind address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid API bind address '{}:{}'", self.host, self.port))
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPoolConfig {
    /// Ordered list of device ids to spawn workers for. One worker per device.
    #[serde(default = "default_device_list")]
    pub device_list: Vec<u32>,
    /// Spawn workers automatically at startup.
    #[serde(default = "default_auto_start_workers")]
    pub auto_start_workers: bool,
    /// Spawn all configured devices concurrently instead of one at a time.
    #[serde(default = "default_parallel_worker_spawn")]
    pub parallel_worker_spawn: bool,
    /// Delay between sequential worker spawns in milliseconds.
    #[serde(default = "default_worker_spawn_delay_ms")]
    pub worker_spawn_delay_ms: u64,
    /// Path to the worker binary. Defaults to a `worker` executable next to
    /// the orchestrator binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_binary: Option<PathBuf>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            device_list: default_device_list(),
            auto_start_workers: default_auto_start_workers(),
            parallel_worker_spawn: default_parallel_worker_spawn(),
            worker_spawn_delay_ms: default_worker_spawn_delay_ms(),
            worker_binary: None,
        }
    }
}

/// Orchestrator/worker communication settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommunicationConfig {
    /// A worker with no activity for this long is marked offline (seconds).
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout_seconds: u64,
    /// Interval between idle-worker heartbeats (seconds).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// Upper bound on a single message-bus put (seconds).
    #[serde(default = "default_message_timeout")]
    pub message_timeout_seconds: u64,
    /// Retry attempts for transient communication failures.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

impl Default for CommunicationConfig {
    fn default() -> Self {
        Self {
            worker_timeout_seconds: default_worker_timeout(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            message_timeout_seconds: default_message_timeout(),
            retry_attempts: default_retry_attempts(),
        }
    }
}

/// Scheduler and task-processing settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingConfig {
    /// Default model applied at admission when the request names none.
    #[serde(default = "default_model_name")]
    pub default_model: String,
    /// Task timeout in seconds. Reported only; a running worker is never
    /// interrupted.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_seconds: u64,
    /// Scheduler tick cadence in milliseconds.
    #[serde(default = "default_scheduler_interval_ms")]
    pub scheduler_interval_ms: u64,
    /// Seconds between periodic cleanup passes.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
    /// Age bound for in-memory completed task records (hours).
    #[serde(default = "default_completed_task_retention_hours")]
    pub completed_task_retention_hours: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            default_model: default_model_name(),
            task_timeout_seconds: default_task_timeout(),
            scheduler_interval_ms: default_scheduler_interval_ms(),
            cleanup_interval_seconds: default_cleanup_interval(),
            completed_task_retention_hours: default_completed_task_retention_hours(),
        }
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Directory holding model weight files. Relative model paths from the
    /// catalog are resolved against this directory.
    #[serde(default = "default_model_dir")]
    pub model_dir: String,
    /// Directory generated artifacts are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    /// Directory for rolling log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            output_dir: default_output_dir(),
            log_dir: default_log_dir(),
        }
    }
}

/// Store connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Directory for the SQLite database file.
    #[serde(default = "default_store_data_dir")]
    pub data_dir: String,
    /// SQLite busy timeout in seconds.
    #[serde(default = "default_store_busy_timeout")]
    pub busy_timeout_seconds: u64,
    /// Retention for completed tasks and metric rows (days).
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_store_data_dir(),
            busy_timeout_seconds: default_store_busy_timeout(),
            retention_days: default_retention_days(),
        }
    }
}

/// System monitoring settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitoringConfig {
    /// Seconds between system metric snapshots.
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_seconds: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_interval_seconds: default_metrics_interval(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file does not exist, then apply environment overrides and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            warn!(
                "Config file {} not found, using built-in defaults",
                path.display()
            );
            NodeConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment-variable overrides on top of file values.
    ///
    /// Recognized variables: `ORCHESTRATOR_HOST`, `ORCHESTRATOR_PORT`,
    /// `DEVICE_LIST` (comma-separated ids), `MODEL_DIR`, `OUTPUT_DIR`,
    /// `STORE_DATA_DIR`.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("ORCHESTRATOR_HOST") {
            info!("Overriding API host from environment");
            self.api.host = host;
        }
        if let Ok(port) = std::env::var("ORCHESTRATOR_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    info!("Overriding API port from environment");
                    self.api.port = port;
                }
                Err(e) => warn!("Ignoring invalid ORCHESTRATOR_PORT '{}': {}", port, e),
            }
        }
        if let Ok(devices) = std::env::var("DEVICE_LIST") {
            let parsed: std::result::Result<Vec<u32>, _> = devices
                .split(',')
                .map(|s| s.trim().parse::<u32>())
                .collect();
            match parsed {
                Ok(list) if !list.is_empty() => {
                    info!("Overriding device list from environment: {:?}", list);
                    self.workers.device_list = list;
                }
                _ => warn!("Ignoring invalid DEVICE_LIST '{}'", devices),
            }
        }
        if let Ok(dir) = std::env::var("MODEL_DIR") {
            self.paths.model_dir = dir;
        }
        if let Ok(dir) = std::env::var("OUTPUT_DIR") {
            self.paths.output_dir = dir;
        }
        if let Ok(dir) = std::env::var("STORE_DATA_DIR") {
            self.store.data_dir = dir;
        }
    }

    /// Reject configurations that cannot work.
    fn validate(&self) -> Result<()> {
        if self.workers.device_list.is_empty() {
            anyhow::bail!("Configuration error: device_list must not be empty");
        }
        let mut seen = std::collections::HashSet::new();
        for device_id in &self.workers.device_list {
            if !seen.insert(device_id) {
                anyhow::bail!(
                    "Configuration error: device {} listed more than once",
                    device_id
                );
            }
        }
        if self.processing.scheduler_interval_ms == 0 {
            anyhow::bail!("Configuration error: scheduler_interval_ms must be at least 1");
        }
        if self.communication.heartbeat_interval_seconds == 0 {
            anyhow::bail!("Configuration error: heartbeat_interval_seconds must be at least 1");
        }
        if self.communication.worker_timeout_seconds < self.communication.heartbeat_interval_seconds
        {
            anyhow::bail!(
                "Configuration error: worker_timeout_seconds ({}) must not be shorter than \
                 heartbeat_interval_seconds ({})",
                self.communication.worker_timeout_seconds,
                self.communication.heartbeat_interval_seconds
            );
        }
        Ok(())
    }
}
