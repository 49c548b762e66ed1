//! Durable state for tasks, workers, models, and metrics
//!
//! The Store is the single source of truth across orchestrator restarts. It
//! is a local SQLite database, which keeps the orchestrator self-contained on
//! its single host; the logical schema would port to a server database
//! unchanged.
//!
//! Failure policy: every operation returns a `Result`, and callers treat
//! Store errors as non-fatal; the scheduler keeps its in-memory state moving
//! and retries writes opportunistically. The one hard rule is enforced by the
//! scheduler, not here: a task is only surfaced as `completed` once its
//! terminal write has succeeded.

// Table-specific modules
mod db_metrics;
mod db_models;
mod db_tasks;
mod db_workers;

use anyhow::{Context, Result};
use rusqlite::Connection;
use shared::task::{TaskParams, TaskStatus};
use shared::utils::current_timestamp_secs_f64;
use shared::worker::WorkerState;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default database file name.
const DATABASE_FILE: &str = "orchestrator.db";

// Re-export row types for the rest of the orchestrator
pub use db_metrics::{SystemMetricsSnapshot, WorkerMetricsSnapshot};
pub use db_tasks::{CreateTaskOutcome, TaskRow};
pub use db_workers::WorkerRow;

/// SQLite-backed store for the orchestrator's durable state.
///
/// The connection is opened lazily and kept for the lifetime of the store.
pub struct Store {
    /// Path to the database file.
    db_path: PathBuf,
    /// The active connection, `None` until first use or after `close`.
    connection: Option<Connection>,
    /// Busy timeout applied to the connection.
    busy_timeout_seconds: u64,
}

impl Store {
    /// Create a store manager for the given data directory, creating the
    /// directory if needed.
    pub fn new<P: AsRef<Path>>(data_dir: P, busy_timeout_seconds: u64) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir).with_context(|| {
                format!("Failed to create data directory: {}", data_dir.display())
            })?;
        }

        Ok(Self {
            db_path: data_dir.join(DATABASE_FILE),
            connection: None,
            busy_timeout_seconds,
        })
    }

    /// Ensure the schema exists and run forward-only migrations. Idempotent;
    /// called on every startup.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing store at {}", self.db_path.display());

        let conn = self.get_connection()?;

        db_workers::create_tables(conn)?;
        db_tasks::create_tables(conn)?;
        db_models::create_tables(conn)?;
        db_metrics::create_tables(conn)?;

        db_tasks::run_migrations(conn)?;

        info!("Store initialization complete");
        Ok(())
    }

    /// Lazily get the connection, opening and configuring it on first use.
    pub fn get_connection(&mut self) -> Result<&mut Connection> {
        if self.connection.is_none() {
            let conn = Connection::open(&self.db_path)
                .with_context(|| format!("Failed to open database: {}", self.db_path.display()))?;

            // WAL mode lets the API read task rows while the scheduler writes.
            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
                .context("Failed to enable WAL mode")?;

            // Checkpoint automatically so the WAL file cannot grow unbounded.
            conn.query_row("PRAGMA wal_autocheckpoint=1000", [], |_| Ok(()))
                .context("Failed to set WAL auto-checkpoint")?;

            conn.execute("PRAGMA foreign_keys=ON", [])
                .context("Failed to enable foreign key constraints")?;

            conn.busy_timeout(std::time::Duration::from_secs(self.busy_timeout_seconds))
                .context("Failed to set busy timeout")?;

            self.connection = Some(conn);
        }

        Ok(self
            .connection
            .as_mut()
            .expect("connection is set by the branch above"))
    }

    // ========== Tasks ==========

    /// Atomic admission insert; `Duplicate` on a primary-key conflict.
    pub async fn create_task(
        &mut self,
        task_id: &str,
        params: &TaskParams,
    ) -> Result<CreateTaskOutcome> {
        let now = current_timestamp_secs_f64();
        let conn = self.get_connection()?;
        db_tasks::create_task(conn, task_id, params, now)
    }

    /// Apply one status transition, writing the side fields that belong to it.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_task_status(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        worker_id: Option<&str>,
        output_path: Option<&str>,
        error_message: Option<&str>,
        error_kind: Option<&str>,
        processing_time: Option<f64>,
    ) -> Result<()> {
        let now = current_timestamp_secs_f64();
        let conn = self.get_connection()?;
        db_tasks::update_task_status(
            conn,
            task_id,
            status,
            worker_id,
            output_path,
            error_message,
            error_kind,
            processing_time,
            now,
        )
    }

    pub async fn get_task(&mut self, task_id: &str) -> Result<Option<TaskRow>> {
        let conn = self.get_connection()?;
        db_tasks::get_task(conn, task_id)
    }

    /// Tasks with status `queued` or `assigned`, oldest first.
    pub async fn get_pending_tasks(&mut self, limit: usize) -> Result<Vec<TaskRow>> {
        let conn = self.get_connection()?;
        db_tasks::get_pending_tasks(conn, limit)
    }

    /// Resolve tasks left `assigned`/`running` by a previous lifetime to
    /// `failed` with reason `orchestrator_shutdown`. Returns the row count.
    pub async fn recover_interrupted_tasks(&mut self) -> Result<usize> {
        let now = current_timestamp_secs_f64();
        let conn = self.get_connection()?;
        let recovered = db_tasks::recover_interrupted_tasks(conn, now)?;
        if recovered > 0 {
            warn!(
                "Recovery pass resolved {} interrupted task(s) to failed",
                recovered
            );
        }
        Ok(recovered)
    }

    // ========== Workers ==========

    pub async fn register_worker(&mut self, worker_id: &str, device_id: u32) -> Result<()> {
        let now = current_timestamp_secs_f64();
        let conn = self.get_connection()?;
        db_workers::register_worker(conn, worker_id, device_id, now)
    }

    pub async fn update_worker_status(
        &mut self,
        worker_id: &str,
        device_id: u32,
        status: WorkerState,
        current_model: Option<&str>,
        vram_usage_mb: u64,
        error_message: Option<&str>,
    ) -> Result<()> {
        let now = current_timestamp_secs_f64();
        let conn = self.get_connection()?;
        db_workers::update_worker_status(
            conn,
            worker_id,
            device_id,
            status,
            current_model,
            vram_usage_mb,
            error_message,
            now,
        )
    }

    pub async fn get_workers(&mut self) -> Result<Vec<WorkerRow>> {
        let conn = self.get_connection()?;
        db_workers::get_workers(conn)
    }

    // ========== Models ==========

    pub async fn upsert_model(
        &mut self,
        model_name: &str,
        model_path: &str,
        size_mb: Option<u64>,
    ) -> Result<()> {
        let conn = self.get_connection()?;
        db_models::upsert_model(conn, model_name, model_path, size_mb)
    }

    pub async fn get_model(&mut self, model_name: &str) -> Result<Option<shared::ModelInfo>> {
        let conn = self.get_connection()?;
        db_models::get_model(conn, model_name)
    }

    /// Bump `usage_count` and `last_used` after a successful load.
    pub async fn touch_model_usage(&mut self, model_name: &str) -> Result<()> {
        let now = current_timestamp_secs_f64();
        let conn = self.get_connection()?;
        db_models::touch_model_usage(conn, model_name, now)
    }

    // ========== Metrics ==========

    pub async fn insert_system_metrics(&mut self, snapshot: &SystemMetricsSnapshot) -> Result<()> {
        let now = current_timestamp_secs_f64();
        let conn = self.get_connection()?;
        db_metrics::insert_system_metrics(conn, snapshot, now)
    }

    pub async fn insert_worker_metrics(&mut self, snapshot: &WorkerMetricsSnapshot) -> Result<()> {
        let now = current_timestamp_secs_f64();
        let conn = self.get_connection()?;
        db_metrics::insert_worker_metrics(conn, snapshot, now)
    }

    // ========== Maintenance ==========

    /// Delete completed tasks and metric rows older than the retention
    /// cutoff. Failed rows younger than the cutoff are never touched.
    pub async fn cleanup_old_records(&mut self, retention_days: u32) -> Result<()> {
        let retention_seconds = (retention_days as u64)
            .saturating_mul(24)
            .saturating_mul(60)
            .saturating_mul(60);
        let cutoff = current_timestamp_secs_f64() - retention_seconds as f64;

        let conn = self.get_connection()?;
        let tasks = db_tasks::cleanup_old_tasks(conn, cutoff)?;
        let (system, worker) = db_metrics::cleanup_old_metrics(conn, cutoff)?;

        if tasks + system + worker > 0 {
            info!(
                "Cleanup complete: {} tasks, {} system metric rows, {} worker metric rows deleted",
                tasks, system, worker
            );
        }

        Ok(())
    }

    /// Merge the WAL back into the main file and truncate it.
    pub async fn checkpoint_wal(&mut self) -> Result<i64> {
        let conn = self.get_connection()?;
        let (busy, log_frames, checkpointed): (i64, i64, i64) =
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;

        if busy > 0 {
            debug!(
                "WAL checkpoint: {} frames checkpointed, {} busy, {} total in log",
                checkpointed, busy, log_frames
            );
        } else {
            debug!("WAL checkpoint complete: {} frames checkpointed", checkpointed);
        }

        Ok(checkpointed)
    }

    /// Close the connection gracefully.
    pub async fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            if let Err(e) = conn.close() {
                warn!("Error closing store connection: {:?}", e);
            } else {
                debug!("Store connection closed");
            }
        }
    }
}
