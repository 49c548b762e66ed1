//! Task table operations
//!
//! The `tasks` table is the durable task log. Rows are inserted once at
//! admission with `task_id` as primary key and only ever advance along the
//! task state machine; each transition writes the side fields that belong to
//! it and bumps `updated_at`.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use shared::task::{error_kind, TaskParams, TaskStatus};
use tracing::{debug, warn};

/// Outcome of an admission insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateTaskOutcome {
    /// The row was inserted.
    Created,
    /// A row with this `task_id` already exists; the caller should retry with
    /// a derived id.
    Duplicate,
}

/// A task row as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRow {
    pub task_id: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance_scale: f64,
    pub seed: Option<i64>,
    pub status: String,
    pub worker_id: Option<String>,
    pub model_name: String,
    pub submit_time: f64,
    pub start_time: Option<f64>,
    pub completion_time: Option<f64>,
    pub output_path: Option<String>,
    pub error_message: Option<String>,
    pub error_kind: Option<String>,
    pub processing_time_seconds: Option<f64>,
}

impl TaskRow {
    /// Reconstruct the admission parameters from a persisted row.
    pub fn params(&self) -> TaskParams {
        TaskParams {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            width: self.width,
            height: self.height,
            steps: self.steps,
            guidance_scale: self.guidance_scale,
            seed: self.seed.map(|s| s as u64),
            model_name: self.model_name.clone(),
        }
    }
}

pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT PRIMARY KEY,
            prompt TEXT NOT NULL,
            negative_prompt TEXT DEFAULT '',
            width INTEGER DEFAULT 832,
            height INTEGER DEFAULT 1216,
            steps INTEGER DEFAULT 15,
            guidance_scale REAL DEFAULT 7.0,
            seed INTEGER,
            status TEXT DEFAULT 'queued',
            worker_id TEXT,
            model_name TEXT,
            submit_time REAL NOT NULL,
            start_time REAL,
            completion_time REAL,
            output_path TEXT,
            error_message TEXT,
            processing_time_seconds REAL,
            created_at INTEGER DEFAULT (strftime('%s', 'now')),
            updated_at INTEGER DEFAULT (strftime('%s', 'now')),
            FOREIGN KEY (worker_id) REFERENCES workers(worker_id)
        )
        "#,
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_submit_time ON tasks(submit_time)",
        [],
    )?;

    Ok(())
}

/// Forward-only migrations for the tasks table. Each one adds a column and is
/// skipped when the column already exists, so re-running is harmless.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    if !column_exists(conn, "tasks", "error_kind")? {
        debug!("Adding error_kind column to tasks table");
        conn.execute("ALTER TABLE tasks ADD COLUMN error_kind TEXT", [])?;
    }
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Atomic admission insert. A primary-key conflict is reported as
/// [`CreateTaskOutcome::Duplicate`] rather than an error so the caller can
/// mint a fresh id.
pub fn create_task(
    conn: &Connection,
    task_id: &str,
    params: &TaskParams,
    now: f64,
) -> Result<CreateTaskOutcome> {
    let result = conn.execute(
        r#"
        INSERT INTO tasks (
            task_id, prompt, negative_prompt, width, height, steps,
            guidance_scale, seed, status, model_name, submit_time
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'queued', ?9, ?10)
        "#,
        params![
            task_id,
            params.prompt,
            params.negative_prompt,
            params.width,
            params.height,
            params.steps,
            params.guidance_scale,
            params.seed.map(|s| s as i64),
            params.model_name,
            now,
        ],
    );

    match result {
        Ok(_) => {
            debug!("Task {} created in store", task_id);
            Ok(CreateTaskOutcome::Created)
        }
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Ok(CreateTaskOutcome::Duplicate)
        }
        Err(e) => Err(e.into()),
    }
}

/// Apply one status transition with its side fields.
///
/// A missing row is a warning, not an error: the in-memory record is the
/// authority during an outage and the Store catches up opportunistically.
#[allow(clippy::too_many_arguments)]
pub fn update_task_status(
    conn: &Connection,
    task_id: &str,
    status: TaskStatus,
    worker_id: Option<&str>,
    output_path: Option<&str>,
    error_message: Option<&str>,
    kind: Option<&str>,
    processing_time: Option<f64>,
    now: f64,
) -> Result<()> {
    let affected = match status {
        TaskStatus::Queued => conn.execute(
            "UPDATE tasks SET status = 'queued', updated_at = ?1 WHERE task_id = ?2",
            params![now as i64, task_id],
        )?,
        TaskStatus::Assigned => conn.execute(
            r#"
            UPDATE tasks SET status = 'assigned', worker_id = ?1, updated_at = ?2
            WHERE task_id = ?3
            "#,
            params![worker_id, now as i64, task_id],
        )?,
        TaskStatus::Running => conn.execute(
            r#"
            UPDATE tasks SET status = 'running', worker_id = ?1,
                start_time = COALESCE(start_time, ?2), updated_at = ?3
            WHERE task_id = ?4
            "#,
            params![worker_id, now, now as i64, task_id],
        )?,
        TaskStatus::Completed => conn.execute(
            // start_time is coalesced so a completed row always carries both
            // timestamps, even if the processing_started event was lost.
            r#"
            UPDATE tasks SET status = 'completed', completion_time = ?1,
                start_time = COALESCE(start_time, ?1),
                output_path = ?2, processing_time_seconds = ?3, updated_at = ?4
            WHERE task_id = ?5
            "#,
            params![now, output_path, processing_time, now as i64, task_id],
        )?,
        TaskStatus::Failed => conn.execute(
            r#"
            UPDATE tasks SET status = 'failed', completion_time = ?1,
                error_message = ?2, error_kind = ?3, updated_at = ?4
            WHERE task_id = ?5
            "#,
            params![now, error_message, kind, now as i64, task_id],
        )?,
        TaskStatus::Cancelled => conn.execute(
            r#"
            UPDATE tasks SET status = 'cancelled', completion_time = ?1, updated_at = ?2
            WHERE task_id = ?3
            "#,
            params![now, now as i64, task_id],
        )?,
    };

    if affected > 0 {
        debug!("Task {} status updated to {}", task_id, status);
    } else {
        warn!("No task found with id {} to update to {}", task_id, status);
    }

    Ok(())
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        task_id: row.get("task_id")?,
        prompt: row.get("prompt")?,
        negative_prompt: row.get("negative_prompt")?,
        width: row.get("width")?,
        height: row.get("height")?,
        steps: row.get("steps")?,
        guidance_scale: row.get("guidance_scale")?,
        seed: row.get("seed")?,
        status: row.get("status")?,
        worker_id: row.get("worker_id")?,
        model_name: row.get("model_name")?,
        submit_time: row.get("submit_time")?,
        start_time: row.get("start_time")?,
        completion_time: row.get("completion_time")?,
        output_path: row.get("output_path")?,
        error_message: row.get("error_message")?,
        error_kind: row.get("error_kind")?,
        processing_time_seconds: row.get("processing_time_seconds")?,
    })
}

pub fn get_task(conn: &Connection, task_id: &str) -> Result<Option<TaskRow>> {
    let row = conn
        .query_row(
            "SELECT * FROM tasks WHERE task_id = ?1",
            params![task_id],
            row_to_task,
        )
        .optional()?;
    Ok(row)
}

/// Tasks awaiting work: `queued` rows plus `assigned` rows (the latter only
/// appear here between a crash and the recovery pass).
pub fn get_pending_tasks(conn: &Connection, limit: usize) -> Result<Vec<TaskRow>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT * FROM tasks
        WHERE status IN ('queued', 'assigned')
        ORDER BY submit_time ASC
        LIMIT ?1
        "#,
    )?;
    let rows = stmt.query_map(params![limit], row_to_task)?;
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row?);
    }
    Ok(tasks)
}

/// Startup recovery: every task left `assigned` or `running` by a previous
/// orchestrator lifetime is resolved to `failed`.
pub fn recover_interrupted_tasks(conn: &Connection, now: f64) -> Result<usize> {
    let affected = conn.execute(
        r#"
        UPDATE tasks SET status = 'failed', completion_time = ?1,
            error_message = 'interrupted by orchestrator restart',
            error_kind = ?2, updated_at = ?3
        WHERE status IN ('assigned', 'running')
        "#,
        params![now, error_kind::ORCHESTRATOR_SHUTDOWN, now as i64],
    )?;
    Ok(affected)
}

/// Delete terminal successful rows older than the cutoff. Failed rows are
/// kept for their full retention window regardless of the cutoff.
pub fn cleanup_old_tasks(conn: &Connection, cutoff: f64) -> Result<usize> {
    let deleted = conn.execute(
        r#"
        DELETE FROM tasks
        WHERE status IN ('completed', 'cancelled') AND completion_time < ?1
        "#,
        params![cutoff],
    )?;
    Ok(deleted)
}
