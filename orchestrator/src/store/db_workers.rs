//! Worker table operations
//!
//! One row per worker id. Rows are upserted: registration resets a returning
//! worker to `starting`, status updates refresh the mutable fields.

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use shared::worker::WorkerState;
use tracing::debug;

/// A worker row as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRow {
    pub worker_id: String,
    pub device_id: u32,
    pub status: String,
    pub current_model: Option<String>,
    pub vram_usage_mb: i64,
    pub last_activity: f64,
    pub error_message: Option<String>,
}

pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS workers (
            worker_id TEXT PRIMARY KEY,
            device_id INTEGER NOT NULL,
            status TEXT DEFAULT 'starting',
            current_model TEXT,
            vram_usage_mb INTEGER DEFAULT 0,
            last_activity REAL,
            error_message TEXT,
            created_at INTEGER DEFAULT (strftime('%s', 'now')),
            updated_at INTEGER DEFAULT (strftime('%s', 'now'))
        )
        "#,
        [],
    )?;
    Ok(())
}

/// Register a worker, or reset an existing row back to `starting` when the
/// same worker id reappears (respawn after a crash).
pub fn register_worker(conn: &Connection, worker_id: &str, device_id: u32, now: f64) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO workers (worker_id, device_id, status, last_activity)
        VALUES (?1, ?2, 'starting', ?3)
        ON CONFLICT (worker_id) DO UPDATE SET
            device_id = excluded.device_id,
            status = 'starting',
            last_activity = excluded.last_activity,
            error_message = NULL,
            updated_at = strftime('%s', 'now')
        "#,
        params![worker_id, device_id, now],
    )?;

    debug!("Worker {} registered in store", worker_id);
    Ok(())
}

/// Upsert the mutable fields of a worker row.
pub fn update_worker_status(
    conn: &Connection,
    worker_id: &str,
    device_id: u32,
    status: WorkerState,
    current_model: Option<&str>,
    vram_usage_mb: u64,
    error_message: Option<&str>,
    now: f64,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO workers (worker_id, device_id, status, current_model,
            vram_usage_mb, last_activity, error_message)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT (worker_id) DO UPDATE SET
            status = excluded.status,
            current_model = excluded.current_model,
            vram_usage_mb = excluded.vram_usage_mb,
            last_activity = excluded.last_activity,
            error_message = excluded.error_message,
            updated_at = strftime('%s', 'now')
        "#,
        params![
            worker_id,
            device_id,
            status.as_str(),
            current_model,
            vram_usage_mb as i64,
            now,
            error_message,
        ],
    )?;
    Ok(())
}

fn row_to_worker(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkerRow> {
    Ok(WorkerRow {
        worker_id: row.get("worker_id")?,
        device_id: row.get("device_id")?,
        status: row.get("status")?,
        current_model: row.get("current_model")?,
        vram_usage_mb: row.get("vram_usage_mb")?,
        last_activity: row.get::<_, Option<f64>>("last_activity")?.unwrap_or(0.0),
        error_message: row.get("error_message")?,
    })
}

pub fn get_workers(conn: &Connection) -> Result<Vec<WorkerRow>> {
    let mut stmt = conn.prepare("SELECT * FROM workers ORDER BY device_id")?;
    let rows = stmt.query_map([], row_to_worker)?;
    let mut workers = Vec::new();
    for row in rows {
        workers.push(row?);
    }
    Ok(workers)
}
