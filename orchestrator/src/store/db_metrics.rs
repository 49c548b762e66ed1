//! Metric table operations
//!
//! Two append-only tables: host-level snapshots (`system_metrics`) and
//! per-worker device snapshots (`worker_metrics`). Both are pruned by the
//! retention cleanup. GPU probe gauges the orchestrator has no source for
//! (utilization, temperature, power) are stored as NULL.

use anyhow::Result;
use rusqlite::{params, Connection};

/// One host-level snapshot.
#[derive(Debug, Clone, Default)]
pub struct SystemMetricsSnapshot {
    pub total_ram_gb: f64,
    pub used_ram_gb: f64,
    pub available_ram_gb: f64,
    pub ram_percent: f64,
    pub active_tasks: usize,
    pub queued_tasks: usize,
    pub completed_tasks: usize,
}

/// One per-worker device snapshot.
#[derive(Debug, Clone)]
pub struct WorkerMetricsSnapshot {
    pub worker_id: String,
    pub vram_used_mb: u64,
    pub vram_total_mb: Option<u64>,
    pub gpu_utilization_percent: Option<f64>,
    pub temperature_celsius: Option<f64>,
    pub power_usage_watts: Option<f64>,
}

pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS system_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp REAL NOT NULL,
            total_ram_gb REAL,
            used_ram_gb REAL,
            available_ram_gb REAL,
            ram_percent REAL,
            active_tasks INTEGER DEFAULT 0,
            queued_tasks INTEGER DEFAULT 0,
            completed_tasks INTEGER DEFAULT 0
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS worker_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            worker_id TEXT NOT NULL,
            timestamp REAL NOT NULL,
            vram_used_mb INTEGER,
            vram_total_mb INTEGER,
            gpu_utilization_percent REAL,
            temperature_celsius REAL,
            power_usage_watts REAL,
            FOREIGN KEY (worker_id) REFERENCES workers(worker_id)
        )
        "#,
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_system_metrics_timestamp ON system_metrics(timestamp)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_worker_metrics_timestamp ON worker_metrics(timestamp)",
        [],
    )?;

    Ok(())
}

pub fn insert_system_metrics(
    conn: &Connection,
    snapshot: &SystemMetricsSnapshot,
    now: f64,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO system_metrics (
            timestamp, total_ram_gb, used_ram_gb, available_ram_gb, ram_percent,
            active_tasks, queued_tasks, completed_tasks
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            now,
            snapshot.total_ram_gb,
            snapshot.used_ram_gb,
            snapshot.available_ram_gb,
            snapshot.ram_percent,
            snapshot.active_tasks as i64,
            snapshot.queued_tasks as i64,
            snapshot.completed_tasks as i64,
        ],
    )?;
    Ok(())
}

pub fn insert_worker_metrics(
    conn: &Connection,
    snapshot: &WorkerMetricsSnapshot,
    now: f64,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO worker_metrics (
            worker_id, timestamp, vram_used_mb, vram_total_mb,
            gpu_utilization_percent, temperature_celsius, power_usage_watts
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            snapshot.worker_id,
            now,
            snapshot.vram_used_mb as i64,
            snapshot.vram_total_mb.map(|v| v as i64),
            snapshot.gpu_utilization_percent,
            snapshot.temperature_celsius,
            snapshot.power_usage_watts,
        ],
    )?;
    Ok(())
}

/// Delete metric rows older than the cutoff. Returns (system, worker) counts.
pub fn cleanup_old_metrics(conn: &Connection, cutoff: f64) -> Result<(usize, usize)> {
    let system = conn.execute(
        "DELETE FROM system_metrics WHERE timestamp < ?1",
        params![cutoff],
    )?;
    let worker = conn.execute(
        "DELETE FROM worker_metrics WHERE timestamp < ?1",
        params![cutoff],
    )?;
    Ok((system, worker))
}
