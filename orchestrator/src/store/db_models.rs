//! Model catalog operations
//!
//! Purely a lookup table keyed by model name. Rows are written by
//! administrative upserts; the scheduler reads them when attaching model
//! information to a dispatch, and `usage_count`/`last_used` are bumped on
//! each successful load.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use shared::task::ModelInfo;

pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS models (
            model_name TEXT PRIMARY KEY,
            model_path TEXT NOT NULL,
            size_mb INTEGER,
            last_used REAL,
            usage_count INTEGER DEFAULT 0,
            created_at INTEGER DEFAULT (strftime('%s', 'now'))
        )
        "#,
        [],
    )?;
    Ok(())
}

/// Insert or update a catalog row.
pub fn upsert_model(
    conn: &Connection,
    model_name: &str,
    model_path: &str,
    size_mb: Option<u64>,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO models (model_name, model_path, size_mb)
        VALUES (?1, ?2, ?3)
        ON CONFLICT (model_name) DO UPDATE SET
            model_path = excluded.model_path,
            size_mb = excluded.size_mb
        "#,
        params![model_name, model_path, size_mb.map(|s| s as i64)],
    )?;
    Ok(())
}

pub fn get_model(conn: &Connection, model_name: &str) -> Result<Option<ModelInfo>> {
    let row = conn
        .query_row(
            r#"
            SELECT model_name, model_path, size_mb, last_used, usage_count
            FROM models WHERE model_name = ?1
            "#,
            params![model_name],
            |row| {
                Ok(ModelInfo {
                    name: row.get("model_name")?,
                    path: row.get("model_path")?,
                    size_mb: row.get::<_, Option<i64>>("size_mb")?.map(|s| s as u64),
                    last_used: row
                        .get::<_, Option<f64>>("last_used")?
                        .map(|t| t as i64),
                    usage_count: row.get::<_, i64>("usage_count")? as u64,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Record one successful load of a model.
pub fn touch_model_usage(conn: &Connection, model_name: &str, now: f64) -> Result<()> {
    conn.execute(
        r#"
        UPDATE models SET last_used = ?1, usage_count = usage_count + 1
        WHERE model_name = ?2
        "#,
        params![now, model_name],
    )?;
    Ok(())
}
