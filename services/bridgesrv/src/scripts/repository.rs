//! SQLite persistence for script definitions.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tracing::info;

use crate::error::{BridgeError, Result};
use crate::scripts::types::ScriptDefinition;

const SCRIPTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS scripts (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        enabled INTEGER NOT NULL DEFAULT 0,
        source TEXT NOT NULL,
        interval_ms INTEGER NOT NULL,
        last_run_at TEXT,
        last_error TEXT,
        updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    )
"#;

/// Open (creating if needed) the script database and ensure the schema.
pub async fn open_pool(db_path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;
    sqlx::query(SCRIPTS_TABLE).execute(&pool).await?;
    Ok(pool)
}

pub async fn list_scripts(pool: &SqlitePool) -> Result<Vec<ScriptDefinition>> {
    let rows = sqlx::query(
        r#"
        SELECT id, name, description, enabled, source, interval_ms, last_run_at, last_error
        FROM scripts
        ORDER BY id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut scripts = Vec::with_capacity(rows.len());
    for row in rows {
        scripts.push(hydrate(row)?);
    }
    Ok(scripts)
}

pub async fn get_script(pool: &SqlitePool, id: &str) -> Result<ScriptDefinition> {
    let row = sqlx::query(
        r#"
        SELECT id, name, description, enabled, source, interval_ms, last_run_at, last_error
        FROM scripts
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => hydrate(row),
        None => Err(BridgeError::ScriptNotFound(id.to_string())),
    }
}

/// Insert or replace a script definition.
///
/// Run bookkeeping (`last_run_at`, `last_error`) is reset: an edited
/// script is a new script as far as its history is concerned.
pub async fn upsert_script(pool: &SqlitePool, script: &ScriptDefinition) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO scripts (id, name, description, enabled, source, interval_ms)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            description = excluded.description,
            enabled = excluded.enabled,
            source = excluded.source,
            interval_ms = excluded.interval_ms,
            last_run_at = NULL,
            last_error = NULL,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(&script.id)
    .bind(&script.name)
    .bind(&script.description)
    .bind(script.enabled)
    .bind(&script.source)
    .bind(script.interval_ms as i64)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn set_script_enabled(pool: &SqlitePool, id: &str, enabled: bool) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE scripts
        SET enabled = ?, updated_at = CURRENT_TIMESTAMP
        WHERE id = ?
        "#,
    )
    .bind(enabled)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(BridgeError::ScriptNotFound(id.to_string()));
    }
    Ok(())
}

pub async fn delete_script(pool: &SqlitePool, id: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM scripts WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(BridgeError::ScriptNotFound(id.to_string()));
    }
    Ok(())
}

/// Record the outcome of one invocation.
pub async fn record_run(pool: &SqlitePool, id: &str, error: Option<&str>) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE scripts
        SET last_run_at = ?, last_error = ?
        WHERE id = ?
        "#,
    )
    .bind(Utc::now().to_rfc3339())
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Install the example scripts into an empty database, disabled.
///
/// Gives a fresh deployment something to enable and edit instead of a
/// blank script list.
pub async fn seed_default_scripts(pool: &SqlitePool) -> Result<()> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scripts")
        .fetch_one(pool)
        .await?;
    if count > 0 {
        return Ok(());
    }

    let defaults = default_scripts();
    info!("Seeding {} example scripts", defaults.len());
    for script in &defaults {
        let mut script = script.clone();
        script.enabled = false;
        upsert_script(pool, &script).await?;
    }
    Ok(())
}

fn default_scripts() -> Vec<ScriptDefinition> {
    let mut mirror = ScriptDefinition::new(
        "input-mirror",
        "Mirror input 0 to output pin 0",
        "set_output_pin(0, input(0));",
        1000,
    );
    mirror.description = Some("Drives local output pin 0 from discrete input 0".to_string());

    let mut and_gate = ScriptDefinition::new(
        "and-gate",
        "AND gate on inputs 1 and 2",
        "write_coil(5, input(1) && input(2));",
        1000,
    );
    and_gate.description = Some("Sets coil 5 when both inputs 1 and 2 are on".to_string());

    let mut toggle = ScriptDefinition::new(
        "heartbeat-toggle",
        "Heartbeat toggle on coil 7",
        "write_coil(7, !coil(7));",
        5000,
    );
    toggle.description = Some("Inverts coil 7 every run as a liveness beacon".to_string());

    let mut alarm = ScriptDefinition::new(
        "register-alarm",
        "Threshold alarm on register 0",
        "write_coil(8, register(0) > 100);",
        2000,
    );
    alarm.description = Some("Raises coil 8 while register 0 exceeds 100".to_string());

    vec![mirror, and_gate, toggle, alarm]
}

fn hydrate(row: SqliteRow) -> Result<ScriptDefinition> {
    let enabled: i64 = row.try_get("enabled")?;
    let interval_ms: i64 = row.try_get("interval_ms")?;
    let last_run_at: Option<String> = row.try_get("last_run_at")?;

    Ok(ScriptDefinition {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        enabled: enabled != 0,
        source: row.try_get("source")?,
        interval_ms: interval_ms.max(0) as u64,
        last_run_at: last_run_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc)),
        last_error: row.try_get("last_error")?,
    })
}
