//! Database query functions for the `workers` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqliteExecutor;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{Worker, WorkerStatus};

/// Upsert a worker registration.
///
/// Re-registering an existing id replaces role/capabilities/metadata, resets
/// the heartbeat and forces status back to `active`; `registered_at` is
/// preserved.
pub async fn upsert_worker(
    ex: impl SqliteExecutor<'_>,
    id: &str,
    role: &str,
    capabilities: &[String],
    metadata: Option<&Value>,
    now: DateTime<Utc>,
) -> Result<Worker> {
    let worker = sqlx::query_as::<_, Worker>(
        "INSERT INTO workers (id, role, status, last_heartbeat, capabilities, metadata, registered_at) \
         VALUES (?, ?, 'active', ?, ?, ?, ?) \
         ON CONFLICT (id) DO UPDATE SET \
             role = excluded.role, \
             status = 'active', \
             last_heartbeat = excluded.last_heartbeat, \
             capabilities = excluded.capabilities, \
             metadata = excluded.metadata \
         RETURNING *",
    )
    .bind(id)
    .bind(role)
    .bind(now)
    .bind(Json(capabilities))
    .bind(metadata)
    .bind(now)
    .fetch_one(ex)
    .await
    .context("failed to upsert worker")?;

    Ok(worker)
}

/// Fetch a single worker by ID.
pub async fn get_worker(ex: impl SqliteExecutor<'_>, id: &str) -> Result<Option<Worker>> {
    let worker = sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE id = ?")
        .bind(id)
        .fetch_optional(ex)
        .await
        .context("failed to fetch worker")?;

    Ok(worker)
}

/// Refresh a worker's heartbeat, optionally updating its status.
///
/// Returns the number of rows affected: 0 means the worker is unknown (no
/// implicit registration).
pub async fn touch_heartbeat(
    ex: impl SqliteExecutor<'_>,
    id: &str,
    status: Option<WorkerStatus>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workers SET last_heartbeat = ?, status = COALESCE(?, status) WHERE id = ?",
    )
    .bind(now)
    .bind(status)
    .bind(id)
    .execute(ex)
    .await
    .context("failed to update worker heartbeat")?;

    Ok(result.rows_affected())
}

/// List workers with `status = active` and a heartbeat no older than the
/// given cutoff, most recently seen first.
pub async fn list_active_workers(
    ex: impl SqliteExecutor<'_>,
    role: Option<&str>,
    heartbeat_cutoff: DateTime<Utc>,
) -> Result<Vec<Worker>> {
    let workers = sqlx::query_as::<_, Worker>(
        "SELECT * FROM workers \
         WHERE status = 'active' \
           AND last_heartbeat >= ? \
           AND (? IS NULL OR role = ?) \
         ORDER BY last_heartbeat DESC",
    )
    .bind(heartbeat_cutoff)
    .bind(role)
    .bind(role)
    .fetch_all(ex)
    .await
    .context("failed to list active workers")?;

    Ok(workers)
}

/// Set or clear a worker's current task, adjusting status to match
/// (`active` while holding a task, `idle` after releasing one).
pub async fn set_current_task(
    ex: impl SqliteExecutor<'_>,
    id: &str,
    task_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let status = if task_id.is_some() {
        WorkerStatus::Active
    } else {
        WorkerStatus::Idle
    };
    let result = sqlx::query(
        "UPDATE workers SET current_task_id = ?, status = ?, last_heartbeat = ? WHERE id = ?",
    )
    .bind(task_id)
    .bind(status)
    .bind(now)
    .bind(id)
    .execute(ex)
    .await
    .context("failed to set worker current task")?;

    Ok(result.rows_affected())
}

/// Release whichever worker currently holds the given task.
pub async fn release_task_holder(
    ex: impl SqliteExecutor<'_>,
    task_id: Uuid,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workers SET current_task_id = NULL, status = 'idle', last_heartbeat = ? \
         WHERE current_task_id = ?",
    )
    .bind(now)
    .bind(task_id)
    .execute(ex)
    .await
    .context("failed to release task holder")?;

    Ok(result.rows_affected())
}

/// Workers whose heartbeat is older than the cutoff and that are not yet
/// `offline`. Used by the liveness sweep.
pub async fn list_stale_workers(
    ex: impl SqliteExecutor<'_>,
    heartbeat_cutoff: DateTime<Utc>,
) -> Result<Vec<Worker>> {
    let workers = sqlx::query_as::<_, Worker>(
        "SELECT * FROM workers \
         WHERE status IN ('active', 'idle') AND last_heartbeat < ?",
    )
    .bind(heartbeat_cutoff)
    .fetch_all(ex)
    .await
    .context("failed to list stale workers")?;

    Ok(workers)
}

/// Mark a worker `offline` and clear its held task reference.
pub async fn mark_offline(ex: impl SqliteExecutor<'_>, id: &str) -> Result<u64> {
    let result =
        sqlx::query("UPDATE workers SET status = 'offline', current_task_id = NULL WHERE id = ?")
            .bind(id)
            .execute(ex)
            .await
            .context("failed to mark worker offline")?;

    Ok(result.rows_affected())
}

/// Delete a worker row.
pub async fn delete_worker(ex: impl SqliteExecutor<'_>, id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM workers WHERE id = ?")
        .bind(id)
        .execute(ex)
        .await
        .context("failed to delete worker")?;

    Ok(result.rows_affected())
}
