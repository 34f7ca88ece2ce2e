//! Database query functions for the `runs` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqliteExecutor;
use uuid::Uuid;

use crate::models::{Run, RunStatus};

/// Insert a new run for a task, allocating the next per-task `run_number`
/// (1-based, contiguous). Must run inside the claim transaction so the
/// `UNIQUE(task_id, run_number)` constraint cannot race.
pub async fn insert_run(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    task_id: Uuid,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Run> {
    let run = sqlx::query_as::<_, Run>(
        "INSERT INTO runs (id, task_id, worker_id, run_number, status, started_at) \
         VALUES (?, ?, ?, \
                 (SELECT COALESCE(MAX(run_number), 0) + 1 FROM runs WHERE task_id = ?), \
                 'pending', ?) \
         RETURNING *",
    )
    .bind(id)
    .bind(task_id)
    .bind(worker_id)
    .bind(task_id)
    .bind(now)
    .fetch_one(ex)
    .await
    .context("failed to insert run")?;

    Ok(run)
}

/// Fetch a single run by ID.
pub async fn get_run(ex: impl SqliteExecutor<'_>, id: Uuid) -> Result<Option<Run>> {
    let run = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE id = ?")
        .bind(id)
        .fetch_optional(ex)
        .await
        .context("failed to fetch run")?;

    Ok(run)
}

/// List all runs of a task in run-number order.
pub async fn list_runs_for_task(ex: impl SqliteExecutor<'_>, task_id: Uuid) -> Result<Vec<Run>> {
    let runs =
        sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE task_id = ? ORDER BY run_number ASC")
            .bind(task_id)
            .fetch_all(ex)
            .await
            .context("failed to list runs for task")?;

    Ok(runs)
}

/// Atomically transition a run from one status to another (optimistic lock
/// on the expected `from` status). Returns the number of rows affected.
pub async fn transition_run_status(
    ex: impl SqliteExecutor<'_>,
    run_id: Uuid,
    from: RunStatus,
    to: RunStatus,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE runs SET status = ?, completed_at = COALESCE(?, completed_at) \
         WHERE id = ? AND status = ?",
    )
    .bind(to)
    .bind(completed_at)
    .bind(run_id)
    .bind(from)
    .execute(ex)
    .await
    .context("failed to transition run status")?;

    Ok(result.rows_affected())
}

/// Record the outcome fields of a terminal run.
pub async fn set_run_outcome(
    ex: impl SqliteExecutor<'_>,
    run_id: Uuid,
    result_data: Option<&Value>,
    error_message: Option<&str>,
    output_log: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE runs SET result_data = ?, error_message = ?, output_log = ? WHERE id = ?",
    )
    .bind(result_data)
    .bind(error_message)
    .bind(output_log)
    .bind(run_id)
    .execute(ex)
    .await
    .context("failed to record run outcome")?;

    Ok(result.rows_affected())
}

/// Cancel any non-terminal run of a task, recording why.
///
/// Used when a held task is requeued (worker death, unregister, cancel): the
/// open run must not stay `pending`/`running`.
pub async fn cancel_open_runs_for_task(
    ex: impl SqliteExecutor<'_>,
    task_id: Uuid,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE runs SET status = 'cancelled', completed_at = ?, error_message = ? \
         WHERE task_id = ? AND status IN ('pending', 'running')",
    )
    .bind(now)
    .bind(reason)
    .bind(task_id)
    .execute(ex)
    .await
    .context("failed to cancel open runs")?;

    Ok(result.rows_affected())
}
