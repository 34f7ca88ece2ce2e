//! Dual-write mirror queries for the unified migration schema.
//!
//! While dual-write is enabled, every canonical task mutation calls
//! [`upsert_unified_task`] (and [`upsert_unified_workflow_task`] for workflow
//! containers) inside the same transaction, so either both schemas commit or
//! neither does.
//!
//! Tracked field mapping (canonical -> unified): `id`, `correlation_id`,
//! `task_type`, `status`, `priority`, `payload -> input_data`,
//! `metadata -> task_metadata`, `error_message`, `max_retries`, `created_at`,
//! `updated_at`. `agent_type` carries the assigned worker and is not part of
//! the consistency contract.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::SqliteExecutor;
use uuid::Uuid;

use crate::models::{Task, UnifiedTask, UnifiedWorkflowTask};

/// Mirror a canonical task row into `unified_tasks`.
pub async fn upsert_unified_task(ex: impl SqliteExecutor<'_>, task: &Task) -> Result<()> {
    let completed_at = if task.status.is_terminal() {
        Some(task.updated_at)
    } else {
        None
    };

    sqlx::query(
        "INSERT INTO unified_tasks (id, correlation_id, task_type, status, agent_type, \
                                    priority, input_data, task_metadata, error_message, \
                                    max_retries, created_at, updated_at, completed_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (id) DO UPDATE SET \
             status = excluded.status, \
             agent_type = excluded.agent_type, \
             priority = excluded.priority, \
             input_data = excluded.input_data, \
             task_metadata = excluded.task_metadata, \
             error_message = excluded.error_message, \
             max_retries = excluded.max_retries, \
             updated_at = excluded.updated_at, \
             completed_at = excluded.completed_at",
    )
    .bind(task.id)
    .bind(&task.correlation_id)
    .bind(&task.task_type)
    .bind(task.status.to_string())
    .bind(task.assigned_worker.as_deref())
    .bind(task.priority)
    .bind(&task.payload)
    .bind(&task.metadata)
    .bind(task.error_message.as_deref())
    .bind(task.max_retries)
    .bind(task.created_at)
    .bind(task.updated_at)
    .bind(completed_at)
    .execute(ex)
    .await
    .context("failed to mirror task into unified schema")?;

    Ok(())
}

/// Mirror the workflow-container fields of a task into
/// `unified_workflow_tasks`, appending the current phase to `phase_history`.
pub async fn upsert_unified_workflow_task(
    ex: impl SqliteExecutor<'_>,
    task: &Task,
    workflow_type: &str,
    total_phases: i64,
    phases_completed: i64,
    workflow_result: Option<&Value>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO unified_workflow_tasks (task_id, correlation_id, workflow_type, \
                                             current_phase, total_phases, phases_completed, \
                                             phase_history, workflow_config, workflow_result, \
                                             created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, json_array(?), ?, ?, ?, ?) \
         ON CONFLICT (task_id) DO UPDATE SET \
             current_phase = excluded.current_phase, \
             phases_completed = excluded.phases_completed, \
             phase_history = json_insert(unified_workflow_tasks.phase_history, '$[#]', \
                                         excluded.current_phase), \
             workflow_result = excluded.workflow_result, \
             updated_at = excluded.updated_at",
    )
    .bind(task.id)
    .bind(&task.correlation_id)
    .bind(workflow_type)
    .bind(&task.current_phase)
    .bind(total_phases)
    .bind(phases_completed)
    .bind(&task.current_phase)
    .bind(&task.workflow)
    .bind(workflow_result)
    .bind(task.created_at)
    .bind(task.updated_at)
    .execute(ex)
    .await
    .context("failed to mirror workflow task into unified schema")?;

    Ok(())
}

/// Fetch a mirrored task row.
pub async fn get_unified_task(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
) -> Result<Option<UnifiedTask>> {
    let task = sqlx::query_as::<_, UnifiedTask>("SELECT * FROM unified_tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(ex)
        .await
        .context("failed to fetch unified task")?;

    Ok(task)
}

/// Fetch a mirrored workflow-container row.
pub async fn get_unified_workflow_task(
    ex: impl SqliteExecutor<'_>,
    task_id: Uuid,
) -> Result<Option<UnifiedWorkflowTask>> {
    let task = sqlx::query_as::<_, UnifiedWorkflowTask>(
        "SELECT * FROM unified_workflow_tasks WHERE task_id = ?",
    )
    .bind(task_id)
    .fetch_optional(ex)
    .await
    .context("failed to fetch unified workflow task")?;

    Ok(task)
}

/// Delete mirrored rows for a task (canonical delete cascades do not span
/// schemas).
pub async fn delete_unified_task(ex: impl SqliteExecutor<'_>, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM unified_tasks WHERE id = ?")
        .bind(id)
        .execute(ex)
        .await
        .context("failed to delete unified task")?;

    Ok(result.rows_affected())
}

/// How many mirrored rows exist. Used by migration tooling and tests.
pub async fn count_unified_tasks(ex: impl SqliteExecutor<'_>) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM unified_tasks")
        .fetch_one(ex)
        .await
        .context("failed to count unified tasks")?;

    Ok(row.0)
}
