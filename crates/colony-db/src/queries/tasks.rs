//! Database query functions for the `tasks` and `task_dependencies` tables.
//!
//! Functions are generic over [`SqliteExecutor`] so callers can run them
//! against the pool directly or compose several into one transaction via
//! `&mut *tx`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{SqliteConnection, SqliteExecutor};
use uuid::Uuid;

use crate::models::{Task, TaskStatus};

/// Column values for a new task row. Status starts as `queued`,
/// `current_phase` as `start`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub task_type: String,
    pub priority: i64,
    pub workflow: Option<Value>,
    pub payload: Option<Value>,
    pub correlation_id: String,
    pub due_date: Option<DateTime<Utc>>,
    pub max_retries: i64,
    pub parent_task_id: Option<Uuid>,
    pub plan_id: Option<Uuid>,
    pub tags: Vec<String>,
    pub metadata: Option<Value>,
}

/// Insert a new task row and return it.
pub async fn insert_task(
    ex: impl SqliteExecutor<'_>,
    new: &NewTask,
    now: DateTime<Utc>,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (id, title, description, task_type, priority, status, \
                            current_phase, workflow, payload, correlation_id, \
                            due_date, max_retries, parent_task_id, plan_id, tags, \
                            metadata, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, 'queued', 'start', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(new.id)
    .bind(&new.title)
    .bind(&new.description)
    .bind(&new.task_type)
    .bind(new.priority)
    .bind(&new.workflow)
    .bind(&new.payload)
    .bind(&new.correlation_id)
    .bind(new.due_date)
    .bind(new.max_retries)
    .bind(new.parent_task_id)
    .bind(new.plan_id)
    .bind(Json(&new.tags))
    .bind(&new.metadata)
    .bind(now)
    .bind(now)
    .fetch_one(ex)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(ex: impl SqliteExecutor<'_>, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(ex)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks with a given status, unordered.
pub async fn list_tasks_by_status(
    ex: impl SqliteExecutor<'_>,
    status: TaskStatus,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE status = ?")
        .bind(status)
        .fetch_all(ex)
        .await
        .context("failed to list tasks by status")?;

    Ok(tasks)
}

/// List all tasks belonging to a plan, ordered by creation time.
pub async fn list_tasks_for_plan(ex: impl SqliteExecutor<'_>, plan_id: Uuid) -> Result<Vec<Task>> {
    let tasks =
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE plan_id = ? ORDER BY created_at ASC")
            .bind(plan_id)
            .fetch_all(ex)
            .await
            .context("failed to list tasks for plan")?;

    Ok(tasks)
}

/// List queued tasks that are ready for execution (all dependencies
/// `completed`), ordered by `priority DESC, created_at ASC`.
pub async fn list_queued_ready(
    ex: impl SqliteExecutor<'_>,
    limit: i64,
    task_type: Option<&str>,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* FROM tasks t \
         WHERE t.status = 'queued' \
           AND (? IS NULL OR t.task_type = ?) \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_dependencies td \
               JOIN tasks dep ON dep.id = td.depends_on \
               WHERE td.task_id = t.id AND dep.status != 'completed' \
           ) \
         ORDER BY t.priority DESC, t.created_at ASC \
         LIMIT ?",
    )
    .bind(task_type)
    .bind(task_type)
    .bind(limit)
    .fetch_all(ex)
    .await
    .context("failed to list ready queued tasks")?;

    Ok(tasks)
}

/// Return the highest-priority ready queued task for a plan, if any.
pub async fn next_ready_for_plan(
    ex: impl SqliteExecutor<'_>,
    plan_id: Uuid,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "SELECT t.* FROM tasks t \
         WHERE t.plan_id = ? \
           AND t.status = 'queued' \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_dependencies td \
               JOIN tasks dep ON dep.id = td.depends_on \
               WHERE td.task_id = t.id AND dep.status != 'completed' \
           ) \
         ORDER BY t.priority DESC, t.created_at ASC \
         LIMIT 1",
    )
    .bind(plan_id)
    .fetch_optional(ex)
    .await
    .context("failed to fetch next ready subtask")?;

    Ok(task)
}

/// Atomically transition a task from one status to another.
///
/// Uses optimistic locking: the UPDATE's WHERE clause includes
/// `status = from`, so the row is only updated if the current status matches.
/// Returns the number of rows affected (0 means the status did not match).
pub async fn transition_task_status(
    ex: impl SqliteExecutor<'_>,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
        .bind(to)
        .bind(now)
        .bind(task_id)
        .bind(from)
        .execute(ex)
        .await
        .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Set or clear the assigned worker on a task.
pub async fn set_assigned_worker(
    ex: impl SqliteExecutor<'_>,
    task_id: Uuid,
    worker_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET assigned_worker = ?, updated_at = ? WHERE id = ?")
        .bind(worker_id)
        .bind(now)
        .bind(task_id)
        .execute(ex)
        .await
        .context("failed to set assigned worker")?;

    Ok(result.rows_affected())
}

/// Set the current phase label on a task.
pub async fn set_current_phase(
    ex: impl SqliteExecutor<'_>,
    task_id: Uuid,
    phase: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET current_phase = ?, updated_at = ? WHERE id = ?")
        .bind(phase)
        .bind(now)
        .bind(task_id)
        .execute(ex)
        .await
        .context("failed to set current phase")?;

    Ok(result.rows_affected())
}

/// Set the error message on a task.
pub async fn set_error_message(
    ex: impl SqliteExecutor<'_>,
    task_id: Uuid,
    message: Option<&str>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET error_message = ?, updated_at = ? WHERE id = ?")
        .bind(message)
        .bind(now)
        .bind(task_id)
        .execute(ex)
        .await
        .context("failed to set error message")?;

    Ok(result.rows_affected())
}

/// Replace the metadata mapping on a task.
pub async fn set_metadata(
    ex: impl SqliteExecutor<'_>,
    task_id: Uuid,
    metadata: &Value,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET metadata = ?, updated_at = ? WHERE id = ?")
        .bind(metadata)
        .bind(now)
        .bind(task_id)
        .execute(ex)
        .await
        .context("failed to set task metadata")?;

    Ok(result.rows_affected())
}

/// Persist workflow state and the matching phase label on a task.
pub async fn set_workflow_state(
    ex: impl SqliteExecutor<'_>,
    task_id: Uuid,
    workflow: &Value,
    current_phase: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET workflow = ?, current_phase = ?, updated_at = ? WHERE id = ?",
    )
    .bind(workflow)
    .bind(current_phase)
    .bind(now)
    .bind(task_id)
    .execute(ex)
    .await
    .context("failed to persist workflow state")?;

    Ok(result.rows_affected())
}

/// Atomically claim the highest-priority ready queued task.
///
/// The pick and the `queued -> assigned` transition are a single UPDATE with
/// a scalar subquery, so two concurrent claimants can never both receive the
/// same task. The capability filter matches `task_type` equality or tag
/// membership.
pub async fn claim_next_ready(
    ex: impl SqliteExecutor<'_>,
    worker_id: &str,
    capability_filter: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks SET status = 'assigned', assigned_worker = ?, updated_at = ? \
         WHERE status = 'queued' AND id = ( \
             SELECT t.id FROM tasks t \
             WHERE t.status = 'queued' \
               AND (? IS NULL OR t.task_type = ? OR EXISTS ( \
                   SELECT 1 FROM json_each(t.tags) jt WHERE jt.value = ? \
               )) \
               AND NOT EXISTS ( \
                   SELECT 1 FROM task_dependencies td \
                   JOIN tasks dep ON dep.id = td.depends_on \
                   WHERE td.task_id = t.id AND dep.status != 'completed' \
               ) \
             ORDER BY t.priority DESC, t.created_at ASC \
             LIMIT 1 \
         ) \
         RETURNING *",
    )
    .bind(worker_id)
    .bind(now)
    .bind(capability_filter)
    .bind(capability_filter)
    .bind(capability_filter)
    .fetch_optional(ex)
    .await
    .context("failed to claim next ready task")?;

    Ok(task)
}

/// Requeue a held task: `assigned`/`in_progress` back to `queued` with the
/// worker cleared. Returns the number of rows affected.
pub async fn requeue_task(
    ex: impl SqliteExecutor<'_>,
    task_id: Uuid,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = 'queued', assigned_worker = NULL, updated_at = ? \
         WHERE id = ? AND status IN ('assigned', 'in_progress')",
    )
    .bind(now)
    .bind(task_id)
    .execute(ex)
    .await
    .context("failed to requeue task")?;

    Ok(result.rows_affected())
}

/// Cancel all still-queued tasks of a plan. Returns the cancelled tasks.
pub async fn cancel_queued_tasks_for_plan(
    ex: impl SqliteExecutor<'_>,
    plan_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "UPDATE tasks SET status = 'cancelled', updated_at = ? \
         WHERE plan_id = ? AND status = 'queued' \
         RETURNING *",
    )
    .bind(now)
    .bind(plan_id)
    .fetch_all(ex)
    .await
    .context("failed to cancel queued plan tasks")?;

    Ok(tasks)
}

/// Delete a task. Runs and dependency edges follow via `ON DELETE CASCADE`.
pub async fn delete_task(ex: impl SqliteExecutor<'_>, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
        .bind(task_id)
        .execute(ex)
        .await
        .context("failed to delete task")?;

    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------
// Dependency queries
// -----------------------------------------------------------------------

/// Insert a dependency edge: `task_id` depends on `depends_on`.
///
/// Uses `ON CONFLICT DO NOTHING` so this is idempotent.
pub async fn insert_task_dependency(
    ex: impl SqliteExecutor<'_>,
    task_id: Uuid,
    depends_on: Uuid,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_dependencies (task_id, depends_on) VALUES (?, ?) \
         ON CONFLICT DO NOTHING",
    )
    .bind(task_id)
    .bind(depends_on)
    .execute(ex)
    .await
    .context("failed to insert task dependency")?;

    Ok(())
}

/// Get the IDs of all tasks that a given task depends on.
pub async fn get_task_dependencies(
    ex: impl SqliteExecutor<'_>,
    task_id: Uuid,
) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT depends_on FROM task_dependencies WHERE task_id = ?")
            .bind(task_id)
            .fetch_all(ex)
            .await
            .context("failed to get task dependencies")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Count how many dependencies of a task are not yet `completed`.
pub async fn unmet_dependency_count(ex: impl SqliteExecutor<'_>, task_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM task_dependencies td \
         JOIN tasks dep ON dep.id = td.depends_on \
         WHERE td.task_id = ? AND dep.status != 'completed'",
    )
    .bind(task_id)
    .fetch_one(ex)
    .await
    .context("failed to count unmet dependencies")?;

    Ok(row.0)
}

/// Batch variant of [`unmet_dependency_count`]: one grouped query over the
/// union of the given tasks' dependencies. Tasks without edges are absent
/// from the result (no unmet dependencies).
pub async fn unmet_dependency_counts(
    conn: &mut SqliteConnection,
    task_ids: &[Uuid],
) -> Result<Vec<(Uuid, i64)>> {
    if task_ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut builder = sqlx::QueryBuilder::new(
        "SELECT td.task_id, \
                SUM(CASE WHEN dep.status != 'completed' THEN 1 ELSE 0 END) AS unmet \
         FROM task_dependencies td \
         JOIN tasks dep ON dep.id = td.depends_on \
         WHERE td.task_id IN (",
    );
    let mut separated = builder.separated(", ");
    for id in task_ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(") GROUP BY td.task_id");

    let rows: Vec<(Uuid, i64)> = builder
        .build_query_as()
        .fetch_all(conn)
        .await
        .context("failed to batch-count unmet dependencies")?;

    Ok(rows)
}

/// Count the tasks that depend on the given task.
pub async fn count_dependents(ex: impl SqliteExecutor<'_>, task_id: Uuid) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM task_dependencies WHERE depends_on = ?")
            .bind(task_id)
            .fetch_one(ex)
            .await
            .context("failed to count dependents")?;

    Ok(row.0)
}

/// Dependents of a task that are queued and now fully ready.
///
/// Used after a task completes to announce newly unblocked subtasks.
pub async fn ready_dependents_of(ex: impl SqliteExecutor<'_>, task_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* FROM tasks t \
         JOIN task_dependencies td ON td.task_id = t.id \
         WHERE td.depends_on = ? \
           AND t.status = 'queued' \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_dependencies td2 \
               JOIN tasks dep ON dep.id = td2.depends_on \
               WHERE td2.task_id = t.id AND dep.status != 'completed' \
           )",
    )
    .bind(task_id)
    .fetch_all(ex)
    .await
    .context("failed to fetch ready dependents")?;

    Ok(tasks)
}
