//! Database query functions for the `execution_plans`, `plan_execution`, and
//! `planning_queue` tables.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqliteExecutor;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{ExecutionPlan, PlanExecution, PlanStatus, PlanningRequest, SubTask};

/// Column values for a new execution plan. Status starts as `pending`.
#[derive(Debug, Clone)]
pub struct NewExecutionPlan {
    pub id: Uuid,
    pub planning_task_id: Option<Uuid>,
    pub title: String,
    pub description: String,
    pub parent_task_id: Option<Uuid>,
    pub subtasks: Vec<SubTask>,
    pub dependency_graph: HashMap<String, Vec<String>>,
}

/// Insert a new execution plan and return it.
pub async fn insert_execution_plan(
    ex: impl SqliteExecutor<'_>,
    new: &NewExecutionPlan,
    now: DateTime<Utc>,
) -> Result<ExecutionPlan> {
    let plan = sqlx::query_as::<_, ExecutionPlan>(
        "INSERT INTO execution_plans (id, planning_task_id, title, description, \
                                      parent_task_id, status, total_subtasks, \
                                      subtasks, dependency_graph, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(new.id)
    .bind(new.planning_task_id)
    .bind(&new.title)
    .bind(&new.description)
    .bind(new.parent_task_id)
    .bind(new.subtasks.len() as i64)
    .bind(Json(&new.subtasks))
    .bind(Json(&new.dependency_graph))
    .bind(now)
    .bind(now)
    .fetch_one(ex)
    .await
    .context("failed to insert execution plan")?;

    Ok(plan)
}

/// Fetch a single plan by ID.
pub async fn get_execution_plan(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
) -> Result<Option<ExecutionPlan>> {
    let plan = sqlx::query_as::<_, ExecutionPlan>("SELECT * FROM execution_plans WHERE id = ?")
        .bind(id)
        .fetch_optional(ex)
        .await
        .context("failed to fetch execution plan")?;

    Ok(plan)
}

/// Fetch just the status of a plan.
pub async fn get_plan_status(ex: impl SqliteExecutor<'_>, id: Uuid) -> Result<Option<PlanStatus>> {
    let row: Option<(PlanStatus,)> =
        sqlx::query_as("SELECT status FROM execution_plans WHERE id = ?")
            .bind(id)
            .fetch_optional(ex)
            .await
            .context("failed to fetch plan status")?;

    Ok(row.map(|(status,)| status))
}

/// Atomically transition a plan between statuses (optimistic lock on the
/// expected `from` status). Returns the number of rows affected.
pub async fn transition_plan_status(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    from: PlanStatus,
    to: PlanStatus,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE execution_plans SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(to)
    .bind(now)
    .bind(id)
    .bind(from)
    .execute(ex)
    .await
    .context("failed to transition plan status")?;

    Ok(result.rows_affected())
}

/// Record the subtask-id to task-id mapping produced by materialization.
pub async fn set_task_mapping(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    mapping: &HashMap<String, Uuid>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result =
        sqlx::query("UPDATE execution_plans SET task_mapping = ?, updated_at = ? WHERE id = ?")
            .bind(Json(mapping))
            .bind(now)
            .bind(id)
            .execute(ex)
            .await
            .context("failed to record task mapping")?;

    Ok(result.rows_affected())
}

/// Increment one of the plan's terminal counters.
pub async fn increment_plan_counter(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    completed: bool,
    now: DateTime<Utc>,
) -> Result<u64> {
    let column = if completed {
        "completed_subtasks"
    } else {
        "failed_subtasks"
    };
    let query = format!(
        "UPDATE execution_plans SET {column} = {column} + 1, updated_at = ? WHERE id = ?"
    );
    let result = sqlx::query(&query)
        .bind(now)
        .bind(id)
        .execute(ex)
        .await
        .context("failed to increment plan counter")?;

    Ok(result.rows_affected())
}

/// Add `n` to the failed counter in one statement (bulk cancellation).
pub async fn add_failed_subtasks(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    n: i64,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE execution_plans SET failed_subtasks = failed_subtasks + ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(n)
    .bind(now)
    .bind(id)
    .execute(ex)
    .await
    .context("failed to add failed subtasks")?;

    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------
// Plan execution monitoring
// -----------------------------------------------------------------------

/// Create the progress row for a plan if it does not already exist.
pub async fn insert_plan_execution(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    plan_id: Uuid,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "INSERT INTO plan_execution (id, plan_id, started_at, updated_at) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT (plan_id) DO NOTHING",
    )
    .bind(id)
    .bind(plan_id)
    .bind(now)
    .bind(now)
    .execute(ex)
    .await
    .context("failed to insert plan execution row")?;

    Ok(result.rows_affected())
}

/// Fetch the progress row of a plan.
pub async fn get_plan_execution(
    ex: impl SqliteExecutor<'_>,
    plan_id: Uuid,
) -> Result<Option<PlanExecution>> {
    let row = sqlx::query_as::<_, PlanExecution>("SELECT * FROM plan_execution WHERE plan_id = ?")
        .bind(plan_id)
        .fetch_optional(ex)
        .await
        .context("failed to fetch plan execution row")?;

    Ok(row)
}

/// Rewrite the bookkeeping fields of a plan's progress row.
#[allow(clippy::too_many_arguments)]
pub async fn update_plan_execution(
    ex: impl SqliteExecutor<'_>,
    plan_id: Uuid,
    current_phase: &str,
    progress_percent: i64,
    active: &[String],
    completed: &[String],
    failed: &[String],
    blocked: &[String],
    completed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE plan_execution SET \
             current_phase = ?, progress_percent = ?, \
             active_subtasks = ?, completed_subtasks = ?, \
             failed_subtasks = ?, blocked_subtasks = ?, \
             completed_at = ?, updated_at = ? \
         WHERE plan_id = ?",
    )
    .bind(current_phase)
    .bind(progress_percent)
    .bind(Json(active))
    .bind(Json(completed))
    .bind(Json(failed))
    .bind(Json(blocked))
    .bind(completed_at)
    .bind(now)
    .bind(plan_id)
    .execute(ex)
    .await
    .context("failed to update plan execution row")?;

    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------
// Planning queue
// -----------------------------------------------------------------------

/// Enqueue a planning request. Status starts as `pending`.
pub async fn insert_planning_request(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    task_description: &str,
    priority: i64,
    requestor: Option<&str>,
    context_data: Option<&Value>,
    now: DateTime<Utc>,
) -> Result<PlanningRequest> {
    let request = sqlx::query_as::<_, PlanningRequest>(
        "INSERT INTO planning_queue (id, task_description, priority, requestor, \
                                     context_data, status, created_at) \
         VALUES (?, ?, ?, ?, ?, 'pending', ?) \
         RETURNING *",
    )
    .bind(id)
    .bind(task_description)
    .bind(priority)
    .bind(requestor)
    .bind(context_data)
    .bind(now)
    .fetch_one(ex)
    .await
    .context("failed to insert planning request")?;

    Ok(request)
}

/// Fetch a planning request by ID.
pub async fn get_planning_request(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
) -> Result<Option<PlanningRequest>> {
    let request = sqlx::query_as::<_, PlanningRequest>("SELECT * FROM planning_queue WHERE id = ?")
        .bind(id)
        .fetch_optional(ex)
        .await
        .context("failed to fetch planning request")?;

    Ok(request)
}

/// Assign a pending planning request to a planner agent.
pub async fn assign_planning_request(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    agent: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE planning_queue SET status = 'assigned', assigned_agent = ?, assigned_at = ? \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(agent)
    .bind(now)
    .bind(id)
    .execute(ex)
    .await
    .context("failed to assign planning request")?;

    Ok(result.rows_affected())
}

/// Mark a planning request completed once its plan has been generated.
pub async fn complete_planning_request(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE planning_queue SET status = 'completed', completed_at = ? \
         WHERE id = ? AND status IN ('pending', 'assigned')",
    )
    .bind(now)
    .bind(id)
    .execute(ex)
    .await
    .context("failed to complete planning request")?;

    Ok(result.rows_affected())
}
