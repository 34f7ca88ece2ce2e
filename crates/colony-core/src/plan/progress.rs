//! Plan progress tracking.
//!
//! [`on_subtask_terminal`] runs inside the task repository's transaction
//! whenever a plan subtask reaches a terminal state: it maintains the plan
//! counters and the `plan_execution` bookkeeping row, evaluates the plan's
//! own terminal conditions, and returns the events to publish after commit.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

use colony_db::models::{PlanStatus, Task, TaskStatus};
use colony_db::queries::{plans as plan_db, runs as run_db, tasks as task_db};

use crate::event::{Event, EventType};

/// Apply the effects of a plan subtask reaching `new_status`.
///
/// `completed` increments the completed counter; `failed` and `cancelled`
/// both count against the failed counter so that
/// `completed + failed + non-terminal = total` holds at every observation.
pub async fn on_subtask_terminal(
    conn: &mut SqliteConnection,
    plan_id: Uuid,
    task: &Task,
    new_status: TaskStatus,
    now: DateTime<Utc>,
) -> Result<Vec<Event>> {
    let mut events = Vec::new();

    let completed = new_status == TaskStatus::Completed;
    plan_db::increment_plan_counter(&mut *conn, plan_id, completed, now).await?;

    let Some(plan) = plan_db::get_execution_plan(&mut *conn, plan_id).await? else {
        tracing::warn!(plan_id = %plan_id, task_id = %task.id, "terminal subtask references unknown plan");
        return Ok(events);
    };

    // Refresh the plan_execution bookkeeping row from actual task statuses.
    refresh_plan_execution(&mut *conn, &plan, now).await?;

    if plan.status.is_terminal() {
        return Ok(events);
    }

    // The plan row was re-read after the increment, so the counters are
    // already current.
    let completed_count = plan.completed_subtasks;
    let failed_count = plan.failed_subtasks;

    if completed && completed_count == plan.total_subtasks {
        finish_plan(&mut *conn, &plan, PlanStatus::Completed, now).await?;
        events.push(Event::new(
            EventType::PlanCompleted,
            plan_id.to_string(),
            serde_json::json!({
                "plan_id": plan_id,
                "completed_subtasks": completed_count,
            }),
        ));
        return Ok(events);
    }

    if !completed {
        // A failed subtask sinks the plan only when something depends on it
        // (critical path); a failed leaf leaves the plan running with
        // truthful counters.
        let dependents = task_db::count_dependents(&mut *conn, task.id).await?;
        if dependents > 0 {
            let cancelled = task_db::cancel_queued_tasks_for_plan(&mut *conn, plan_id, now).await?;
            if !cancelled.is_empty() {
                plan_db::add_failed_subtasks(&mut *conn, plan_id, cancelled.len() as i64, now)
                    .await?;
            }
            for victim in &cancelled {
                run_db::cancel_open_runs_for_task(&mut *conn, victim.id, "plan failed", now)
                    .await?;
                events.push(Event::new(
                    EventType::TaskStatusChanged,
                    victim.correlation_id.clone(),
                    serde_json::json!({
                        "task_id": victim.id,
                        "from": "queued",
                        "to": "cancelled",
                    }),
                ));
            }

            finish_plan(&mut *conn, &plan, PlanStatus::Failed, now).await?;
            events.push(Event::new(
                EventType::PlanFailed,
                plan_id.to_string(),
                serde_json::json!({
                    "plan_id": plan_id,
                    "failed_task_id": task.id,
                    "failed_subtasks": failed_count + cancelled.len() as i64,
                }),
            ));
        }
        return Ok(events);
    }

    // Completion may have unblocked dependents.
    let ready = task_db::ready_dependents_of(&mut *conn, task.id).await?;
    for dependent in ready {
        events.push(Event::new(
            EventType::PlanSubtaskReady,
            plan_id.to_string(),
            serde_json::json!({
                "plan_id": plan_id,
                "task_id": dependent.id,
                "title": dependent.title,
            }),
        ));
    }

    Ok(events)
}

/// Move a plan to a terminal status and close out its progress row.
async fn finish_plan(
    conn: &mut SqliteConnection,
    plan: &colony_db::models::ExecutionPlan,
    to: PlanStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    // The plan may still be pending if subtasks were driven without
    // mark_plan_execution_started.
    let moved = plan_db::transition_plan_status(&mut *conn, plan.id, plan.status, to, now).await?;
    if moved == 0 {
        tracing::warn!(plan_id = %plan.id, from = %plan.status, to = %to, "plan status raced during finish");
    }

    if let Some(exec) = plan_db::get_plan_execution(&mut *conn, plan.id).await? {
        plan_db::update_plan_execution(
            &mut *conn,
            plan.id,
            &to.to_string(),
            exec.progress_percent,
            &exec.active_subtasks.0,
            &exec.completed_subtasks.0,
            &exec.failed_subtasks.0,
            &exec.blocked_subtasks.0,
            Some(now),
            now,
        )
        .await?;
    }
    Ok(())
}

/// Recompute the `plan_execution` subtask lists from current task statuses.
async fn refresh_plan_execution(
    conn: &mut SqliteConnection,
    plan: &colony_db::models::ExecutionPlan,
    now: DateTime<Utc>,
) -> Result<()> {
    let Some(exec) = plan_db::get_plan_execution(&mut *conn, plan.id).await? else {
        return Ok(());
    };

    let tasks = task_db::list_tasks_for_plan(&mut *conn, plan.id).await?;

    // Label tasks by their plan-local subtask key where the mapping knows
    // them, falling back to the task id.
    let label = |task: &Task| -> String {
        if let Some(mapping) = &plan.task_mapping {
            for (key, id) in mapping.0.iter() {
                if *id == task.id {
                    return key.clone();
                }
            }
        }
        task.id.to_string()
    };

    let mut active = Vec::new();
    let mut completed = Vec::new();
    let mut failed = Vec::new();
    let mut blocked = Vec::new();
    for task in &tasks {
        match task.status {
            TaskStatus::Assigned | TaskStatus::InProgress => active.push(label(task)),
            TaskStatus::Completed => completed.push(label(task)),
            TaskStatus::Failed | TaskStatus::Cancelled => failed.push(label(task)),
            TaskStatus::Queued => {
                if task_db::unmet_dependency_count(&mut *conn, task.id).await? > 0 {
                    blocked.push(label(task));
                }
            }
            _ => {}
        }
    }

    let progress = if plan.total_subtasks > 0 {
        (completed.len() as i64 * 100) / plan.total_subtasks
    } else {
        0
    };

    plan_db::update_plan_execution(
        &mut *conn,
        plan.id,
        &exec.current_phase,
        progress,
        &active,
        &completed,
        &failed,
        &blocked,
        exec.completed_at,
        now,
    )
    .await?;

    Ok(())
}
