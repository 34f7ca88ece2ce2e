//! Task repository: CRUD and state-machine-enforced lifecycle over tasks.
//!
//! Every multi-row change (status transition plus worker release, plan
//! counter updates, dual-write mirroring) executes inside one transaction;
//! events are published strictly after commit.

pub mod state;

pub use state::TaskStateMachine;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use colony_db::models::{Task, TaskStatus};
use colony_db::queries::tasks as task_db;
use colony_db::queries::tasks::NewTask;
use colony_db::queries::{runs as run_db, unified as unified_db, workers as worker_db};

use crate::error::{Error, Result};
use crate::event::{Event, EventBus, EventType};
use crate::plan::progress;

/// Input for [`TaskRepository::create_task`].
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub title: String,
    pub task_type: String,
    pub description: String,
    pub priority: i64,
    pub workflow: Option<Value>,
    pub payload: Option<Value>,
    /// Defaults to the allocated task id when absent.
    pub correlation_id: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub max_retries: i64,
    pub parent_task_id: Option<Uuid>,
    pub plan_id: Option<Uuid>,
    pub dependencies: Vec<Uuid>,
    pub tags: Vec<String>,
    pub metadata: Option<Value>,
}

impl TaskSpec {
    pub fn new(title: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            task_type: task_type.into(),
            description: String::new(),
            priority: 1,
            workflow: None,
            payload: None,
            correlation_id: None,
            due_date: None,
            max_retries: 3,
            parent_task_id: None,
            plan_id: None,
            dependencies: Vec::new(),
            tags: Vec::new(),
            metadata: None,
        }
    }
}

/// Optional metadata merged by [`TaskRepository::update_task_status`].
#[derive(Debug, Clone, Default)]
pub struct StatusMeta {
    /// Assign the task to this worker.
    pub assigned_worker: Option<String>,
    pub current_phase: Option<String>,
    pub error_message: Option<String>,
    /// Replace the task's opaque metadata mapping.
    pub metadata: Option<Value>,
}

/// Repository over the `tasks` table, enforcing the task state machine.
#[derive(Clone)]
pub struct TaskRepository {
    pool: SqlitePool,
    bus: Arc<EventBus>,
    dual_write: Arc<AtomicBool>,
}

impl TaskRepository {
    pub fn new(pool: SqlitePool, bus: Arc<EventBus>, dual_write: bool) -> Self {
        Self {
            pool,
            bus,
            dual_write: Arc::new(AtomicBool::new(dual_write)),
        }
    }

    /// Switch off legacy-schema mirroring (post-migration control).
    pub fn disable_dual_write(&self) {
        self.dual_write.store(false, Ordering::SeqCst);
        tracing::info!("dual-write disabled, canonical schema only");
    }

    pub fn dual_write_enabled(&self) -> bool {
        self.dual_write.load(Ordering::SeqCst)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a new task in `queued` status. Returns its id.
    ///
    /// Emits `task.created`. Errors: `validation_error` (empty fields,
    /// unknown dependency, parent/plan mismatch).
    pub async fn create_task(&self, spec: TaskSpec) -> Result<Uuid> {
        if spec.title.trim().is_empty() {
            return Err(Error::Validation("task title must not be empty".into()));
        }
        if spec.task_type.trim().is_empty() {
            return Err(Error::Validation("task_type must not be empty".into()));
        }

        let id = Uuid::new_v4();
        let correlation_id = spec
            .correlation_id
            .clone()
            .unwrap_or_else(|| id.to_string());
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        // A subtask inherits its plan from the parent; a mismatch is a
        // caller bug.
        if let Some(parent_id) = spec.parent_task_id {
            let parent = task_db::get_task(&mut *tx, parent_id)
                .await?
                .ok_or_else(|| Error::not_found("task", parent_id))?;
            if parent.plan_id != spec.plan_id {
                return Err(Error::Validation(format!(
                    "plan_id {:?} does not match parent task's plan {:?}",
                    spec.plan_id, parent.plan_id
                )));
            }
        }

        for dep in &spec.dependencies {
            if task_db::get_task(&mut *tx, *dep).await?.is_none() {
                return Err(Error::Validation(format!("unknown dependency task {dep}")));
            }
        }

        let new = NewTask {
            id,
            title: spec.title,
            description: spec.description,
            task_type: spec.task_type,
            priority: spec.priority,
            workflow: spec.workflow,
            payload: spec.payload,
            correlation_id,
            due_date: spec.due_date,
            max_retries: spec.max_retries,
            parent_task_id: spec.parent_task_id,
            plan_id: spec.plan_id,
            tags: spec.tags,
            metadata: spec.metadata,
        };
        let task = task_db::insert_task(&mut *tx, &new, now).await?;

        for dep in &spec.dependencies {
            task_db::insert_task_dependency(&mut *tx, id, *dep).await?;
        }

        self.mirror(&mut tx, &task).await?;

        tx.commit().await?;

        tracing::info!(task_id = %id, task_type = %task.task_type, "created task");
        self.bus.publish(Event::new(
            EventType::TaskCreated,
            task.correlation_id.clone(),
            serde_json::json!({
                "task_id": id,
                "title": task.title,
                "task_type": task.task_type,
                "priority": task.priority,
            }),
        ));

        Ok(id)
    }

    /// Fetch a task snapshot.
    pub async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        Ok(task_db::get_task(&self.pool, id).await?)
    }

    /// Dependency ids of a task.
    pub async fn get_task_dependencies(&self, id: Uuid) -> Result<Vec<Uuid>> {
        Ok(task_db::get_task_dependencies(&self.pool, id).await?)
    }

    /// All tasks with the given status, unordered.
    pub async fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        Ok(task_db::list_tasks_by_status(&self.pool, status).await?)
    }

    /// Up to `limit` ready queued tasks, ordered by
    /// `priority desc, created_at asc`.
    pub async fn get_queued_tasks(
        &self,
        limit: i64,
        task_type: Option<&str>,
    ) -> Result<Vec<Task>> {
        Ok(task_db::list_queued_ready(&self.pool, limit, task_type).await?)
    }

    /// Transition a task to `new_status`, applying optional metadata.
    ///
    /// Idempotent: a transition to the current status is a no-op and emits
    /// nothing. Emits `task.status_changed` otherwise. Errors: `not_found`,
    /// `state_error` (illegal edge), `conflict` (lost a concurrent race).
    pub async fn update_task_status(
        &self,
        task_id: Uuid,
        new_status: TaskStatus,
        meta: Option<StatusMeta>,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let task = task_db::get_task(&mut *tx, task_id)
            .await?
            .ok_or_else(|| Error::not_found("task", task_id))?;

        if task.status == new_status {
            return Ok(());
        }

        if !TaskStateMachine::is_valid_transition(task.status, new_status) {
            return Err(Error::State(format!(
                "{} -> {} is not a legal transition for task {task_id}",
                task.status, new_status
            )));
        }

        let rows =
            task_db::transition_task_status(&mut *tx, task_id, task.status, new_status, now)
                .await?;
        if rows == 0 {
            return Err(Error::Conflict(format!(
                "task {task_id} was concurrently moved out of {}",
                task.status
            )));
        }

        let mut events = Vec::new();

        // Worker bookkeeping stays coherent with the status in the same
        // transaction: leaving the active pair clears both sides.
        if new_status.is_terminal() || new_status == TaskStatus::Queued {
            task_db::set_assigned_worker(&mut *tx, task_id, None, now).await?;
            worker_db::release_task_holder(&mut *tx, task_id, now).await?;
        }
        if new_status == TaskStatus::Cancelled {
            run_db::cancel_open_runs_for_task(&mut *tx, task_id, "task cancelled", now).await?;
        }

        if let Some(meta) = &meta {
            if let Some(worker) = &meta.assigned_worker {
                task_db::set_assigned_worker(&mut *tx, task_id, Some(worker), now).await?;
            }
            if let Some(phase) = &meta.current_phase {
                task_db::set_current_phase(&mut *tx, task_id, phase, now).await?;
            }
            if let Some(message) = &meta.error_message {
                task_db::set_error_message(&mut *tx, task_id, Some(message), now).await?;
            }
            if let Some(metadata) = &meta.metadata {
                task_db::set_metadata(&mut *tx, task_id, metadata, now).await?;
            }
        }

        // Plan subtasks feed the plan engine's counters inside this same
        // transaction.
        if let Some(plan_id) = task.plan_id {
            if new_status.is_terminal() {
                let plan_events =
                    progress::on_subtask_terminal(&mut *tx, plan_id, &task, new_status, now)
                        .await?;
                events.extend(plan_events);
            }
        }

        let updated = task_db::get_task(&mut *tx, task_id)
            .await?
            .ok_or_else(|| Error::not_found("task", task_id))?;
        self.mirror(&mut tx, &updated).await?;

        tx.commit().await?;

        tracing::debug!(
            task_id = %task_id,
            from = %task.status,
            to = %new_status,
            "task status changed"
        );
        self.bus.publish(Event::new(
            EventType::TaskStatusChanged,
            updated.correlation_id.clone(),
            serde_json::json!({
                "task_id": task_id,
                "from": task.status,
                "to": new_status,
                "error_message": updated.error_message,
            }),
        ));
        for event in events {
            self.bus.publish(event);
        }

        Ok(())
    }

    /// Cancel a task. Idempotent and final: terminal tasks are a no-op.
    pub async fn cancel_task(&self, task_id: Uuid, reason: Option<&str>) -> Result<()> {
        let task = self
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::not_found("task", task_id))?;
        if task.status.is_terminal() {
            return Ok(());
        }
        self.update_task_status(
            task_id,
            TaskStatus::Cancelled,
            Some(StatusMeta {
                error_message: reason.map(str::to_owned),
                ..StatusMeta::default()
            }),
        )
        .await
    }

    /// Delete a task and all its runs.
    ///
    /// Safe only when the task is terminal; `force` overrides.
    pub async fn delete_task(&self, task_id: Uuid, force: bool) -> Result<()> {
        let task = self
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::not_found("task", task_id))?;

        if !task.status.is_terminal() && !force {
            return Err(Error::State(format!(
                "task {task_id} is {} (not terminal); pass force to delete anyway",
                task.status
            )));
        }

        let mut tx = self.pool.begin().await?;
        worker_db::release_task_holder(&mut *tx, task_id, Utc::now()).await?;
        task_db::delete_task(&mut *tx, task_id).await?;
        if self.dual_write_enabled() {
            unified_db::delete_unified_task(&mut *tx, task_id).await?;
        }
        tx.commit().await?;

        tracing::info!(task_id = %task_id, "deleted task");
        Ok(())
    }

    /// Mirror a task row into the unified schema when dual-write is on.
    pub(crate) async fn mirror(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        task: &Task,
    ) -> Result<()> {
        if self.dual_write_enabled() {
            unified_db::upsert_unified_task(&mut **tx, task).await?;
        }
        Ok(())
    }

    /// Mirror helper for callers already holding a connection.
    pub(crate) async fn mirror_conn(&self, conn: &mut SqliteConnection, task: &Task) -> Result<()> {
        if self.dual_write_enabled() {
            unified_db::upsert_unified_task(&mut *conn, task).await?;
        }
        Ok(())
    }
}
