use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Assigned,
    InProgress,
    ReviewPending,
    Approved,
    Rejected,
    ReworkNeeded,
    Escalated,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses are sticky: no transitions out.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// A task is actively held by a worker in these statuses.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Assigned | Self::InProgress)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::ReviewPending => "review_pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::ReworkNeeded => "rework_needed",
            Self::Escalated => "escalated",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "assigned" => Ok(Self::Assigned),
            "in_progress" => Ok(Self::InProgress),
            "review_pending" => Ok(Self::ReviewPending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "rework_needed" => Ok(Self::ReworkNeeded),
            "escalated" => Ok(Self::Escalated),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a single execution attempt of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::Timeout | Self::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for RunStatus {
    type Err = RunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(RunStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RunStatus`] string.
#[derive(Debug, Clone)]
pub struct RunStatusParseError(pub String);

impl fmt::Display for RunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run status: {:?}", self.0)
    }
}

impl std::error::Error for RunStatusParseError {}

// ---------------------------------------------------------------------------

/// Lifecycle status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Idle,
    Offline,
    Error,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Offline => "offline",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerStatus {
    type Err = WorkerStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "offline" => Ok(Self::Offline),
            "error" => Ok(Self::Error),
            other => Err(WorkerStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkerStatus`] string.
#[derive(Debug, Clone)]
pub struct WorkerStatusParseError(pub String);

impl fmt::Display for WorkerStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid worker status: {:?}", self.0)
    }
}

impl std::error::Error for WorkerStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of an execution plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for PlanStatus {
    type Err = PlanStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(PlanStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PlanStatus`] string.
#[derive(Debug, Clone)]
pub struct PlanStatusParseError(pub String);

impl fmt::Display for PlanStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid plan status: {:?}", self.0)
    }
}

impl std::error::Error for PlanStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a planning-queue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlanningStatus {
    Pending,
    Assigned,
    Completed,
    Failed,
}

impl fmt::Display for PlanningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for PlanningStatus {
    type Err = PlanningStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(PlanningStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PlanningStatus`] string.
#[derive(Debug, Clone)]
pub struct PlanningStatusParseError(pub String);

impl fmt::Display for PlanningStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid planning status: {:?}", self.0)
    }
}

impl std::error::Error for PlanningStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- the durable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub task_type: String,
    pub priority: i64,
    pub status: TaskStatus,
    pub current_phase: String,
    pub workflow: Option<Value>,
    pub payload: Option<Value>,
    pub correlation_id: String,
    pub assigned_worker: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub max_retries: i64,
    pub parent_task_id: Option<Uuid>,
    pub plan_id: Option<Uuid>,
    pub tags: Json<Vec<String>>,
    pub summary: Option<String>,
    pub generated_artifacts: Option<Value>,
    pub related_document_ids: Option<Value>,
    pub knowledge_fragments: Option<Value>,
    pub metadata: Option<Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One execution attempt of a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Run {
    pub id: Uuid,
    pub task_id: Uuid,
    pub worker_id: String,
    pub run_number: i64,
    pub status: RunStatus,
    pub phase: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_data: Option<Value>,
    pub error_message: Option<String>,
    pub output_log: Option<String>,
    pub transcript: Option<String>,
}

impl Run {
    /// Duration of the run, once it has reached a terminal status.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|done| done - self.started_at)
    }
}

/// A registered executor process.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Worker {
    pub id: String,
    pub role: String,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub capabilities: Json<Vec<String>>,
    pub current_task_id: Option<Uuid>,
    pub metadata: Option<Value>,
    pub registered_at: DateTime<Utc>,
}

/// An edge in the task dependency DAG.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskDependency {
    pub task_id: Uuid,
    pub depends_on: Uuid,
}

/// A subtask definition within an execution plan -- lighter weight than a
/// full [`Task`], it becomes one when the plan is materialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub task_type: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub estimated_duration: Option<i64>,
}

fn default_priority() -> i64 {
    1
}

/// A declarative multi-subtask program.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionPlan {
    pub id: Uuid,
    pub planning_task_id: Option<Uuid>,
    pub title: String,
    pub description: String,
    pub parent_task_id: Option<Uuid>,
    pub status: PlanStatus,
    pub total_subtasks: i64,
    pub completed_subtasks: i64,
    pub failed_subtasks: i64,
    pub subtasks: Json<Vec<SubTask>>,
    pub dependency_graph: Json<std::collections::HashMap<String, Vec<String>>>,
    /// Stable subtask-id to task-id mapping, present once materialized.
    pub task_mapping: Option<Json<std::collections::HashMap<String, Uuid>>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Runtime progress row for an executing plan.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlanExecution {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub current_phase: String,
    pub progress_percent: i64,
    pub active_subtasks: Json<Vec<String>>,
    pub completed_subtasks: Json<Vec<String>>,
    pub failed_subtasks: Json<Vec<String>>,
    pub blocked_subtasks: Json<Vec<String>>,
    pub execution_notes: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// An incoming request on the planning queue.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlanningRequest {
    pub id: Uuid,
    pub task_description: String,
    pub priority: i64,
    pub requestor: Option<String>,
    pub context_data: Option<Value>,
    pub status: PlanningStatus,
    pub complexity_estimate: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assigned_agent: Option<String>,
}

/// Mirror row in the unified migration schema.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UnifiedTask {
    pub id: Uuid,
    pub correlation_id: String,
    pub task_type: String,
    pub status: String,
    pub agent_type: Option<String>,
    pub priority: i64,
    pub input_data: Option<Value>,
    pub output_data: Option<Value>,
    pub task_metadata: Option<Value>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Workflow-container mirror row in the unified migration schema.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UnifiedWorkflowTask {
    pub task_id: Uuid,
    pub correlation_id: String,
    pub workflow_type: String,
    pub current_phase: String,
    pub total_phases: i64,
    pub phases_completed: i64,
    pub phase_history: Json<Vec<Value>>,
    pub workflow_config: Option<Value>,
    pub workflow_result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Queued,
            TaskStatus::Assigned,
            TaskStatus::InProgress,
            TaskStatus::ReviewPending,
            TaskStatus::Approved,
            TaskStatus::Rejected,
            TaskStatus::ReworkNeeded,
            TaskStatus::Escalated,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        let result = "bogus".parse::<TaskStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn task_status_terminal_set() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Escalated.is_terminal());
    }

    #[test]
    fn run_status_display_roundtrip() {
        let variants = [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Failure,
            RunStatus::Timeout,
            RunStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: RunStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn run_status_invalid() {
        let result = "nope".parse::<RunStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn worker_status_display_roundtrip() {
        let variants = [
            WorkerStatus::Active,
            WorkerStatus::Idle,
            WorkerStatus::Offline,
            WorkerStatus::Error,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: WorkerStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn plan_status_display_roundtrip() {
        let variants = [
            PlanStatus::Pending,
            PlanStatus::InProgress,
            PlanStatus::Completed,
            PlanStatus::Failed,
            PlanStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: PlanStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn planning_status_invalid() {
        let result = "queued".parse::<PlanningStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn subtask_defaults() {
        let json = serde_json::json!({
            "id": "a",
            "title": "Subtask A",
            "task_type": "code"
        });
        let sub: SubTask = serde_json::from_value(json).expect("should deserialize");
        assert_eq!(sub.priority, 1);
        assert!(sub.dependencies.is_empty());
        assert!(sub.payload.is_none());
    }
}
