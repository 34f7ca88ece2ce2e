//! Lifecycle event types emitted by the orchestration core.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// All event types the core (and its agents) publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.status_changed")]
    TaskStatusChanged,
    #[serde(rename = "task.assigned")]
    TaskAssigned,
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "run.failed")]
    RunFailed,
    #[serde(rename = "worker.registered")]
    WorkerRegistered,
    #[serde(rename = "worker.heartbeat")]
    WorkerHeartbeat,
    #[serde(rename = "worker.offline")]
    WorkerOffline,
    #[serde(rename = "plan.started")]
    PlanStarted,
    #[serde(rename = "plan.subtask_ready")]
    PlanSubtaskReady,
    #[serde(rename = "plan.completed")]
    PlanCompleted,
    #[serde(rename = "plan.failed")]
    PlanFailed,
    #[serde(rename = "plan.requested")]
    PlanRequested,
    #[serde(rename = "plan.generated")]
    PlanGenerated,
    #[serde(rename = "workflow.phase_entered")]
    WorkflowPhaseEntered,
    #[serde(rename = "workflow.phase_completed")]
    WorkflowPhaseCompleted,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow.failed")]
    WorkflowFailed,
    #[serde(rename = "review.requested")]
    ReviewRequested,
    #[serde(rename = "review.completed")]
    ReviewCompleted,
    #[serde(rename = "deployment.requested")]
    DeploymentRequested,
    #[serde(rename = "deployment.completed")]
    DeploymentCompleted,
    #[serde(rename = "deployment.failed")]
    DeploymentFailed,
    #[serde(rename = "agent.error")]
    AgentError,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskCreated => "task.created",
            Self::TaskStatusChanged => "task.status_changed",
            Self::TaskAssigned => "task.assigned",
            Self::RunStarted => "run.started",
            Self::RunCompleted => "run.completed",
            Self::RunFailed => "run.failed",
            Self::WorkerRegistered => "worker.registered",
            Self::WorkerHeartbeat => "worker.heartbeat",
            Self::WorkerOffline => "worker.offline",
            Self::PlanStarted => "plan.started",
            Self::PlanSubtaskReady => "plan.subtask_ready",
            Self::PlanCompleted => "plan.completed",
            Self::PlanFailed => "plan.failed",
            Self::PlanRequested => "plan.requested",
            Self::PlanGenerated => "plan.generated",
            Self::WorkflowPhaseEntered => "workflow.phase_entered",
            Self::WorkflowPhaseCompleted => "workflow.phase_completed",
            Self::WorkflowCompleted => "workflow.completed",
            Self::WorkflowFailed => "workflow.failed",
            Self::ReviewRequested => "review.requested",
            Self::ReviewCompleted => "review.completed",
            Self::DeploymentRequested => "deployment.requested",
            Self::DeploymentCompleted => "deployment.completed",
            Self::DeploymentFailed => "deployment.failed",
            Self::AgentError => "agent.error",
        };
        f.write_str(s)
    }
}

impl FromStr for EventType {
    type Err = EventTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task.created" => Ok(Self::TaskCreated),
            "task.status_changed" => Ok(Self::TaskStatusChanged),
            "task.assigned" => Ok(Self::TaskAssigned),
            "run.started" => Ok(Self::RunStarted),
            "run.completed" => Ok(Self::RunCompleted),
            "run.failed" => Ok(Self::RunFailed),
            "worker.registered" => Ok(Self::WorkerRegistered),
            "worker.heartbeat" => Ok(Self::WorkerHeartbeat),
            "worker.offline" => Ok(Self::WorkerOffline),
            "plan.started" => Ok(Self::PlanStarted),
            "plan.subtask_ready" => Ok(Self::PlanSubtaskReady),
            "plan.completed" => Ok(Self::PlanCompleted),
            "plan.failed" => Ok(Self::PlanFailed),
            "plan.requested" => Ok(Self::PlanRequested),
            "plan.generated" => Ok(Self::PlanGenerated),
            "workflow.phase_entered" => Ok(Self::WorkflowPhaseEntered),
            "workflow.phase_completed" => Ok(Self::WorkflowPhaseCompleted),
            "workflow.completed" => Ok(Self::WorkflowCompleted),
            "workflow.failed" => Ok(Self::WorkflowFailed),
            "review.requested" => Ok(Self::ReviewRequested),
            "review.completed" => Ok(Self::ReviewCompleted),
            "deployment.requested" => Ok(Self::DeploymentRequested),
            "deployment.completed" => Ok(Self::DeploymentCompleted),
            "deployment.failed" => Ok(Self::DeploymentFailed),
            "agent.error" => Ok(Self::AgentError),
            other => Err(EventTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EventType`] string.
#[derive(Debug, Clone)]
pub struct EventTypeParseError(pub String);

impl fmt::Display for EventTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid event type: {:?}", self.0)
    }
}

impl std::error::Error for EventTypeParseError {}

/// A lifecycle notification.
///
/// `correlation_id` threads related events (a task, its runs, its workflow
/// phases) together; callers propagate it across components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub source_agent: Option<String>,
    pub payload: Value,
}

impl Event {
    pub fn new(event_type: EventType, correlation_id: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type,
            correlation_id: correlation_id.into(),
            timestamp: Utc::now(),
            source_agent: None,
            payload,
        }
    }

    pub fn with_source(mut self, source_agent: impl Into<String>) -> Self {
        self.source_agent = Some(source_agent.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_display_roundtrip() {
        let variants = [
            EventType::TaskCreated,
            EventType::TaskStatusChanged,
            EventType::TaskAssigned,
            EventType::RunStarted,
            EventType::RunCompleted,
            EventType::RunFailed,
            EventType::WorkerRegistered,
            EventType::WorkerHeartbeat,
            EventType::WorkerOffline,
            EventType::PlanStarted,
            EventType::PlanSubtaskReady,
            EventType::PlanCompleted,
            EventType::PlanFailed,
            EventType::PlanRequested,
            EventType::PlanGenerated,
            EventType::WorkflowPhaseEntered,
            EventType::WorkflowPhaseCompleted,
            EventType::WorkflowCompleted,
            EventType::WorkflowFailed,
            EventType::ReviewRequested,
            EventType::ReviewCompleted,
            EventType::DeploymentRequested,
            EventType::DeploymentCompleted,
            EventType::DeploymentFailed,
            EventType::AgentError,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: EventType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn event_type_invalid() {
        assert!("task.exploded".parse::<EventType>().is_err());
    }

    #[test]
    fn serde_uses_dotted_names() {
        let json = serde_json::to_string(&EventType::TaskCreated).unwrap();
        assert_eq!(json, "\"task.created\"");
    }
}
