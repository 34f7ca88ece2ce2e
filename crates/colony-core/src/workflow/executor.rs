//! The workflow executor: drives a phase-based state machine embedded in a
//! task, delegating each phase to an agent resolved through the registry.
//!
//! The loop is sequential per workflow; parallelism is across workflows
//! (spawn one `execute_workflow` per task). Agent errors and timeouts become
//! phase-failure transitions -- only a missing agent or definition aborts the
//! loop, because no recovery edge exists for configuration errors.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use colony_db::models::{Task, TaskStatus};
use colony_db::queries::{tasks as task_db, unified as unified_db};

use super::chimera;
use super::definition::{ParamSource, PhaseSpec, WorkflowDefinition, WorkflowRegistry, WorkflowState};
use crate::agent::AgentRegistry;
use crate::error::{Error, Result};
use crate::event::{Event, EventBus, EventType};
use crate::task::{StatusMeta, TaskRepository, TaskSpec};

/// Worker label the executor writes into `assigned_worker` while it drives a
/// container task, keeping the status/worker invariant intact.
pub const EXECUTOR_WORKER: &str = "workflow-executor";

/// Default ceiling on phase transitions per `execute_workflow` call.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Drives workflow state machines to a terminal phase.
#[derive(Clone)]
pub struct WorkflowExecutor {
    tasks: TaskRepository,
    agents: Arc<AgentRegistry>,
    definitions: Arc<WorkflowRegistry>,
    bus: Arc<EventBus>,
}

impl WorkflowExecutor {
    pub fn new(tasks: TaskRepository, agents: Arc<AgentRegistry>, bus: Arc<EventBus>) -> Self {
        Self {
            tasks,
            agents,
            definitions: Arc::new(WorkflowRegistry::with_builtins()),
            bus,
        }
    }

    /// Replace the definition table (test doubles, custom workflows).
    pub fn with_definitions(mut self, definitions: Arc<WorkflowRegistry>) -> Self {
        self.definitions = definitions;
        self
    }

    pub fn definitions(&self) -> &WorkflowRegistry {
        &self.definitions
    }

    /// Create a Chimera container task. Returns its id.
    pub async fn create_chimera_task(
        &self,
        feature_description: &str,
        target_url: &str,
        staging_url: Option<&str>,
        priority: i64,
    ) -> Result<Uuid> {
        if feature_description.trim().is_empty() {
            return Err(Error::Validation(
                "feature description must not be empty".into(),
            ));
        }
        if target_url.trim().is_empty() {
            return Err(Error::Validation("target URL must not be empty".into()));
        }
        let spec: TaskSpec = chimera::task_spec(feature_description, target_url, staging_url, priority);
        self.tasks.create_task(spec).await
    }

    /// Run a task's workflow until a terminal phase or `max_iterations`.
    ///
    /// Returns the final workflow state. On the success terminal the task is
    /// transitioned to `completed`; on the failure terminal to `failed`.
    /// Caller-initiated cancellation (task moved to `cancelled`) is honored
    /// between phases.
    ///
    /// Errors: `not_found`, `validation_error` (no workflow state),
    /// `configuration_error` (unknown workflow type or missing agent).
    pub async fn execute_workflow(
        &self,
        task_id: Uuid,
        max_iterations: u32,
    ) -> Result<WorkflowState> {
        let task = self
            .tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::not_found("task", task_id))?;

        let workflow_value = task
            .workflow
            .as_ref()
            .ok_or_else(|| Error::Validation(format!("task {task_id} carries no workflow")))?;
        let mut state = WorkflowState::from_value(workflow_value)?;

        let definition = self
            .definitions
            .get(&state.workflow_type)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "no workflow definition registered for {:?}",
                    state.workflow_type
                ))
            })?;

        self.begin_execution(&task).await?;

        tracing::info!(
            task_id = %task_id,
            workflow_type = %state.workflow_type,
            phase = %state.current_phase,
            "starting workflow"
        );

        let payload = task.payload.clone().unwrap_or(Value::Null);
        let mut iterations: u32 = 0;

        while !definition.is_terminal(&state.current_phase) && iterations < max_iterations {
            // Cancellation is checked between phases only; an in-flight
            // agent call is bounded by its phase timeout.
            let current = self
                .tasks
                .get_task(task_id)
                .await?
                .ok_or_else(|| Error::not_found("task", task_id))?;
            if current.status == TaskStatus::Cancelled {
                tracing::info!(task_id = %task_id, "workflow cancelled between phases");
                return Ok(state);
            }

            let phase = definition.phase(&state.current_phase).ok_or_else(|| {
                Error::Validation(format!(
                    "workflow state names undeclared phase {:?}",
                    state.current_phase
                ))
            })?;

            let result = self.execute_phase(&task, phase, &payload, &state).await?;
            let success = matches!(
                result.get("status").and_then(Value::as_str),
                Some("success") | Some("passed")
            );

            self.bus.publish(Event::new(
                EventType::WorkflowPhaseCompleted,
                task.correlation_id.clone(),
                json!({
                    "task_id": task_id,
                    "phase": phase.name,
                    "status": result.get("status"),
                }),
            ));

            let next = if success {
                phase.on_success
            } else if state.retry_count >= state.max_retries {
                // Retry budget exhausted: any further failure goes straight
                // to the failure terminal.
                definition.failure_terminal
            } else {
                let target = phase.on_failure;
                let is_loopback = definition
                    .phase_index(target)
                    .zip(definition.phase_index(phase.name))
                    .is_some_and(|(t, c)| t <= c);
                if is_loopback {
                    state.retry_count += 1;
                    tracing::info!(
                        task_id = %task_id,
                        phase = phase.name,
                        retry_count = state.retry_count,
                        "phase failed, looping back"
                    );
                }
                target
            };

            self.apply_transition(&definition, &mut state, next, &result, success);
            state.current_phase = next.to_string();
            iterations += 1;

            self.persist_state(&task, &definition, &state, i64::from(iterations))
                .await?;

            self.bus.publish(Event::new(
                EventType::WorkflowPhaseEntered,
                task.correlation_id.clone(),
                json!({
                    "task_id": task_id,
                    "phase": next,
                    "iteration": iterations,
                }),
            ));
        }

        self.finish(&task, &definition, &state, iterations, max_iterations)
            .await?;

        Ok(state)
    }

    /// Move the container task into execution under the executor's label.
    async fn begin_execution(&self, task: &Task) -> Result<()> {
        match task.status {
            TaskStatus::Queued => {
                self.tasks
                    .update_task_status(
                        task.id,
                        TaskStatus::Assigned,
                        Some(StatusMeta {
                            assigned_worker: Some(EXECUTOR_WORKER.to_string()),
                            ..StatusMeta::default()
                        }),
                    )
                    .await?;
                self.tasks
                    .update_task_status(task.id, TaskStatus::InProgress, None)
                    .await
            }
            TaskStatus::Assigned => {
                self.tasks
                    .update_task_status(task.id, TaskStatus::InProgress, None)
                    .await
            }
            TaskStatus::InProgress => Ok(()),
            other => Err(Error::State(format!(
                "task {} is {other}; workflows execute from queued/assigned/in_progress",
                task.id
            ))),
        }
    }

    /// Invoke the phase's agent with a hard timeout, normalizing every
    /// failure mode into a `{status: "error", error: ...}` result.
    ///
    /// A missing agent is a `configuration_error` and aborts the loop.
    async fn execute_phase(
        &self,
        task: &Task,
        phase: &PhaseSpec,
        payload: &Value,
        state: &WorkflowState,
    ) -> Result<Value> {
        let agent = self
            .agents
            .get_by_type(phase.agent_type)
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "no agent of type {:?} registered for phase {:?}",
                    phase.agent_type, phase.name
                ))
            })?;

        let params = build_params(phase, payload, state, task.id);

        tracing::info!(
            task_id = %task.id,
            phase = phase.name,
            agent = phase.agent_type,
            action = phase.action,
            "executing workflow phase"
        );

        let outcome = tokio::time::timeout(effective_timeout(phase), agent.execute(params)).await;

        let result = match outcome {
            Ok(Ok(value)) => normalize_result(value),
            Ok(Err(e)) => {
                tracing::warn!(task_id = %task.id, phase = phase.name, error = %e, "phase agent failed");
                json!({ "status": "error", "error": e.to_string() })
            }
            Err(_elapsed) => {
                tracing::warn!(
                    task_id = %task.id,
                    phase = phase.name,
                    timeout_secs = phase.timeout.as_secs(),
                    "phase timed out"
                );
                json!({
                    "status": "error",
                    "error": format!(
                        "{}.{} timed out after {}s",
                        phase.agent_type,
                        phase.action,
                        phase.timeout.as_secs()
                    ),
                })
            }
        };

        Ok(result)
    }

    /// Apply artifact captures for the transition into `next`.
    ///
    /// Captures run only on success transitions, so a loopback failure can
    /// never clobber artifacts from earlier successes. The failure terminal
    /// additionally captures the error message.
    fn apply_transition(
        &self,
        definition: &WorkflowDefinition,
        state: &mut WorkflowState,
        next: &str,
        result: &Value,
        success: bool,
    ) {
        state
            .phase_results
            .insert(state.current_phase.clone(), result.clone());

        if success {
            if let Some(next_phase) = definition.phase(next) {
                for (slot, field) in &next_phase.captures {
                    if let Some(value) = result.get(*field) {
                        state.artifacts.insert((*slot).to_string(), value.clone());
                    }
                }
            }
        } else if next == definition.failure_terminal {
            let message = result
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            state
                .artifacts
                .insert("error_message".to_string(), Value::String(message.clone()));
            state.error_message = Some(message);
        }
    }

    /// Persist workflow state into the task row (and the unified mirror when
    /// dual-write is on).
    async fn persist_state(
        &self,
        task: &Task,
        definition: &WorkflowDefinition,
        state: &WorkflowState,
        phases_completed: i64,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.tasks.pool().begin().await?;

        task_db::set_workflow_state(
            &mut *tx,
            task.id,
            &state.to_value(),
            &state.current_phase,
            now,
        )
        .await?;

        if self.tasks.dual_write_enabled() {
            let updated = task_db::get_task(&mut *tx, task.id)
                .await?
                .ok_or_else(|| Error::not_found("task", task.id))?;
            unified_db::upsert_unified_task(&mut *tx, &updated).await?;
            unified_db::upsert_unified_workflow_task(
                &mut *tx,
                &updated,
                &state.workflow_type,
                definition.total_phases(),
                phases_completed,
                None,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Transition the container task once the workflow is terminal.
    async fn finish(
        &self,
        task: &Task,
        definition: &WorkflowDefinition,
        state: &WorkflowState,
        iterations: u32,
        max_iterations: u32,
    ) -> Result<()> {
        if state.current_phase == definition.success_terminal {
            self.tasks
                .update_task_status(
                    task.id,
                    TaskStatus::Completed,
                    Some(StatusMeta {
                        current_phase: Some(state.current_phase.clone()),
                        ..StatusMeta::default()
                    }),
                )
                .await?;
            tracing::info!(task_id = %task.id, "workflow completed");
            self.bus.publish(Event::new(
                EventType::WorkflowCompleted,
                task.correlation_id.clone(),
                json!({ "task_id": task.id, "iterations": iterations }),
            ));
        } else if state.current_phase == definition.failure_terminal {
            let error = state
                .error_message
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());
            self.tasks
                .update_task_status(
                    task.id,
                    TaskStatus::Failed,
                    Some(StatusMeta {
                        current_phase: Some(state.current_phase.clone()),
                        error_message: Some(error.clone()),
                        ..StatusMeta::default()
                    }),
                )
                .await?;
            tracing::warn!(task_id = %task.id, error = %error, "workflow failed");
            self.bus.publish(Event::new(
                EventType::WorkflowFailed,
                task.correlation_id.clone(),
                json!({ "task_id": task.id, "error": error }),
            ));
        } else {
            tracing::warn!(
                task_id = %task.id,
                phase = %state.current_phase,
                "workflow incomplete after {max_iterations} iterations"
            );
        }
        Ok(())
    }
}

/// Assemble the agent call parameters for a phase.
fn build_params(phase: &PhaseSpec, payload: &Value, state: &WorkflowState, task_id: Uuid) -> Value {
    let mut params = Map::new();
    params.insert("action".to_string(), Value::String(phase.action.to_string()));
    params.insert("task_id".to_string(), Value::String(task_id.to_string()));

    for (name, source) in &phase.params {
        let value = match source {
            ParamSource::Payload(key) => payload.get(*key).cloned(),
            ParamSource::Artifact(slot) => state.artifact(slot).cloned(),
            ParamSource::ArtifactOrPayload(slot, key) => state
                .artifact(slot)
                .filter(|v| !v.is_null())
                .cloned()
                .or_else(|| payload.get(*key).cloned()),
        };
        params.insert((*name).to_string(), value.unwrap_or(Value::Null));
    }

    Value::Object(params)
}

/// Agents reporting no status succeeded; non-object results are wrapped.
fn normalize_result(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            map.entry("status".to_string())
                .or_insert_with(|| Value::String("success".to_string()));
            Value::Object(map)
        }
        other => json!({ "status": "success", "result": other }),
    }
}

/// Timeouts of zero (terminal specs) never reach here, but guard anyway.
fn effective_timeout(phase: &PhaseSpec) -> Duration {
    if phase.timeout.is_zero() {
        Duration::from_secs(1)
    } else {
        phase.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::chimera;

    #[test]
    fn normalize_inserts_default_status() {
        let out = normalize_result(json!({ "pr_id": "PR1" }));
        assert_eq!(out["status"], "success");
        assert_eq!(out["pr_id"], "PR1");
    }

    #[test]
    fn normalize_keeps_explicit_status() {
        let out = normalize_result(json!({ "status": "error" }));
        assert_eq!(out["status"], "error");
    }

    #[test]
    fn params_resolve_payload_and_artifacts() {
        let definition = chimera::definition();
        let mut state = WorkflowState::new(&definition);
        state
            .artifacts
            .insert("test_path".into(), Value::String("t.py".into()));

        let phase = definition.phase(chimera::CODE_IMPLEMENTATION).unwrap();
        let payload = json!({ "feature_description": "feat X", "target_url": "https://app/x" });
        let params = build_params(phase, &payload, &state, Uuid::nil());

        assert_eq!(params["action"], "implement_feature");
        assert_eq!(params["test_path"], "t.py");
        assert_eq!(params["feature"], "feat X");
    }

    #[test]
    fn params_fall_back_to_payload() {
        let definition = chimera::definition();
        let state = WorkflowState::new(&definition);
        let phase = definition.phase(chimera::E2E_VALIDATION).unwrap();
        let payload = json!({ "staging_url": "https://staging/x" });
        let params = build_params(phase, &payload, &state, Uuid::nil());

        assert_eq!(params["url"], "https://staging/x");
        assert_eq!(params["test_path"], Value::Null);
    }
}
