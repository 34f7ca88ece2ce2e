//! Workflow definitions: phase-based state machines dispatched to agents.
//!
//! A definition declares its phases in order, each with a target agent type,
//! an action name, success/failure transitions, a hard timeout, parameter
//! sources, and the artifact fields captured on a successful transition into
//! the phase. Definitions live in a [`WorkflowRegistry`] keyed by workflow
//! type -- an explicit static table, populated at construction.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Where a phase parameter's value comes from.
#[derive(Debug, Clone)]
pub enum ParamSource {
    /// A field of the task payload.
    Payload(&'static str),
    /// An accumulated artifact slot.
    Artifact(&'static str),
    /// An artifact slot, falling back to a payload field.
    ArtifactOrPayload(&'static str, &'static str),
}

/// One phase of a workflow definition.
#[derive(Debug, Clone)]
pub struct PhaseSpec {
    pub name: &'static str,
    pub agent_type: &'static str,
    pub action: &'static str,
    pub on_success: &'static str,
    pub on_failure: &'static str,
    pub timeout: Duration,
    /// `(param name, source)` pairs assembled into the agent call.
    pub params: Vec<(&'static str, ParamSource)>,
    /// `(artifact slot, result field)` captured on a successful transition
    /// into this phase.
    pub captures: Vec<(&'static str, &'static str)>,
    pub terminal: bool,
}

impl PhaseSpec {
    /// A terminal phase: no agent, no transitions.
    pub fn terminal(name: &'static str, captures: Vec<(&'static str, &'static str)>) -> Self {
        Self {
            name,
            agent_type: "",
            action: "",
            on_success: "",
            on_failure: "",
            timeout: Duration::ZERO,
            params: Vec::new(),
            captures,
            terminal: true,
        }
    }
}

/// A phase-based workflow state machine definition.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub workflow_type: &'static str,
    /// Declared order defines "earlier phase" for the retry rule.
    pub phases: Vec<PhaseSpec>,
    pub initial_phase: &'static str,
    pub success_terminal: &'static str,
    pub failure_terminal: &'static str,
}

impl WorkflowDefinition {
    pub fn phase(&self, name: &str) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    pub fn is_terminal(&self, name: &str) -> bool {
        self.phase(name).is_some_and(|p| p.terminal)
    }

    pub fn total_phases(&self) -> i64 {
        self.phases.len() as i64
    }

    /// Check internal consistency: transitions and distinguished phases all
    /// reference declared phases, and the terminals are marked as such.
    pub fn validate(&self) -> Result<()> {
        for name in [
            self.initial_phase,
            self.success_terminal,
            self.failure_terminal,
        ] {
            if self.phase(name).is_none() {
                return Err(Error::Validation(format!(
                    "workflow {:?} references undeclared phase {name:?}",
                    self.workflow_type
                )));
            }
        }
        if !self.is_terminal(self.success_terminal) || !self.is_terminal(self.failure_terminal) {
            return Err(Error::Validation(format!(
                "workflow {:?} terminal phases must be marked terminal",
                self.workflow_type
            )));
        }
        for phase in &self.phases {
            if phase.terminal {
                continue;
            }
            for target in [phase.on_success, phase.on_failure] {
                if self.phase(target).is_none() {
                    return Err(Error::Validation(format!(
                        "phase {:?} transitions to undeclared phase {target:?}",
                        phase.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Registry of workflow definitions keyed by workflow type.
pub struct WorkflowRegistry {
    definitions: RwLock<HashMap<&'static str, Arc<WorkflowDefinition>>>,
}

impl WorkflowRegistry {
    /// An empty registry (test doubles register their own definitions).
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
        }
    }

    /// The registry with all built-in definitions loaded.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry
            .register(super::chimera::definition())
            .expect("built-in chimera definition must validate");
        registry
    }

    /// Register a definition, replacing any previous one of the same type.
    pub fn register(&self, definition: WorkflowDefinition) -> Result<()> {
        definition.validate()?;
        let mut definitions = self
            .definitions
            .write()
            .expect("workflow registry lock poisoned");
        definitions.insert(definition.workflow_type, Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, workflow_type: &str) -> Option<Arc<WorkflowDefinition>> {
        let definitions = self
            .definitions
            .read()
            .expect("workflow registry lock poisoned");
        definitions.get(workflow_type).cloned()
    }
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Default workflow retry budget for loopback failures.
pub const DEFAULT_WORKFLOW_MAX_RETRIES: i64 = 3;

/// Mutable workflow state, embedded in the owning task's `workflow` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_type: String,
    pub current_phase: String,
    pub retry_count: i64,
    pub max_retries: i64,
    pub error_message: Option<String>,
    /// Accumulated artifact slots (`test_path`, `code_pr_id`, ...).
    #[serde(default)]
    pub artifacts: Map<String, Value>,
    /// Raw agent results keyed by the phase that produced them.
    #[serde(default)]
    pub phase_results: Map<String, Value>,
}

impl WorkflowState {
    pub fn new(definition: &WorkflowDefinition) -> Self {
        Self {
            workflow_type: definition.workflow_type.to_string(),
            current_phase: definition.initial_phase.to_string(),
            retry_count: 0,
            max_retries: DEFAULT_WORKFLOW_MAX_RETRIES,
            error_message: None,
            artifacts: Map::new(),
            phase_results: Map::new(),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::Validation(format!("malformed workflow state: {e}")))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("workflow state serializes")
    }

    pub fn artifact(&self, slot: &str) -> Option<&Value> {
        self.artifacts.get(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            workflow_type: "tiny",
            phases: vec![
                PhaseSpec {
                    name: "work",
                    agent_type: "worker-agent",
                    action: "work",
                    on_success: "done",
                    on_failure: "dead",
                    timeout: Duration::from_secs(5),
                    params: vec![],
                    captures: vec![],
                    terminal: false,
                },
                PhaseSpec::terminal("done", vec![]),
                PhaseSpec::terminal("dead", vec![("error_message", "error")]),
            ],
            initial_phase: "work",
            success_terminal: "done",
            failure_terminal: "dead",
        }
    }

    #[test]
    fn validate_accepts_consistent_definition() {
        tiny_definition().validate().unwrap();
    }

    #[test]
    fn validate_rejects_dangling_transition() {
        let mut definition = tiny_definition();
        definition.phases[0].on_success = "nowhere";
        assert!(definition.validate().is_err());
    }

    #[test]
    fn validate_rejects_unmarked_terminal() {
        let mut definition = tiny_definition();
        definition.phases[1].terminal = false;
        assert!(definition.validate().is_err());
    }

    #[test]
    fn registry_lookup() {
        let registry = WorkflowRegistry::new();
        registry.register(tiny_definition()).unwrap();
        assert!(registry.get("tiny").is_some());
        assert!(registry.get("huge").is_none());
    }

    #[test]
    fn state_roundtrip() {
        let definition = tiny_definition();
        let mut state = WorkflowState::new(&definition);
        state
            .artifacts
            .insert("test_path".into(), Value::String("t.py".into()));

        let value = state.to_value();
        let back = WorkflowState::from_value(&value).unwrap();
        assert_eq!(back.current_phase, "work");
        assert_eq!(back.artifact("test_path").unwrap(), "t.py");
    }

    #[test]
    fn state_rejects_garbage() {
        assert!(WorkflowState::from_value(&Value::String("nope".into())).is_err());
    }
}
