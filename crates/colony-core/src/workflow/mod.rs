//! Phase-driven workflow execution: definitions, the Chimera reference
//! instance, and the generic executor.

pub mod chimera;
mod definition;
mod executor;

pub use definition::{
    DEFAULT_WORKFLOW_MAX_RETRIES, ParamSource, PhaseSpec, WorkflowDefinition, WorkflowRegistry,
    WorkflowState,
};
pub use executor::{DEFAULT_MAX_ITERATIONS, EXECUTOR_WORKER, WorkflowExecutor};
