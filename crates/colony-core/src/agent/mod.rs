//! The `Agent` trait -- the capability-typed interface every registered
//! agent provides.
//!
//! Concrete agents (reviewer, planner, coder, deployer, tester) implement
//! this trait directly or through an adapter; adapters are transparent to
//! the core. The trait is intentionally object-safe so agents can be stored
//! as `Arc<dyn Agent>` in the [`AgentRegistry`].

mod registry;

pub use registry::{AgentRegistry, RegistryStats};

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Standard agent capabilities, mapping to common task types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Review,
    Plan,
    Code,
    Deploy,
    Test,
    Monitor,
    Orchestrate,
    Custom,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Review => "review",
            Self::Plan => "plan",
            Self::Code => "code",
            Self::Deploy => "deploy",
            Self::Test => "test",
            Self::Monitor => "monitor",
            Self::Orchestrate => "orchestrate",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

impl FromStr for Capability {
    type Err = CapabilityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "review" => Ok(Self::Review),
            "plan" => Ok(Self::Plan),
            "code" => Ok(Self::Code),
            "deploy" => Ok(Self::Deploy),
            "test" => Ok(Self::Test),
            "monitor" => Ok(Self::Monitor),
            "orchestrate" => Ok(Self::Orchestrate),
            "custom" => Ok(Self::Custom),
            other => Err(CapabilityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Capability`] string.
#[derive(Debug, Clone)]
pub struct CapabilityParseError(pub String);

impl fmt::Display for CapabilityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid capability: {:?}", self.0)
    }
}

impl std::error::Error for CapabilityParseError {}

/// Health state reported by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result of an agent health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub state: HealthState,
    pub message: Option<String>,
}

impl AgentHealth {
    pub fn healthy() -> Self {
        Self {
            state: HealthState::Healthy,
            message: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            state: HealthState::Unhealthy,
            message: Some(message.into()),
        }
    }
}

/// Capability provider interface.
///
/// The core treats `task_data` and the returned result as opaque mappings;
/// only workflow definitions interpret their fields.
///
/// # Object Safety
///
/// Every method returns a concrete type, so the trait can be stored as
/// `Arc<dyn Agent>` in the registry.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable unique identifier for this agent instance.
    fn agent_id(&self) -> &str;

    /// Agent type tag (e.g. "guardian-agent", "coder-agent").
    fn agent_type(&self) -> &str;

    /// Capabilities this agent provides.
    fn capabilities(&self) -> &[Capability];

    /// Execute a task. May take arbitrarily long; the caller enforces any
    /// timeout. Idempotency is the agent's responsibility -- the enclosing
    /// run number is threaded through `task_data` for deduplication.
    async fn execute(&self, task_data: Value) -> Result<Value>;

    /// Report health. Failures are caught by the registry and reported as
    /// unhealthy for this agent only.
    async fn health_check(&self) -> Result<AgentHealth>;
}

// Compile-time assertion: Agent must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Agent) {}
};
