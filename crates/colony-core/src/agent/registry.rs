//! Agent registry -- the central index of registered agents.
//!
//! Maintains three indices (by id, by type, by capability) so the workflow
//! executor and dispatchers can route work without knowing agent internals.
//! Reads vastly outnumber writes, so the indices sit behind an `RwLock`;
//! register/unregister take a short exclusive lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use serde::Serialize;

use super::{Agent, AgentHealth, Capability};
use crate::error::{Error, Result};

#[derive(Default)]
struct Indices {
    by_id: HashMap<String, Arc<dyn Agent>>,
    by_type: HashMap<String, Vec<Arc<dyn Agent>>>,
    by_capability: HashMap<Capability, Vec<Arc<dyn Agent>>>,
}

/// Registry cardinalities.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_agents: usize,
    pub agent_types: usize,
    pub capabilities: usize,
    pub agents_by_type: HashMap<String, usize>,
    pub agents_by_capability: HashMap<String, usize>,
}

/// A collection of registered [`Agent`] implementations.
#[derive(Default)]
pub struct AgentRegistry {
    inner: RwLock<Indices>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent.
    ///
    /// Duplicate ids are rejected with a conflict error; replacing an agent
    /// requires an explicit unregister first.
    pub fn register(&self, agent: Arc<dyn Agent>) -> Result<()> {
        let mut inner = self.inner.write().expect("agent registry lock poisoned");

        let id = agent.agent_id().to_string();
        if inner.by_id.contains_key(&id) {
            return Err(Error::Conflict(format!("agent {id} already registered")));
        }

        inner
            .by_type
            .entry(agent.agent_type().to_string())
            .or_default()
            .push(Arc::clone(&agent));
        for capability in agent.capabilities() {
            inner
                .by_capability
                .entry(*capability)
                .or_default()
                .push(Arc::clone(&agent));
        }

        tracing::info!(
            agent_id = %id,
            agent_type = %agent.agent_type(),
            capabilities = ?agent.capabilities(),
            "registered agent"
        );
        inner.by_id.insert(id, agent);
        Ok(())
    }

    /// Unregister an agent, removing it from all indices.
    pub fn unregister(&self, agent_id: &str) -> Result<()> {
        let mut inner = self.inner.write().expect("agent registry lock poisoned");

        let agent = inner
            .by_id
            .remove(agent_id)
            .ok_or_else(|| Error::not_found("agent", agent_id))?;

        if let Some(list) = inner.by_type.get_mut(agent.agent_type()) {
            list.retain(|a| a.agent_id() != agent_id);
            if list.is_empty() {
                inner.by_type.remove(agent.agent_type());
            }
        }
        for capability in agent.capabilities() {
            if let Some(list) = inner.by_capability.get_mut(capability) {
                list.retain(|a| a.agent_id() != agent_id);
                if list.is_empty() {
                    inner.by_capability.remove(capability);
                }
            }
        }

        tracing::info!(agent_id = %agent_id, "unregistered agent");
        Ok(())
    }

    /// Look up an agent by id.
    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        let inner = self.inner.read().expect("agent registry lock poisoned");
        inner.by_id.get(agent_id).cloned()
    }

    /// All agents of a given type.
    pub fn get_by_type(&self, agent_type: &str) -> Vec<Arc<dyn Agent>> {
        let inner = self.inner.read().expect("agent registry lock poisoned");
        inner.by_type.get(agent_type).cloned().unwrap_or_default()
    }

    /// All agents providing a given capability.
    pub fn get_by_capability(&self, capability: Capability) -> Vec<Arc<dyn Agent>> {
        let inner = self.inner.read().expect("agent registry lock poisoned");
        inner
            .by_capability
            .get(&capability)
            .cloned()
            .unwrap_or_default()
    }

    /// All registered agent ids.
    pub fn list_agent_ids(&self) -> Vec<String> {
        let inner = self.inner.read().expect("agent registry lock poisoned");
        inner.by_id.keys().cloned().collect()
    }

    /// Health-check every registered agent concurrently.
    ///
    /// An agent whose check fails is reported as unhealthy; the failure never
    /// affects other agents' results.
    pub async fn health_check_all(&self) -> HashMap<String, AgentHealth> {
        let agents: Vec<Arc<dyn Agent>> = {
            let inner = self.inner.read().expect("agent registry lock poisoned");
            inner.by_id.values().cloned().collect()
        };

        let checks = agents.iter().map(|agent| {
            let agent = Arc::clone(agent);
            async move {
                let health = match agent.health_check().await {
                    Ok(health) => health,
                    Err(e) => {
                        tracing::warn!(
                            agent_id = %agent.agent_id(),
                            error = %e,
                            "agent health check failed"
                        );
                        AgentHealth::unhealthy(e.to_string())
                    }
                };
                (agent.agent_id().to_string(), health)
            }
        });

        join_all(checks).await.into_iter().collect()
    }

    /// Registry cardinalities.
    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().expect("agent registry lock poisoned");
        RegistryStats {
            total_agents: inner.by_id.len(),
            agent_types: inner.by_type.len(),
            capabilities: inner.by_capability.len(),
            agents_by_type: inner
                .by_type
                .iter()
                .map(|(t, list)| (t.clone(), list.len()))
                .collect(),
            agents_by_capability: inner
                .by_capability
                .iter()
                .map(|(c, list)| (c.to_string(), list.len()))
                .collect(),
        }
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().expect("agent registry lock poisoned");
        f.debug_struct("AgentRegistry")
            .field("agents", &inner.by_id.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::HealthState;
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use serde_json::Value;

    struct FakeAgent {
        id: String,
        kind: String,
        caps: Vec<Capability>,
        healthy: bool,
    }

    impl FakeAgent {
        fn new(id: &str, kind: &str, caps: Vec<Capability>) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                kind: kind.to_string(),
                caps,
                healthy: true,
            })
        }

        fn failing(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                kind: "failing-agent".to_string(),
                caps: vec![Capability::Custom],
                healthy: false,
            })
        }
    }

    #[async_trait]
    impl Agent for FakeAgent {
        fn agent_id(&self) -> &str {
            &self.id
        }

        fn agent_type(&self) -> &str {
            &self.kind
        }

        fn capabilities(&self) -> &[Capability] {
            &self.caps
        }

        async fn execute(&self, task_data: Value) -> AnyResult<Value> {
            Ok(task_data)
        }

        async fn health_check(&self) -> AnyResult<AgentHealth> {
            if self.healthy {
                Ok(AgentHealth::healthy())
            } else {
                anyhow::bail!("degraded backend")
            }
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry = AgentRegistry::new();
        registry
            .register(FakeAgent::new("rev-1", "ai-reviewer", vec![Capability::Review]))
            .unwrap();

        assert!(registry.get("rev-1").is_some());
        assert_eq!(registry.get_by_type("ai-reviewer").len(), 1);
        assert_eq!(registry.get_by_capability(Capability::Review).len(), 1);
        assert!(registry.get_by_capability(Capability::Deploy).is_empty());
    }

    #[test]
    fn duplicate_registration_is_conflict() {
        let registry = AgentRegistry::new();
        registry
            .register(FakeAgent::new("rev-1", "ai-reviewer", vec![Capability::Review]))
            .unwrap();
        let err = registry
            .register(FakeAgent::new("rev-1", "ai-reviewer", vec![Capability::Review]))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[test]
    fn unregister_cleans_all_indices() {
        let registry = AgentRegistry::new();
        registry
            .register(FakeAgent::new(
                "multi-1",
                "multi-agent",
                vec![Capability::Code, Capability::Test],
            ))
            .unwrap();

        registry.unregister("multi-1").unwrap();

        assert!(registry.get("multi-1").is_none());
        assert!(registry.get_by_type("multi-agent").is_empty());
        assert!(registry.get_by_capability(Capability::Code).is_empty());
        assert!(registry.get_by_capability(Capability::Test).is_empty());
    }

    #[test]
    fn unregister_unknown_is_not_found() {
        let registry = AgentRegistry::new();
        let err = registry.unregister("ghost").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn health_check_isolates_failures() {
        let registry = AgentRegistry::new();
        registry
            .register(FakeAgent::new("ok-1", "ok-agent", vec![Capability::Custom]))
            .unwrap();
        registry.register(FakeAgent::failing("bad-1")).unwrap();

        let health = registry.health_check_all().await;
        assert_eq!(health.len(), 2);
        assert_eq!(health["ok-1"].state, HealthState::Healthy);
        assert_eq!(health["bad-1"].state, HealthState::Unhealthy);
    }

    #[test]
    fn stats_cardinalities() {
        let registry = AgentRegistry::new();
        registry
            .register(FakeAgent::new("a", "kind-a", vec![Capability::Review]))
            .unwrap();
        registry
            .register(FakeAgent::new("b", "kind-a", vec![Capability::Review, Capability::Plan]))
            .unwrap();

        let stats = registry.stats();
        assert_eq!(stats.total_agents, 2);
        assert_eq!(stats.agent_types, 1);
        assert_eq!(stats.agents_by_type["kind-a"], 2);
        assert_eq!(stats.agents_by_capability["review"], 2);
        assert_eq!(stats.agents_by_capability["plan"], 1);
    }
}
