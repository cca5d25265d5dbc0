//! Agent registry and default-agent election.
//!
//! An in-memory map plus a default-id pointer behind one rw-lock. Every
//! mutation injects the configured cross-cutting dependencies *before*
//! taking the write lock and then performs a single map assignment, so
//! reload storms cannot deadlock against in-flight readers. Removing an
//! agent merely forgets it; agents are never shut down by the registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, info};

use weft_types::{validate_agent_id, Agent, AgentDirectory, WeftError};

/// Cross-cutting dependency injection run on every registered instance
/// (communication tools, shared memory handles, policies).
pub type AgentInjector = Arc<dyn Fn(&Arc<dyn Agent>) + Send + Sync>;

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, Arc<dyn Agent>>,
    default_id: Option<String>,
}

/// In-memory agent registry.
#[derive(Default)]
pub struct AgentRegistry {
    inner: RwLock<RegistryState>,
    injectors: RwLock<Vec<AgentInjector>>,
}

/// Listing entry for one registered agent.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AgentSummary {
    /// Agent id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Whether this agent is the current default.
    pub is_default: bool,
    /// Live sessions bound to the agent.
    pub active_sessions: usize,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dependency injector applied to every added, updated, or
    /// freshly instantiated agent.
    pub fn add_injector(&self, injector: AgentInjector) {
        self.injectors.write().expect("injector lock poisoned").push(injector);
    }

    /// Add an agent. The first agent added, or one whose id is `default`,
    /// becomes the default. Fails `AlreadyExists` on id collision.
    pub fn add_agent(&self, agent: Arc<dyn Agent>) -> Result<(), WeftError> {
        let id = agent.id().to_string();
        validate_registered_id(&id)?;
        // Dependency injection happens lock-free.
        self.inject(&agent);

        let mut state = self.inner.write().expect("registry lock poisoned");
        if state.agents.contains_key(&id) {
            return Err(WeftError::AlreadyExists(format!("agent {id:?}")));
        }
        let make_default = state.default_id.is_none() || id == "default";
        state.agents.insert(id.clone(), agent);
        if make_default {
            state.default_id = Some(id.clone());
        }
        info!(agent = %id, default = make_default, "agent registered");
        Ok(())
    }

    /// Atomically replace an agent in place (hot reload). All preparation
    /// runs before the write lock; the critical section is one assignment.
    pub fn update_agent(&self, agent: Arc<dyn Agent>) -> Result<(), WeftError> {
        let id = agent.id().to_string();
        self.inject(&agent);

        let mut state = self.inner.write().expect("registry lock poisoned");
        if !state.agents.contains_key(&id) {
            return Err(WeftError::NotFound(format!("agent {id:?}")));
        }
        state.agents.insert(id.clone(), agent);
        debug!(agent = %id, "agent replaced");
        Ok(())
    }

    /// Forget an agent. If it was the default, an arbitrary remaining agent
    /// is elected.
    pub fn remove_agent(&self, agent_id: &str) -> Result<(), WeftError> {
        let mut state = self.inner.write().expect("registry lock poisoned");
        if state.agents.remove(agent_id).is_none() {
            return Err(WeftError::NotFound(format!("agent {agent_id:?}")));
        }
        if state.default_id.as_deref() == Some(agent_id) {
            state.default_id = state.agents.keys().next().cloned();
        }
        info!(agent = %agent_id, "agent removed");
        Ok(())
    }

    /// Make `agent_id` the default.
    pub fn set_default(&self, agent_id: &str) -> Result<(), WeftError> {
        let mut state = self.inner.write().expect("registry lock poisoned");
        if !state.agents.contains_key(agent_id) {
            return Err(WeftError::NotFound(format!("agent {agent_id:?}")));
        }
        state.default_id = Some(agent_id.to_string());
        Ok(())
    }

    /// Current default agent id.
    pub fn default_id(&self) -> Option<String> {
        self.inner.read().expect("registry lock poisoned").default_id.clone()
    }

    /// Resolve a request's agent id: empty selects the default; unknown ids
    /// produce a structured NotFound listing the available ids.
    pub fn resolve(&self, agent_id: &str) -> Result<Arc<dyn Agent>, WeftError> {
        let state = self.inner.read().expect("registry lock poisoned");
        if agent_id.is_empty() {
            let default_id = state
                .default_id
                .as_ref()
                .ok_or_else(|| WeftError::FailedPrecondition("no agents registered".into()))?;
            return Ok(state.agents[default_id].clone());
        }
        match state.agents.get(agent_id) {
            Some(agent) => Ok(agent.clone()),
            None => {
                let mut available: Vec<String> = state.agents.keys().cloned().collect();
                available.sort();
                Err(WeftError::unknown_agent(agent_id, &available))
            }
        }
    }

    /// Shared handle to one agent.
    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.inner.read().expect("registry lock poisoned").agents.get(agent_id).cloned()
    }

    /// All registered agents.
    pub fn agents(&self) -> Vec<Arc<dyn Agent>> {
        self.inner.read().expect("registry lock poisoned").agents.values().cloned().collect()
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").agents.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn inject(&self, agent: &Arc<dyn Agent>) {
        for injector in self.injectors.read().expect("injector lock poisoned").iter() {
            injector(agent);
        }
    }
}

/// Ids arriving through dynamic create APIs are validated per namespace
/// segment, so both `researcher` and `billing:researcher` pass while
/// malformed segments are rejected.
fn validate_registered_id(id: &str) -> Result<(), WeftError> {
    for segment in id.split(':') {
        validate_agent_id(segment)?;
    }
    Ok(())
}

#[async_trait]
impl AgentDirectory for AgentRegistry {
    async fn lookup(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.get(agent_id)
    }

    async fn agent_ids(&self) -> Vec<String> {
        self.inner.read().expect("registry lock poisoned").agents.keys().cloned().collect()
    }

    async fn instantiate(&self, agent_id: &str) -> Result<Arc<dyn Agent>, WeftError> {
        let agent = self
            .get(agent_id)
            .ok_or_else(|| WeftError::NotFound(format!("agent {agent_id:?}")))?;
        let fresh = agent.fresh_instance();
        self.inject(&fresh);
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_orchestration::testing::MockAgentBuilder;

    #[test]
    fn test_first_added_becomes_default() {
        let registry = AgentRegistry::new();
        registry.add_agent(MockAgentBuilder::new("alpha").build()).unwrap();
        registry.add_agent(MockAgentBuilder::new("beta").build()).unwrap();
        assert_eq!(registry.default_id().as_deref(), Some("alpha"));

        // An agent named "default" takes the pointer over.
        registry.add_agent(MockAgentBuilder::new("default").build()).unwrap();
        assert_eq!(registry.default_id().as_deref(), Some("default"));
    }

    #[test]
    fn test_resolve_empty_and_unknown() {
        let registry = AgentRegistry::new();
        registry.add_agent(MockAgentBuilder::new("alpha").build()).unwrap();

        assert_eq!(registry.resolve("").unwrap().id(), "alpha");
        let err = match registry.resolve("ghost") {
            Err(e) => e,
            Ok(_) => panic!("expected resolve(\"ghost\") to fail"),
        };
        assert!(err.to_string().contains("alpha"));
    }

    #[test]
    fn test_remove_reelects_default() {
        let registry = AgentRegistry::new();
        registry.add_agent(MockAgentBuilder::new("alpha").build()).unwrap();
        registry.add_agent(MockAgentBuilder::new("beta").build()).unwrap();

        registry.remove_agent("alpha").unwrap();
        assert_eq!(registry.default_id().as_deref(), Some("beta"));
        registry.remove_agent("beta").unwrap();
        assert!(registry.default_id().is_none());
    }

    #[test]
    fn test_injectors_run_on_add_and_instantiate() {
        let registry = AgentRegistry::new();
        registry.add_injector(Arc::new(|agent| {
            agent.register_tool("send_message");
        }));
        registry.add_agent(MockAgentBuilder::new("alpha").build()).unwrap();
        assert!(registry.get("alpha").unwrap().tools().contains(&"send_message".to_string()));
    }

    #[test]
    fn test_duplicate_and_invalid_ids_rejected() {
        let registry = AgentRegistry::new();
        registry.add_agent(MockAgentBuilder::new("alpha").build()).unwrap();
        assert!(matches!(
            registry.add_agent(MockAgentBuilder::new("alpha").build()),
            Err(WeftError::AlreadyExists(_))
        ));
        assert!(matches!(
            registry.add_agent(MockAgentBuilder::new("Bad Name").build()),
            Err(WeftError::InvalidArgument(_))
        ));
        // Namespaced sub-agent ids are accepted.
        assert!(registry.add_agent(MockAgentBuilder::new("wf:worker").build()).is_ok());
    }

    #[test]
    fn test_update_replaces_atomically() {
        let registry = AgentRegistry::new();
        registry.add_agent(MockAgentBuilder::new("alpha").reply("v1").build()).unwrap();
        registry.update_agent(MockAgentBuilder::new("alpha").reply("v2").build()).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(matches!(
            registry.update_agent(MockAgentBuilder::new("ghost").build()),
            Err(WeftError::NotFound(_))
        ));
    }
}
