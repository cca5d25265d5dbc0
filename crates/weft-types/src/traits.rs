//! Behaviour traits shared across crates.
//!
//! These describe the collaborators the control plane talks to but does not
//! implement: LLM-backed agents, session persistence, the pattern
//! orchestrator, the cron engine, and the provider catalogue. Everything here
//! is object-safe; the control plane holds `Arc<dyn ...>` handles.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    ChatOutcome, ScheduleRun, Session, StoredMessage, WeftError, WorkflowPattern,
    WorkflowProgress, WorkflowSchedule,
};

/// Metadata key marking an agent's role.
pub const META_ROLE: &str = "role";
/// Metadata key naming the workflow a coordinator drives.
pub const META_WORKFLOW: &str = "workflow";
/// Role value identifying a workflow coordinator.
pub const ROLE_COORDINATOR: &str = "coordinator";
/// Spawn metadata key overriding the auto-despawn timeout, in minutes.
pub const META_AUTO_DESPAWN_MINUTES: &str = "auto_despawn_minutes";

/// An addressable LLM-driven worker.
///
/// Implementations are expected to be internally synchronized: the control
/// plane shares one instance across readers but always requests a
/// [`fresh_instance`](Agent::fresh_instance) before using an agent as a
/// concurrent work-target.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable agent id.
    fn id(&self) -> &str;

    /// Display name.
    fn name(&self) -> &str {
        self.id()
    }

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Free-form metadata; `role` and `workflow` tags live here.
    fn metadata(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Names of the tools available to the agent.
    fn tools(&self) -> Vec<String> {
        Vec::new()
    }

    /// Idempotently expose a tool to the agent. Returns `true` when the tool
    /// was newly added.
    fn register_tool(&self, _name: &str) -> bool {
        false
    }

    /// A fresh instance sharing the agent's definition but none of its
    /// per-conversation state. Spawn paths must chat against fresh instances
    /// only.
    fn fresh_instance(&self) -> Arc<dyn Agent>;

    /// Swap the underlying LLM provider handle.
    fn switch_provider(&self, _handle: ProviderHandle) -> Result<(), WeftError> {
        Err(WeftError::FailedPrecondition("agent does not support model switching".into()))
    }

    /// Run one conversational turn in `session_id`.
    async fn chat(&self, session_id: &str, message: &str) -> Result<ChatOutcome>;
}

/// Convenience accessors over [`Agent::metadata`].
pub trait AgentMetadataExt {
    /// The workflow name when the agent is tagged `role=coordinator`.
    fn coordinator_workflow(&self) -> Option<String>;
}

impl<T: Agent + ?Sized> AgentMetadataExt for T {
    fn coordinator_workflow(&self) -> Option<String> {
        let meta = self.metadata();
        if meta.get(META_ROLE).map(String::as_str) == Some(ROLE_COORDINATOR) {
            meta.get(META_WORKFLOW).cloned()
        } else {
            None
        }
    }
}

/// Read access to the set of registered agents.
///
/// Implemented by the server-side registry; orchestration components depend
/// on this trait so they sit below the registry in the crate graph.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Look up the shared (read-only) instance of an agent.
    async fn lookup(&self, agent_id: &str) -> Option<Arc<dyn Agent>>;

    /// All registered agent ids.
    async fn agent_ids(&self) -> Vec<String>;

    /// A fresh, fully injected instance suitable as a concurrent
    /// work-target.
    async fn instantiate(&self, agent_id: &str) -> Result<Arc<dyn Agent>, WeftError>;
}

/// Persistent store for sessions and conversation messages.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Persist a new session.
    async fn create_session(&self, session: Session) -> Result<()>;

    /// Load one session.
    async fn get_session(&self, id: &str) -> Result<Option<Session>>;

    /// List sessions, optionally restricted to one agent.
    async fn list_sessions(&self, agent_id: Option<&str>) -> Result<Vec<Session>>;

    /// Remove a session and its messages.
    async fn delete_session(&self, id: &str) -> Result<()>;

    /// Append one conversation message and touch the session.
    async fn append_message(&self, message: StoredMessage) -> Result<()>;

    /// All messages of a session in append order, with stable ids.
    async fn list_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>>;

    /// Bump a session's `updated_at` without appending a message.
    async fn touch_session(&self, id: &str) -> Result<()>;
}

/// Callback fan-out for orchestrator progress records.
pub type ProgressCallback = Arc<dyn Fn(WorkflowProgress) + Send + Sync>;

/// External executor of workflow patterns.
///
/// The control plane resolves agents and records execution state; the
/// orchestrator owns pattern semantics.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Run a (variable-resolved) pattern against the given agents, emitting
    /// progress records through `progress` when provided.
    async fn run(
        &self,
        execution_id: &str,
        pattern: &WorkflowPattern,
        agents: HashMap<String, Arc<dyn Agent>>,
        progress: Option<ProgressCallback>,
    ) -> Result<serde_json::Value>;
}

/// External cron engine with persistence. The scheduler facade owns
/// validation and RPC semantics; this trait owns tick generation and storage.
#[async_trait]
pub trait CronEngine: Send + Sync {
    /// Create or replace a schedule.
    async fn upsert(&self, schedule: WorkflowSchedule) -> Result<()>;

    /// Load one schedule.
    async fn get(&self, id: &str) -> Result<Option<WorkflowSchedule>>;

    /// All schedules.
    async fn list(&self) -> Result<Vec<WorkflowSchedule>>;

    /// Remove a schedule.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Pause or resume a schedule.
    async fn set_paused(&self, id: &str, paused: bool) -> Result<()>;

    /// Run history for a schedule, most recent first.
    async fn history(&self, id: &str) -> Result<Vec<ScheduleRun>>;
}

/// Hot-reloadable library of workflow patterns.
pub trait PatternLibrary: Send + Sync {
    /// Look up a pattern by name.
    fn get(&self, name: &str) -> Option<WorkflowPattern>;

    /// Names of all loaded patterns.
    fn names(&self) -> Vec<String>;

    /// Insert or replace a pattern. Returns `true` when the name was new.
    fn put(&self, pattern: WorkflowPattern) -> bool;

    /// Remove a pattern. Returns `true` when it existed.
    fn remove(&self, name: &str) -> bool;
}

/// Opaque handle to a constructed LLM provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderHandle {
    /// Provider name (catalogue key).
    pub provider: String,
    /// Model identifier within the provider.
    pub model: String,
}

/// Catalogue of known providers and their models.
pub trait ModelRegistry: Send + Sync {
    /// Known provider names.
    fn providers(&self) -> Vec<String>;

    /// Models offered by one provider.
    fn models(&self, provider: &str) -> Vec<String>;
}

/// Constructor of provider handles for dynamic model switches.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    /// Build a provider handle, verifying the (provider, model) pair.
    async fn create(&self, provider: &str, model: &str) -> Result<ProviderHandle, WeftError>;
}
