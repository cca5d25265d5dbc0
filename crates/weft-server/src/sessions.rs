//! Session router and agent control surface.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use weft_types::{Agent, Session, StoredMessage, WeftError};

use crate::{AgentSummary, WeftServer};

impl WeftServer {
    /// `CreateSession`: bind a new session to an agent (empty id selects the
    /// default agent).
    pub async fn create_session(&self, agent_id: &str) -> Result<Session, WeftError> {
        let agent = self.registry.resolve(agent_id)?;
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            agent_id: agent.id().to_string(),
            parent_session_id: None,
            created_at: now,
            updated_at: now,
        };
        self.sessions
            .create_session(session.clone())
            .await
            .map_err(|err| WeftError::Internal(err.to_string()))?;
        Ok(session)
    }

    /// `GetSession`.
    pub async fn get_session(&self, session_id: &str) -> Result<Session, WeftError> {
        if session_id.is_empty() {
            return Err(WeftError::InvalidArgument("session id must not be empty".into()));
        }
        self.sessions
            .get_session(session_id)
            .await
            .map_err(|err| WeftError::Internal(err.to_string()))?
            .ok_or_else(|| WeftError::NotFound(format!("session {session_id:?}")))
    }

    /// `ListSessions`: the all-agents join.
    pub async fn list_sessions(&self) -> Result<Vec<Session>, WeftError> {
        self.sessions
            .list_sessions(None)
            .await
            .map_err(|err| WeftError::Internal(err.to_string()))
    }

    /// `DeleteSession`: despawn every spawned child, remove descendant
    /// sessions, then delete the session itself. The persistent delete is
    /// immediate; storage failures are logged and ignored.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), WeftError> {
        let session = self.get_session(session_id).await?;

        if let Some(spawner) = &self.spawner {
            let removed = spawner.despawn_for_parent(&session.id, "parent session deleted").await;
            if removed > 0 {
                info!(session = %session.id, removed, "despawned children of deleted session");
            }
        }

        match self.sessions.list_sessions(None).await {
            Ok(all) => {
                for child in all.iter().filter(|s| s.parent_session_id.as_deref() == Some(session_id))
                {
                    if let Err(err) = self.sessions.delete_session(&child.id).await {
                        warn!(session = %child.id, error = %err, "child session delete failed");
                    }
                }
            }
            Err(err) => warn!(error = %err, "session listing failed during cascade delete"),
        }

        if let Err(err) = self.sessions.delete_session(session_id).await {
            warn!(session = %session_id, error = %err, "session delete failed");
        }
        self.tool_sessions.lock().expect("tool session lock poisoned").remove(session_id);
        Ok(())
    }

    /// `GetConversationHistory`: reloaded from storage so message ids are
    /// stable.
    pub async fn conversation_history(
        &self,
        session_id: &str,
    ) -> Result<Vec<StoredMessage>, WeftError> {
        self.get_session(session_id).await?;
        self.sessions
            .list_messages(session_id)
            .await
            .map_err(|err| WeftError::Internal(err.to_string()))
    }

    /// `ListAgents` with per-agent active-session counts.
    pub async fn list_agents(&self) -> Result<Vec<AgentSummary>, WeftError> {
        let default_id = self.registry.default_id();
        let mut summaries = Vec::new();
        for agent in self.registry.agents() {
            let active_sessions = self
                .sessions
                .list_sessions(Some(agent.id()))
                .await
                .map_err(|err| WeftError::Internal(err.to_string()))?
                .len();
            summaries.push(AgentSummary {
                id: agent.id().to_string(),
                name: agent.name().to_string(),
                description: agent.description().to_string(),
                is_default: default_id.as_deref() == Some(agent.id()),
                active_sessions,
            });
        }
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    /// `AddAgent`.
    pub fn add_agent(&self, agent: Arc<dyn Agent>) -> Result<(), WeftError> {
        self.registry.add_agent(agent)
    }

    /// `UpdateAgent`: atomic in-place swap.
    pub fn update_agent(&self, agent: Arc<dyn Agent>) -> Result<(), WeftError> {
        self.registry.update_agent(agent)
    }

    /// `RemoveAgent`.
    pub fn remove_agent(&self, agent_id: &str) -> Result<(), WeftError> {
        self.registry.remove_agent(agent_id)
    }

    /// `SetDefaultAgent`.
    pub fn set_default_agent(&self, agent_id: &str) -> Result<(), WeftError> {
        self.registry.set_default(agent_id)
    }
}
