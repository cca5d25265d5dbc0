//! Chat surface: `Weave`, `StreamWeave`, tool and model control, and the
//! spawn/despawn operations behind the `manage_ephemeral_agents` tool.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use weft_orchestration::{SpawnRequest, SpawnResult};
use weft_types::traits::AgentMetadataExt;
use weft_types::{
    Agent, ChatOutcome, MessageRole, ProgressEvent, ProviderHandle, Session, StoredMessage,
    WeftError,
};

use crate::{WeftServer, EPHEMERAL_AGENTS_TOOL};

/// One provider's model listing.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProviderModels {
    /// Provider name.
    pub provider: String,
    /// Models the provider offers.
    pub models: Vec<String>,
}

impl WeftServer {
    /// `Weave`: one unary chat turn.
    pub async fn weave(
        &self,
        agent_id: &str,
        session_id: &str,
        message: &str,
    ) -> Result<(String, ChatOutcome), WeftError> {
        if message.is_empty() {
            return Err(WeftError::InvalidArgument("message must not be empty".into()));
        }
        let (agent, session_id) = self.prepare_chat(agent_id, session_id).await?;

        let permit = self.governor.acquire(&self.shutdown).await?;
        let outcome = agent.chat(&session_id, message).await;
        drop(permit);
        let outcome = outcome.map_err(WeftError::from)?;

        record_turn(&self.sessions, &session_id, message, &outcome.text).await;
        Ok((session_id, outcome))
    }

    /// `StreamWeave`: run the chat on a worker and stream progress events.
    /// A terminal `Completed` event carrying the final text and cost is
    /// always the last event of a successful stream. The coordinator stays
    /// registered afterwards: its lifetime is the session, so asynchronous
    /// sub-agent replies keep driving injections.
    pub async fn stream_weave(
        &self,
        agent_id: &str,
        session_id: &str,
        message: &str,
    ) -> Result<(String, mpsc::Receiver<ProgressEvent>), WeftError> {
        if message.is_empty() {
            return Err(WeftError::InvalidArgument("message must not be empty".into()));
        }
        let (agent, session_id) = self.prepare_chat(agent_id, session_id).await?;
        let rx = self.progress.open_stream(&session_id);

        let governor = self.governor.clone();
        let progress = self.progress.clone();
        let sessions = self.sessions.clone();
        let cancel = self.shutdown.clone();
        let message = message.to_string();
        let worker_session = session_id.clone();
        tokio::spawn(async move {
            let result = async {
                let permit = governor.acquire(&cancel).await?;
                let outcome = agent.chat(&worker_session, &message).await;
                drop(permit);
                outcome.map_err(WeftError::from)
            }
            .await;

            match result {
                Ok(outcome) => {
                    record_turn(&sessions, &worker_session, &message, &outcome.text).await;
                    progress.emit(
                        &worker_session,
                        ProgressEvent::Completed { text: outcome.text, cost_usd: outcome.cost_usd },
                    );
                }
                Err(err) => {
                    progress.emit(&worker_session, ProgressEvent::Failed { error: err.to_string() });
                }
            }
            progress.close_stream(&worker_session);
        });

        Ok((session_id, rx))
    }

    /// `ListTools` of a resolved agent.
    pub fn list_tools(&self, agent_id: &str) -> Result<Vec<String>, WeftError> {
        Ok(self.registry.resolve(agent_id)?.tools())
    }

    /// `ListAvailableModels` from the model catalogue.
    pub fn list_available_models(&self) -> Result<Vec<ProviderModels>, WeftError> {
        let models = self
            .models
            .as_ref()
            .ok_or_else(|| WeftError::FailedPrecondition("model registry not configured".into()))?;
        let mut listing: Vec<ProviderModels> = models
            .providers()
            .into_iter()
            .map(|provider| ProviderModels { models: models.models(&provider), provider })
            .collect();
        listing.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(listing)
    }

    /// `SwitchModel`: build the provider handle lock-free, then hand it to
    /// the agent.
    pub async fn switch_model(
        &self,
        agent_id: &str,
        provider: &str,
        model: &str,
    ) -> Result<ProviderHandle, WeftError> {
        if provider.is_empty() || model.is_empty() {
            return Err(WeftError::InvalidArgument("provider and model must not be empty".into()));
        }
        let factory = self
            .factory
            .as_ref()
            .ok_or_else(|| WeftError::FailedPrecondition("provider factory not configured".into()))?;
        let agent = self.registry.resolve(agent_id)?;
        let handle = factory.create(provider, model).await?;
        agent.switch_provider(handle.clone())?;
        info!(agent = %agent.id(), provider, model, "model switched");
        Ok(handle)
    }

    /// `SpawnSubAgent` (the `manage_ephemeral_agents` tool surface).
    pub async fn spawn_sub_agent(&self, request: SpawnRequest) -> Result<SpawnResult, WeftError> {
        let spawner = self
            .spawner
            .as_ref()
            .ok_or_else(|| WeftError::Unavailable("spawned-agent manager not configured".into()))?;
        spawner.spawn(request).await
    }

    /// `DespawnSubAgent`. Returns the despawn status string.
    pub async fn despawn_sub_agent(
        &self,
        parent_session_id: &str,
        sub_agent_id: &str,
        reason: &str,
    ) -> Result<String, WeftError> {
        let spawner = self
            .spawner
            .as_ref()
            .ok_or_else(|| WeftError::Unavailable("spawned-agent manager not configured".into()))?;
        Ok(spawner.despawn(parent_session_id, sub_agent_id, reason).await)
    }

    /// Resolve the agent, make sure the session exists, register the
    /// ephemeral-agents tool on first session use, and kick the coordinator
    /// runtime when the agent is tagged as one.
    async fn prepare_chat(
        &self,
        agent_id: &str,
        session_id: &str,
    ) -> Result<(Arc<dyn Agent>, String), WeftError> {
        let agent = self.registry.resolve(agent_id)?;
        let session_id = self.ensure_session(&agent, session_id).await?;

        let first_use = self
            .tool_sessions
            .lock()
            .expect("tool session lock poisoned")
            .insert(session_id.clone());
        if first_use {
            agent.register_tool(EPHEMERAL_AGENTS_TOOL);
        }

        if let Some(workflow) = agent.coordinator_workflow() {
            match &self.coordinator {
                Some(coordinator) => {
                    coordinator.register_coordinator(&session_id, agent.clone(), &workflow).await?;
                }
                None => {
                    warn!(agent = %agent.id(), workflow = %workflow,
                        "coordinator agent without communication planes");
                }
            }
        }
        Ok((agent, session_id))
    }

    async fn ensure_session(
        &self,
        agent: &Arc<dyn Agent>,
        session_id: &str,
    ) -> Result<String, WeftError> {
        if !session_id.is_empty() {
            let existing = self
                .sessions
                .get_session(session_id)
                .await
                .map_err(|err| WeftError::Internal(err.to_string()))?;
            if existing.is_some() {
                return Ok(session_id.to_string());
            }
        }
        // First chat creates the session, honoring a caller-chosen id.
        let id = if session_id.is_empty() { Uuid::new_v4().to_string() } else { session_id.into() };
        let now = Utc::now();
        self.sessions
            .create_session(Session {
                id: id.clone(),
                agent_id: agent.id().to_string(),
                parent_session_id: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .map_err(|err| WeftError::Internal(err.to_string()))?;
        Ok(id)
    }
}

/// Persist one user/agent exchange. Storage failures are logged, not
/// surfaced: the chat already happened.
async fn record_turn(
    sessions: &Arc<dyn weft_types::SessionStorage>,
    session_id: &str,
    user_text: &str,
    agent_text: &str,
) {
    for (role, content) in [(MessageRole::User, user_text), (MessageRole::Agent, agent_text)] {
        let message = StoredMessage {
            id: String::new(),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        if let Err(err) = sessions.append_message(message).await {
            warn!(session = %session_id, error = %err, "failed to persist message");
        }
    }
}
