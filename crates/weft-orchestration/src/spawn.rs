//! Dynamic spawn/despawn of sub-agents from a parent session's tool call.
//!
//! Each spawned agent gets a fresh agent instance, its own sub-session
//! linked to the parent, optional auto-subscriptions on the broadcast bus, a
//! background message loop that answers bus traffic, and a lifecycle monitor
//! that despawns it after a period of inactivity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use weft_comms::{MessageBus, MessageQueue};
use weft_runtime::{ConcurrencyGovernor, ProgressMultiplexer};
use weft_types::{
    Agent, AgentDirectory, BusMessage, MessagePayload, ProgressEvent, Session, SessionStorage,
    WeftError, META_AUTO_DESPAWN_MINUTES, META_IN_REPLY_TO,
};

use crate::{
    DEFAULT_AUTO_DESPAWN, DEFAULT_SPAWN_LIMIT, SPAWNED_CHAT_TIMEOUT, SPAWN_LIFECYCLE_TICK,
    SPAWN_SUBSCRIBE_BUFFER, SUB_AGENT_NOTIFY_BUFFER,
};

/// Despawn status for a sub-agent that could not be located.
pub const DESPAWN_NOT_FOUND: &str = "not_found";
/// Despawn status after successful cleanup.
pub const DESPAWN_OK: &str = "despawned";
/// Spawn status after successful startup.
pub const SPAWN_OK: &str = "spawned";

/// Request to spawn a sub-agent.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SpawnRequest {
    /// Session of the spawning agent.
    pub parent_session_id: String,
    /// Id of the spawning agent.
    pub parent_agent_id: String,
    /// Registered agent the spawn is based on.
    pub base_agent_id: String,
    /// Optional workflow namespace; defaults to `<parent-agent-id>-spawn`.
    pub workflow_id: Option<String>,
    /// Topics the sub-agent subscribes to on startup.
    pub auto_subscribe_topics: Vec<String>,
    /// Free-form metadata; `auto_despawn_minutes` overrides the inactivity
    /// window.
    pub metadata: HashMap<String, String>,
    /// Optional first prompt delivered once the sub-agent is up.
    pub initial_message: Option<String>,
}

/// Result of a successful spawn.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SpawnResult {
    /// Namespaced sub-agent id (`namespace:base-id`).
    pub sub_agent_id: String,
    /// The sub-agent's session.
    pub session_id: String,
    /// Status tag, always [`SPAWN_OK`].
    pub status: String,
    /// Topics that were actually subscribed (partial success is success).
    pub subscribed_topics: Vec<String>,
}

/// Tracking record for one spawned agent, keyed by sub-session id.
pub struct SpawnedAgentContext {
    /// Parent session that spawned the agent.
    pub parent_session_id: String,
    /// Agent that issued the spawn.
    pub parent_agent_id: String,
    /// Namespaced sub-agent id.
    pub sub_agent_id: String,
    /// The sub-agent's own session.
    pub sub_session_id: String,
    /// Workflow namespace when one was given.
    pub workflow_id: Option<String>,
    /// Spawn timestamp.
    pub spawned_at: DateTime<Utc>,
    /// Bus subscription ids bound to the message loop.
    pub subscription_ids: Vec<String>,
    /// Spawn metadata as given.
    pub metadata: HashMap<String, String>,
    /// Inactivity window before auto-despawn.
    pub auto_despawn: Duration,
    agent: Arc<dyn Agent>,
    receivers: Mutex<Vec<mpsc::Receiver<BusMessage>>>,
    notify_tx: mpsc::Sender<()>,
    loop_cancel: CancellationToken,
    lifecycle_cancel: CancellationToken,
}

struct SpawnInner {
    contexts: DashMap<String, Arc<SpawnedAgentContext>>,
    bus: Arc<MessageBus>,
    queue: Arc<MessageQueue>,
    sessions: Arc<dyn SessionStorage>,
    directory: Arc<dyn AgentDirectory>,
    governor: Arc<ConcurrencyGovernor>,
    progress: Arc<ProgressMultiplexer>,
    spawn_limit: usize,
    /// Serializes limit check + insert so the per-parent ceiling holds at
    /// every observable moment.
    spawn_gate: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

/// Manager of dynamically spawned sub-agents. Cheap to clone; all clones
/// share one tracking map.
#[derive(Clone)]
pub struct SpawnedAgentManager {
    inner: Arc<SpawnInner>,
}

impl SpawnedAgentManager {
    /// Create a manager with the given per-parent spawn limit (0 selects the
    /// default).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<MessageBus>,
        queue: Arc<MessageQueue>,
        sessions: Arc<dyn SessionStorage>,
        directory: Arc<dyn AgentDirectory>,
        governor: Arc<ConcurrencyGovernor>,
        progress: Arc<ProgressMultiplexer>,
        spawn_limit: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(SpawnInner {
                contexts: DashMap::new(),
                bus,
                queue,
                sessions,
                directory,
                governor,
                progress,
                spawn_limit: if spawn_limit == 0 { DEFAULT_SPAWN_LIMIT } else { spawn_limit },
                spawn_gate: tokio::sync::Mutex::new(()),
                shutdown,
            }),
        }
    }

    /// Spawned agents tracked for one parent session.
    pub fn spawned_count(&self, parent_session_id: &str) -> usize {
        self.inner.spawned_count(parent_session_id)
    }

    /// Total spawned agents.
    pub fn total_count(&self) -> usize {
        self.inner.contexts.len()
    }

    /// Context views for one parent session.
    pub fn contexts_for_parent(&self, parent_session_id: &str) -> Vec<Arc<SpawnedAgentContext>> {
        self.inner
            .contexts
            .iter()
            .filter(|e| e.parent_session_id == parent_session_id)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Spawn a sub-agent.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<SpawnResult, WeftError> {
        let inner = &self.inner;
        if request.parent_session_id.is_empty() {
            return Err(WeftError::InvalidArgument("parent session id must not be empty".into()));
        }
        if request.base_agent_id.is_empty() {
            return Err(WeftError::InvalidArgument("base agent id must not be empty".into()));
        }

        let gate = inner.spawn_gate.lock().await;
        if inner.spawned_count(&request.parent_session_id) >= inner.spawn_limit {
            return Err(WeftError::ResourceExhausted(format!(
                "spawn limit of {} reached for session {}",
                inner.spawn_limit, request.parent_session_id
            )));
        }

        let namespace = request
            .workflow_id
            .clone()
            .filter(|w| !w.is_empty())
            .unwrap_or_else(|| format!("{}-spawn", request.parent_agent_id));
        let sub_agent_id = format!("{namespace}:{}", request.base_agent_id);

        // Fresh instance: never chat against the registry's cached object.
        let agent = inner.directory.instantiate(&request.base_agent_id).await?;

        let sub_session_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        inner
            .sessions
            .create_session(Session {
                id: sub_session_id.clone(),
                agent_id: sub_agent_id.clone(),
                parent_session_id: Some(request.parent_session_id.clone()),
                created_at: now,
                updated_at: now,
            })
            .await
            .map_err(|err| WeftError::Internal(format!("failed to persist sub-session: {err}")))?;

        // Auto-subscribe; failures are logged and the rest proceeds.
        let (notify_tx, notify_rx) = mpsc::channel(SUB_AGENT_NOTIFY_BUFFER);
        let mut subscription_ids = Vec::new();
        let mut subscribed_topics = Vec::new();
        let mut receivers = Vec::new();
        for topic in &request.auto_subscribe_topics {
            match inner.bus.subscribe(&sub_agent_id, topic, None, SPAWN_SUBSCRIBE_BUFFER) {
                Ok((info, rx)) => {
                    if let Err(err) =
                        inner.bus.register_notification_channel(&info.id, notify_tx.clone())
                    {
                        warn!(topic = %topic, error = %err, "notification channel registration failed");
                    }
                    subscription_ids.push(info.id);
                    subscribed_topics.push(topic.clone());
                    receivers.push(rx);
                }
                Err(err) => {
                    warn!(topic = %topic, agent = %sub_agent_id, error = %err, "auto-subscribe failed");
                }
            }
        }

        let auto_despawn = request
            .metadata
            .get(META_AUTO_DESPAWN_MINUTES)
            .and_then(|v| v.parse::<u64>().ok())
            .map(|minutes| Duration::from_secs(minutes * 60))
            .unwrap_or(DEFAULT_AUTO_DESPAWN);

        let ctx = Arc::new(SpawnedAgentContext {
            parent_session_id: request.parent_session_id.clone(),
            parent_agent_id: request.parent_agent_id.clone(),
            sub_agent_id: sub_agent_id.clone(),
            sub_session_id: sub_session_id.clone(),
            workflow_id: request.workflow_id.clone(),
            spawned_at: now,
            subscription_ids,
            metadata: request.metadata.clone(),
            auto_despawn,
            agent,
            receivers: Mutex::new(receivers),
            notify_tx,
            loop_cancel: inner.shutdown.child_token(),
            lifecycle_cancel: inner.shutdown.child_token(),
        });
        inner.contexts.insert(sub_session_id.clone(), ctx.clone());
        drop(gate);

        // Lifecycle monitor always runs; the message loop only when there is
        // something to listen on.
        tokio::spawn(SpawnInner::lifecycle_loop(inner.clone(), ctx.clone()));
        if !ctx.subscription_ids.is_empty() {
            tokio::spawn(SpawnInner::message_loop(inner.clone(), ctx.clone(), notify_rx));
        }

        if let Some(initial) = request.initial_message.filter(|m| !m.is_empty()) {
            let init_inner = inner.clone();
            let init_ctx = ctx.clone();
            tokio::spawn(async move {
                let permit = match init_inner.governor.acquire(&init_ctx.loop_cancel).await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                if let Err(err) = init_ctx.agent.chat(&init_ctx.sub_session_id, &initial).await {
                    warn!(agent = %init_ctx.sub_agent_id, error = %err, "initial message failed");
                }
                drop(permit);
            });
        }

        info!(
            sub_agent = %sub_agent_id,
            session = %sub_session_id,
            parent = %request.parent_session_id,
            topics = subscribed_topics.len(),
            "sub-agent spawned"
        );
        Ok(SpawnResult {
            sub_agent_id,
            session_id: sub_session_id,
            status: SPAWN_OK.to_string(),
            subscribed_topics,
        })
    }

    /// Despawn one sub-agent of a parent session. Returns [`DESPAWN_OK`] or
    /// [`DESPAWN_NOT_FOUND`].
    pub async fn despawn(
        &self,
        parent_session_id: &str,
        sub_agent_id: &str,
        reason: &str,
    ) -> String {
        self.inner.despawn(parent_session_id, sub_agent_id, reason).await
    }

    /// Despawn every sub-agent of a parent session. Returns how many were
    /// removed.
    pub async fn despawn_for_parent(&self, parent_session_id: &str, reason: &str) -> usize {
        let targets: Vec<String> = self
            .inner
            .contexts
            .iter()
            .filter(|e| e.parent_session_id == parent_session_id)
            .map(|e| e.sub_agent_id.clone())
            .collect();
        let mut removed = 0;
        for sub_agent_id in targets {
            if self.inner.despawn(parent_session_id, &sub_agent_id, reason).await == DESPAWN_OK {
                removed += 1;
            }
        }
        removed
    }

    /// Despawn everything (server shutdown).
    pub async fn shutdown_all(&self) {
        let targets: Vec<(String, String)> = self
            .inner
            .contexts
            .iter()
            .map(|e| (e.parent_session_id.clone(), e.sub_agent_id.clone()))
            .collect();
        for (parent, sub_agent) in targets {
            self.inner.despawn(&parent, &sub_agent, "server shutdown").await;
        }
    }
}

impl SpawnInner {
    fn spawned_count(&self, parent_session_id: &str) -> usize {
        self.contexts.iter().filter(|e| e.parent_session_id == parent_session_id).count()
    }

    async fn despawn(&self, parent_session_id: &str, sub_agent_id: &str, reason: &str) -> String {
        let key = self.contexts.iter().find_map(|e| {
            (e.parent_session_id == parent_session_id && e.sub_agent_id == sub_agent_id)
                .then(|| e.key().clone())
        });
        let Some(key) = key else {
            return DESPAWN_NOT_FOUND.to_string();
        };
        let Some((_, ctx)) = self.contexts.remove(&key) else {
            return DESPAWN_NOT_FOUND.to_string();
        };

        // Cleanup order: message loop, lifecycle monitor, notify channels
        // (dropped with the context), subscriptions.
        ctx.loop_cancel.cancel();
        ctx.lifecycle_cancel.cancel();
        for subscription_id in &ctx.subscription_ids {
            if let Err(err) = self.bus.unsubscribe(subscription_id) {
                warn!(subscription = %subscription_id, error = %err, "unsubscribe failed");
            }
        }
        self.queue.unregister_notification_channel_matching(&ctx.sub_agent_id, &ctx.notify_tx);
        info!(sub_agent = %sub_agent_id, parent = %parent_session_id, %reason, "sub-agent despawned");
        DESPAWN_OK.to_string()
    }

    /// Background message loop: wait for a wake-up, drain every bound
    /// subscription non-blockingly, answer each non-self message on its own
    /// topic, and surface the exchange on the parent's progress stream.
    async fn message_loop(
        inner: Arc<Self>,
        ctx: Arc<SpawnedAgentContext>,
        mut notify_rx: mpsc::Receiver<()>,
    ) {
        debug!(sub_agent = %ctx.sub_agent_id, "spawned message loop started");
        'outer: loop {
            tokio::select! {
                _ = ctx.loop_cancel.cancelled() => break,
                signal = notify_rx.recv() => {
                    if signal.is_none() {
                        break;
                    }
                    let messages: Vec<BusMessage> = {
                        let mut receivers = ctx.receivers.lock().expect("receiver lock poisoned");
                        let mut drained = Vec::new();
                        for rx in receivers.iter_mut() {
                            while let Ok(message) = rx.try_recv() {
                                drained.push(message);
                            }
                        }
                        drained
                    };
                    for message in messages {
                        // Self-originated traffic is filtered here, at the
                        // consumer, not at the bus.
                        if message.from_agent == ctx.sub_agent_id {
                            continue;
                        }
                        if !inner.process_message(&ctx, message).await {
                            break 'outer;
                        }
                    }
                }
            }
        }
        debug!(sub_agent = %ctx.sub_agent_id, "spawned message loop stopped");
    }

    /// Handle one bus message. Returns `false` when the loop should exit.
    async fn process_message(&self, ctx: &Arc<SpawnedAgentContext>, message: BusMessage) -> bool {
        let content = message.payload.render();
        let permit = match self.governor.acquire(&ctx.loop_cancel).await {
            Ok(permit) => permit,
            Err(_) => return false,
        };
        let outcome = tokio::time::timeout(
            SPAWNED_CHAT_TIMEOUT,
            ctx.agent.chat(&ctx.sub_session_id, &content),
        )
        .await;
        drop(permit);

        match outcome {
            Ok(Ok(reply)) => {
                let metadata = HashMap::from([(META_IN_REPLY_TO.to_string(), message.id.clone())]);
                if let Err(err) = self.bus.publish(
                    &message.topic,
                    &ctx.sub_agent_id,
                    MessagePayload::text(reply.text),
                    metadata,
                ) {
                    warn!(topic = %message.topic, error = %err, "reply publish failed");
                }
                self.progress.emit(
                    &ctx.parent_session_id,
                    ProgressEvent::PubSubMessage {
                        topic: message.topic.clone(),
                        from_agent: message.from_agent.clone(),
                        preview: message.payload.preview(120),
                    },
                );
            }
            Ok(Err(err)) => {
                warn!(sub_agent = %ctx.sub_agent_id, error = %err, "spawned chat failed");
            }
            Err(_) => {
                warn!(
                    sub_agent = %ctx.sub_agent_id,
                    timeout_secs = SPAWNED_CHAT_TIMEOUT.as_secs(),
                    "spawned chat timed out"
                );
            }
        }
        true
    }

    /// Lifecycle monitor: reload the sub-session every tick and despawn
    /// once `updated_at` has not moved for the inactivity window. Idle time
    /// is measured on the runtime clock between observed `updated_at`
    /// changes.
    async fn lifecycle_loop(inner: Arc<Self>, ctx: Arc<SpawnedAgentContext>) {
        let mut tick = tokio::time::interval(SPAWN_LIFECYCLE_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_seen_update: Option<DateTime<Utc>> = None;
        let mut last_change = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = ctx.lifecycle_cancel.cancelled() => break,
                _ = tick.tick() => {
                    match inner.sessions.get_session(&ctx.sub_session_id).await {
                        Ok(Some(session)) => {
                            if last_seen_update != Some(session.updated_at) {
                                last_seen_update = Some(session.updated_at);
                                last_change = tokio::time::Instant::now();
                            } else if last_change.elapsed() >= ctx.auto_despawn {
                                inner.despawn(
                                    &ctx.parent_session_id,
                                    &ctx.sub_agent_id,
                                    "auto-despawn: inactivity timeout",
                                )
                                .await;
                                break;
                            }
                        }
                        Ok(None) => {
                            inner.despawn(
                                &ctx.parent_session_id,
                                &ctx.sub_agent_id,
                                "auto-despawn: session removed",
                            )
                            .await;
                            break;
                        }
                        Err(err) => {
                            warn!(session = %ctx.sub_session_id, error = %err, "session reload failed");
                        }
                    }
                }
            }
        }
    }
}
