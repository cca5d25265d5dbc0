//! Coordinator injection loops and sub-agent reply loops.
//!
//! The runtime tracks one [`SubAgentContext`] per composite key:
//! `<session-id>:<agent-id>` for coordinator-registered loops and
//! `auto:<agent-id>` for monitor-spawned ones. Registering a new context
//! under an existing key cancels the previous one first, so at most one live
//! loop exists per key. Notify channels are never shared across
//! replacements.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use weft_comms::MessageQueue;
use weft_runtime::ConcurrencyGovernor;
use weft_types::{Agent, AgentDirectory, Session, SessionStorage, WeftError};

use crate::{
    backoff_delay, COORDINATOR_NOTIFY_BUFFER, PENDING_MESSAGES_PROMPT, SUB_AGENT_NOTIFY_BUFFER,
};

/// Tracking record for one coordinator or sub-agent loop.
pub struct SubAgentContext {
    /// Agent the loop chats against.
    pub agent: Arc<dyn Agent>,
    /// Full agent id (queue address).
    pub agent_id: String,
    /// Session the loop's chats run in.
    pub session_id: String,
    /// Workflow the loop belongs to.
    pub workflow_id: String,
    /// Wake-up sender; all sends are non-blocking.
    notify_tx: mpsc::Sender<()>,
    /// Cancels this loop and only this loop.
    cancel: CancellationToken,
    /// Last time the loop woke up.
    last_checked: Mutex<DateTime<Utc>>,
    /// Consecutive chat failures, reset on first success.
    consecutive_failures: AtomicU32,
}

impl SubAgentContext {
    /// Non-blocking wake-up. A full channel means a signal is already
    /// pending, which is as good as delivered.
    pub fn signal(&self) {
        let _ = self.notify_tx.try_send(());
    }

    /// Last wake-up time.
    pub fn last_checked(&self) -> DateTime<Utc> {
        *self.last_checked.lock().expect("context lock poisoned")
    }

    /// Current consecutive-failure count.
    pub fn failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        *self.last_checked.lock().expect("context lock poisoned") = Utc::now();
    }
}

struct CoordInner {
    contexts: DashMap<String, Arc<SubAgentContext>>,
    queue: Arc<MessageQueue>,
    governor: Arc<ConcurrencyGovernor>,
    directory: Arc<dyn AgentDirectory>,
    sessions: Arc<dyn SessionStorage>,
    shutdown: CancellationToken,
}

/// Runtime for workflow coordinators and their sub-agents. Cheap to clone;
/// all clones share one tracking map.
#[derive(Clone)]
pub struct CoordinatorRuntime {
    inner: Arc<CoordInner>,
}

impl CoordinatorRuntime {
    /// Create a runtime. `shutdown` is the root token every loop descends
    /// from.
    pub fn new(
        queue: Arc<MessageQueue>,
        governor: Arc<ConcurrencyGovernor>,
        directory: Arc<dyn AgentDirectory>,
        sessions: Arc<dyn SessionStorage>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(CoordInner {
                contexts: DashMap::new(),
                queue,
                governor,
                directory,
                sessions,
                shutdown,
            }),
        }
    }

    /// Number of tracked loops.
    pub fn tracked_count(&self) -> usize {
        self.inner.contexts.len()
    }

    /// Whether a context exists under `key`.
    pub fn has_context(&self, key: &str) -> bool {
        self.inner.contexts.contains_key(key)
    }

    /// Register a coordinator for `session_id` and start loops for it and
    /// every sub-agent of its workflow.
    ///
    /// Sub-agents are the registered ids of the form `<workflow>:<suffix>`,
    /// excluding the coordinator itself. A workflow without sub-agents is a
    /// soft failure: the coordinator loop still starts.
    pub async fn register_coordinator(
        &self,
        session_id: &str,
        coordinator: Arc<dyn Agent>,
        workflow_id: &str,
    ) -> Result<(), WeftError> {
        let inner = &self.inner;
        let coordinator_id = coordinator.id().to_string();
        let prefix = format!("{workflow_id}:");
        let sub_ids: Vec<String> = inner
            .directory
            .agent_ids()
            .await
            .into_iter()
            .filter(|id| id.starts_with(&prefix) && *id != coordinator_id)
            .collect();
        if sub_ids.is_empty() {
            warn!(workflow = %workflow_id, "workflow has no sub-agents, coordinator runs alone");
        }

        // Coordinator injection loop.
        let key = format!("{session_id}:{coordinator_id}");
        let (ctx, notify_rx) = inner.make_context(
            coordinator,
            &coordinator_id,
            session_id,
            workflow_id,
            COORDINATOR_NOTIFY_BUFFER,
        );
        inner.queue.register_notification_channel(&coordinator_id, ctx.notify_tx.clone());
        inner.insert_replacing(key.clone(), ctx.clone());
        tokio::spawn(CoordInner::injection_loop(inner.clone(), key, ctx, notify_rx));

        // Sub-agent reply loops.
        for sub_id in sub_ids {
            let key = format!("{session_id}:{sub_id}");
            if let Err(err) =
                CoordInner::spawn_reply_loop(inner, key, &sub_id, workflow_id, Some(session_id))
                    .await
            {
                warn!(sub_agent = %sub_id, error = %err, "failed to start sub-agent loop");
            }
        }
        Ok(())
    }

    /// Wake every tracked loop whose key ends in `:agent_id`. Returns whether
    /// any loop matched.
    pub fn signal_agent(&self, agent_id: &str) -> bool {
        let suffix = format!(":{agent_id}");
        let mut matched = false;
        for entry in self.inner.contexts.iter() {
            if entry.key().ends_with(&suffix) {
                entry.value().signal();
                matched = true;
            }
        }
        matched
    }

    /// Start a reply loop for a namespaced agent whose messages arrived
    /// before any coordinator connected. Tracked under `auto:<agent_id>`.
    pub async fn auto_spawn(&self, agent_id: &str) -> Result<(), WeftError> {
        let workflow_id = agent_id
            .split_once(':')
            .map(|(workflow, _)| workflow.to_string())
            .ok_or_else(|| {
                WeftError::InvalidArgument(format!("{agent_id:?} is not a namespaced agent id"))
            })?;
        let key = format!("auto:{agent_id}");
        info!(agent = %agent_id, "auto-spawning reply loop for pending messages");
        CoordInner::spawn_reply_loop(&self.inner, key, agent_id, &workflow_id, None).await
    }

    /// Cancel every tracked loop, unregister its notification channel, and
    /// clear the map.
    pub fn shutdown_all(&self) {
        let keys: Vec<String> = self.inner.contexts.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, ctx)) = self.inner.contexts.remove(&key) {
                ctx.cancel.cancel();
                self.inner
                    .queue
                    .unregister_notification_channel_matching(&ctx.agent_id, &ctx.notify_tx);
            }
        }
    }
}

impl CoordInner {
    async fn spawn_reply_loop(
        inner: &Arc<Self>,
        key: String,
        agent_id: &str,
        workflow_id: &str,
        parent_session_id: Option<&str>,
    ) -> Result<(), WeftError> {
        // Always a fresh instance: loops chat concurrently and must not share
        // per-conversation state.
        let agent = inner.directory.instantiate(agent_id).await?;

        let sub_session_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let session = Session {
            id: sub_session_id.clone(),
            agent_id: agent_id.to_string(),
            parent_session_id: parent_session_id.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        if let Err(err) = inner.sessions.create_session(session).await {
            warn!(agent = %agent_id, error = %err, "failed to persist sub-session");
        }

        let (ctx, notify_rx) = inner.make_context(
            agent,
            agent_id,
            &sub_session_id,
            workflow_id,
            SUB_AGENT_NOTIFY_BUFFER,
        );
        inner.queue.register_notification_channel(agent_id, ctx.notify_tx.clone());
        inner.insert_replacing(key.clone(), ctx.clone());
        tokio::spawn(CoordInner::reply_loop(inner.clone(), key, ctx, notify_rx));
        Ok(())
    }

    fn make_context(
        &self,
        agent: Arc<dyn Agent>,
        agent_id: &str,
        session_id: &str,
        workflow_id: &str,
        buffer: usize,
    ) -> (Arc<SubAgentContext>, mpsc::Receiver<()>) {
        let (notify_tx, notify_rx) = mpsc::channel(buffer);
        let ctx = Arc::new(SubAgentContext {
            agent,
            agent_id: agent_id.to_string(),
            session_id: session_id.to_string(),
            workflow_id: workflow_id.to_string(),
            notify_tx,
            cancel: self.shutdown.child_token(),
            last_checked: Mutex::new(Utc::now()),
            consecutive_failures: AtomicU32::new(0),
        });
        (ctx, notify_rx)
    }

    /// Insert a context, cancelling any previous holder of the key.
    fn insert_replacing(&self, key: String, ctx: Arc<SubAgentContext>) {
        if let Some(previous) = self.contexts.insert(key, ctx) {
            previous.cancel.cancel();
        }
    }

    /// Remove `key` only while it still maps to `ctx`, and drop the queue
    /// registration only if it is still ours.
    fn remove_own(&self, key: &str, ctx: &Arc<SubAgentContext>) {
        self.contexts.remove_if(key, |_, current| Arc::ptr_eq(current, ctx));
        self.queue.unregister_notification_channel_matching(&ctx.agent_id, &ctx.notify_tx);
    }

    /// Coordinator injection loop: one dequeue per wake-up signal, formatted
    /// into the coordinator's session. The message is acknowledged regardless
    /// of the chat outcome; chat errors are logged, never propagated.
    async fn injection_loop(
        inner: Arc<Self>,
        key: String,
        ctx: Arc<SubAgentContext>,
        mut notify_rx: mpsc::Receiver<()>,
    ) {
        debug!(key = %key, "coordinator injection loop started");
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                signal = notify_rx.recv() => {
                    if signal.is_none() {
                        break;
                    }
                    ctx.touch();
                    let Some(message) = inner.queue.dequeue(&ctx.agent_id) else {
                        // Duplicate signal for an already-drained queue.
                        continue;
                    };
                    let prompt = format!(
                        "[MESSAGE FROM {}]:\n\n{}",
                        message.from_agent,
                        message.payload.render()
                    );
                    match inner.governor.acquire(&ctx.cancel).await {
                        Ok(permit) => {
                            if let Err(err) = ctx.agent.chat(&ctx.session_id, &prompt).await {
                                warn!(key = %key, error = %err, "coordinator chat failed");
                            }
                            drop(permit);
                        }
                        Err(_) => {
                            // Cancelled while waiting; fall through to ack.
                        }
                    }
                    if let Err(err) = inner.queue.acknowledge(&message.id) {
                        warn!(message = %message.id, error = %err, "acknowledge failed");
                    }
                }
            }
        }
        inner.remove_own(&key, &ctx);
        debug!(key = %key, "coordinator injection loop stopped");
    }

    /// Sub-agent reply loop: event-driven, no initial prompt, capped
    /// exponential backoff on consecutive failures.
    async fn reply_loop(
        inner: Arc<Self>,
        key: String,
        ctx: Arc<SubAgentContext>,
        mut notify_rx: mpsc::Receiver<()>,
    ) {
        debug!(key = %key, "sub-agent reply loop started");
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                signal = notify_rx.recv() => {
                    if signal.is_none() {
                        break;
                    }
                    ctx.touch();
                    let permit = match inner.governor.acquire(&ctx.cancel).await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let outcome = ctx.agent.chat(&ctx.session_id, PENDING_MESSAGES_PROMPT).await;
                    drop(permit);
                    match outcome {
                        Ok(_) => {
                            ctx.consecutive_failures.store(0, Ordering::SeqCst);
                        }
                        Err(err) => {
                            let failures =
                                ctx.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                            let delay = backoff_delay(failures);
                            warn!(
                                key = %key,
                                failures,
                                delay_secs = delay.as_secs(),
                                error = %err,
                                "sub-agent chat failed, backing off"
                            );
                            tokio::select! {
                                _ = ctx.cancel.cancelled() => break,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
            }
        }
        inner.remove_own(&key, &ctx);
        debug!(key = %key, "sub-agent reply loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockAgentBuilder, MockDirectory};
    use std::time::Duration;
    use weft_store_memory::MemorySessionStore;
    use weft_types::MessagePayload;

    fn runtime_with(directory: Arc<MockDirectory>, queue: Arc<MessageQueue>) -> CoordinatorRuntime {
        CoordinatorRuntime::new(
            queue,
            Arc::new(ConcurrencyGovernor::new(5)),
            directory,
            Arc::new(MemorySessionStore::new()),
            CancellationToken::new(),
        )
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_injection_formats_and_acknowledges() {
        let directory = Arc::new(MockDirectory::new());
        let coordinator = MockAgentBuilder::new("demo").coordinator("demo").build();
        directory.add(coordinator.clone());
        directory.add(MockAgentBuilder::new("demo:worker").build());

        let queue = Arc::new(MessageQueue::new());
        let runtime = runtime_with(directory, queue.clone());
        runtime.register_coordinator("s1", coordinator.clone(), "demo").await.unwrap();

        queue
            .send("demo:worker", "demo", "status", MessagePayload::text("ack"), Default::default())
            .unwrap();

        let chats = coordinator.chats();
        wait_until(|| !chats.lock().unwrap().is_empty()).await;
        let recorded = chats.lock().unwrap();
        assert_eq!(recorded[0].0, "s1");
        assert!(recorded[0].1.starts_with("[MESSAGE FROM demo:worker]:\n\nack"));
        drop(recorded);

        // Acknowledged regardless of outcome: the queue is drained.
        wait_until(|| queue.agents_with_pending_messages().is_empty()).await;
        assert!(queue.dequeue("demo").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reference_payload_is_rendered() {
        let directory = Arc::new(MockDirectory::new());
        let coordinator = MockAgentBuilder::new("demo").coordinator("demo").build();
        directory.add(coordinator.clone());

        let queue = Arc::new(MessageQueue::new());
        let runtime = runtime_with(directory, queue.clone());
        runtime.register_coordinator("s1", coordinator.clone(), "demo").await.unwrap();

        queue
            .send(
                "demo:worker",
                "demo",
                "artifact",
                MessagePayload::Reference { id: "ref-9".into() },
                Default::default(),
            )
            .unwrap();

        let chats = coordinator.chats();
        wait_until(|| !chats.lock().unwrap().is_empty()).await;
        assert!(chats.lock().unwrap()[0].1.contains("[Reference: ref-9]"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacement_cancels_previous_loop() {
        let directory = Arc::new(MockDirectory::new());
        let coordinator = MockAgentBuilder::new("demo").coordinator("demo").build();
        directory.add(coordinator.clone());
        directory.add(MockAgentBuilder::new("demo:worker").build());

        let queue = Arc::new(MessageQueue::new());
        let runtime = runtime_with(directory, queue.clone());
        runtime.register_coordinator("s1", coordinator.clone(), "demo").await.unwrap();
        let count_after_first = runtime.tracked_count();

        // Re-registering the same session/agent replaces both loops.
        runtime.register_coordinator("s1", coordinator.clone(), "demo").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runtime.tracked_count(), count_after_first);
        assert!(runtime.has_context("s1:demo"));
        assert!(runtime.has_context("s1:demo:worker"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_loop_backs_off_and_recovers() {
        let directory = Arc::new(MockDirectory::new());
        let worker = MockAgentBuilder::new("demo:worker").fail_times(2).build();
        directory.add(worker.clone());

        let queue = Arc::new(MessageQueue::new());
        let runtime = runtime_with(directory, queue.clone());
        runtime.auto_spawn("demo:worker").await.unwrap();
        assert!(runtime.has_context("auto:demo:worker"));

        // Three signals: two failing chats (1s + 2s backoff), then success.
        for _ in 0..3 {
            runtime.signal_agent("demo:worker");
            tokio::time::sleep(Duration::from_secs(5)).await;
        }

        let chats = worker.chats();
        wait_until(|| chats.lock().unwrap().len() >= 3).await;
        assert!(chats
            .lock()
            .unwrap()
            .iter()
            .all(|(_, prompt)| prompt == PENDING_MESSAGES_PROMPT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_clears_contexts() {
        let directory = Arc::new(MockDirectory::new());
        directory.add(MockAgentBuilder::new("wf:alpha").build());

        let queue = Arc::new(MessageQueue::new());
        let runtime = runtime_with(directory, queue.clone());
        runtime.auto_spawn("wf:alpha").await.unwrap();
        assert_eq!(runtime.tracked_count(), 1);

        runtime.shutdown_all();
        assert_eq!(runtime.tracked_count(), 0);
        assert!(!runtime.signal_agent("wf:alpha"));
    }
}
