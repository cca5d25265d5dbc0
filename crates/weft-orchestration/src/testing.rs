//! Mock agents and directory for exercising the orchestration loops.
//!
//! Available to integration tests of downstream crates via the `testing`
//! feature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use weft_types::{
    Agent, AgentDirectory, ChatOutcome, ProviderHandle, TokenUsage, WeftError, META_ROLE,
    META_WORKFLOW, ROLE_COORDINATOR,
};

/// Recorded `(session_id, message)` pairs, shared across fresh instances of
/// the same mock.
pub type ChatLog = Arc<Mutex<Vec<(String, String)>>>;

/// Scripted agent whose chats are recorded and can be made to fail.
pub struct MockAgent {
    id: String,
    metadata: HashMap<String, String>,
    reply: String,
    delay: Option<Duration>,
    chats: ChatLog,
    fail_remaining: Arc<AtomicU32>,
    tools: Mutex<Vec<String>>,
    live: Arc<AtomicU32>,
    peak: Arc<AtomicU32>,
}

/// Builder for [`MockAgent`].
pub struct MockAgentBuilder {
    id: String,
    metadata: HashMap<String, String>,
    reply: String,
    delay: Option<Duration>,
    fail_times: u32,
}

impl MockAgentBuilder {
    /// Start building a mock with the given id.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            metadata: HashMap::new(),
            reply: "ok".to_string(),
            delay: None,
            fail_times: 0,
        }
    }

    /// Tag the agent as the coordinator of `workflow`.
    pub fn coordinator(mut self, workflow: &str) -> Self {
        self.metadata.insert(META_ROLE.to_string(), ROLE_COORDINATOR.to_string());
        self.metadata.insert(META_WORKFLOW.to_string(), workflow.to_string());
        self
    }

    /// Attach arbitrary metadata.
    pub fn metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Text every successful chat returns.
    pub fn reply(mut self, text: &str) -> Self {
        self.reply = text.to_string();
        self
    }

    /// Sleep this long inside every chat (for concurrency probes).
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the first `n` chats with an error, then succeed.
    pub fn fail_times(mut self, n: u32) -> Self {
        self.fail_times = n;
        self
    }

    /// Build the shared mock instance.
    pub fn build(self) -> Arc<MockAgent> {
        Arc::new(MockAgent {
            id: self.id,
            metadata: self.metadata,
            reply: self.reply,
            delay: self.delay,
            chats: Arc::new(Mutex::new(Vec::new())),
            fail_remaining: Arc::new(AtomicU32::new(self.fail_times)),
            tools: Mutex::new(Vec::new()),
            live: Arc::new(AtomicU32::new(0)),
            peak: Arc::new(AtomicU32::new(0)),
        })
    }
}

impl MockAgent {
    /// The shared chat log (also shared by fresh instances).
    pub fn chats(&self) -> ChatLog {
        self.chats.clone()
    }

    /// Number of recorded chats.
    pub fn chat_count(&self) -> usize {
        self.chats.lock().expect("chat log poisoned").len()
    }

    /// Highest number of simultaneously in-flight chats observed, across
    /// this instance and every fresh instance derived from it.
    pub fn peak_concurrency(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for MockAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn metadata(&self) -> HashMap<String, String> {
        self.metadata.clone()
    }

    fn tools(&self) -> Vec<String> {
        self.tools.lock().expect("tools poisoned").clone()
    }

    fn register_tool(&self, name: &str) -> bool {
        let mut tools = self.tools.lock().expect("tools poisoned");
        if tools.iter().any(|t| t == name) {
            false
        } else {
            tools.push(name.to_string());
            true
        }
    }

    fn fresh_instance(&self) -> Arc<dyn Agent> {
        Arc::new(MockAgent {
            id: self.id.clone(),
            metadata: self.metadata.clone(),
            reply: self.reply.clone(),
            delay: self.delay,
            chats: self.chats.clone(),
            fail_remaining: self.fail_remaining.clone(),
            tools: Mutex::new(Vec::new()),
            live: self.live.clone(),
            peak: self.peak.clone(),
        })
    }

    fn switch_provider(&self, _handle: ProviderHandle) -> Result<(), WeftError> {
        Ok(())
    }

    async fn chat(&self, session_id: &str, message: &str) -> Result<ChatOutcome> {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let should_fail = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        self.chats
            .lock()
            .expect("chat log poisoned")
            .push((session_id.to_string(), message.to_string()));
        self.live.fetch_sub(1, Ordering::SeqCst);
        if should_fail {
            anyhow::bail!("scripted chat failure for {}", self.id);
        }
        Ok(ChatOutcome {
            text: self.reply.clone(),
            cost_usd: 0.001,
            usage: TokenUsage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 },
        })
    }
}

/// In-memory [`AgentDirectory`] of mock agents.
#[derive(Default)]
pub struct MockDirectory {
    agents: RwLock<HashMap<String, Arc<MockAgent>>>,
}

impl MockDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mock.
    pub fn add(&self, agent: Arc<MockAgent>) {
        self.agents.write().expect("directory poisoned").insert(agent.id().to_string(), agent);
    }

    /// Remove a mock.
    pub fn remove(&self, agent_id: &str) {
        self.agents.write().expect("directory poisoned").remove(agent_id);
    }
}

#[async_trait]
impl AgentDirectory for MockDirectory {
    async fn lookup(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents
            .read()
            .expect("directory poisoned")
            .get(agent_id)
            .map(|a| a.clone() as Arc<dyn Agent>)
    }

    async fn agent_ids(&self) -> Vec<String> {
        self.agents.read().expect("directory poisoned").keys().cloned().collect()
    }

    async fn instantiate(&self, agent_id: &str) -> Result<Arc<dyn Agent>, WeftError> {
        let agents = self.agents.read().expect("directory poisoned");
        let agent = agents
            .get(agent_id)
            .ok_or_else(|| WeftError::NotFound(format!("agent {agent_id:?}")))?;
        Ok(agent.fresh_instance())
    }
}
