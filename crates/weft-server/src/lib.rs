#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **weft-server** – Server facade of the Weft control plane.
//!
//! [`WeftServer`] owns every runtime subsystem: the agent registry, the
//! three communication planes, the coordinator runtime and queue monitor,
//! the spawned-agent manager, progress fan-out, pending clarification
//! questions, and the workflow executor/scheduler bridges. RPC handlers are
//! plain async methods returning [`WeftError`]; the wire layer maps each
//! error to its status code via [`WeftError::code`].
//!
//! ## Locking
//!
//! The registry's rw-lock is the primary lock; the workflow map, the
//! spawned-agent map, and the pending-questions map each have their own
//! short-critical-section lock. No task ever holds two of these at once,
//! and no lock is held across a blocking call (chat, publish, dequeue,
//! channel send). Configuration knobs are immutable after construction
//! except those with explicit setters, each of which swaps a single scalar.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use weft_comms::{MessageBus, MessageQueue, SharedMemoryStore};
use weft_orchestration::{
    CoordinatorRuntime, QueueMonitor, SchedulerFacade, SpawnedAgentManager, WorkflowExecutor,
};
use weft_runtime::{
    ConcurrencyGovernor, ExecutionStore, MemoryPatternLibrary, PatternEventBroadcaster,
    ProgressMultiplexer,
};
use weft_store_memory::MemorySessionStore;
use weft_types::{
    CronEngine, ModelRegistry, Orchestrator, ProgressEvent, ProviderFactory, SessionStorage,
    WeftError,
};

pub mod clarify;
pub mod comms_api;
pub mod registry;
pub mod sessions;
pub mod streams;
pub mod weave;
pub mod workflows;

pub use clarify::{AnswerResult, PendingQuestion, PendingQuestions};
pub use registry::{AgentInjector, AgentRegistry, AgentSummary};

/// Tool name registered on agents the first time a session chats.
pub const EPHEMERAL_AGENTS_TOOL: &str = "manage_ephemeral_agents";

/// Communication tools injected into every registered agent.
pub const COMMUNICATION_TOOLS: &[&str] =
    &["send_message", "receive_message", "publish_message", "shared_memory"];

/// Tunables of the server. Immutable after construction except where an
/// explicit setter exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Concurrent LLM call ceiling (floor 1).
    pub llm_concurrency_limit: usize,
    /// Spawned agents allowed per parent session.
    pub spawn_limit_per_parent: usize,
    /// Wait for a slow clarification answer consumer, in milliseconds.
    pub clarification_send_timeout_ms: u64,
    /// Session subscription poll interval, in milliseconds.
    pub session_stream_tick_ms: u64,
    /// Terminal workflow execution records retained.
    pub execution_retention: usize,
    /// Whether the communication planes are constructed. Disabled planes
    /// answer `Unavailable` on their RPCs.
    pub enable_communication: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            llm_concurrency_limit: weft_runtime::DEFAULT_LLM_CONCURRENCY,
            spawn_limit_per_parent: weft_orchestration::DEFAULT_SPAWN_LIMIT,
            clarification_send_timeout_ms: clarify::DEFAULT_ANSWER_SEND_TIMEOUT_MS,
            session_stream_tick_ms: 500,
            execution_retention: weft_runtime::DEFAULT_EXECUTION_RETENTION,
            enable_communication: true,
        }
    }
}

/// The control-plane server.
pub struct WeftServer {
    pub(crate) config: ServerConfig,
    pub(crate) registry: Arc<AgentRegistry>,
    pub(crate) sessions: Arc<dyn SessionStorage>,
    pub(crate) bus: Option<Arc<MessageBus>>,
    pub(crate) queue: Option<Arc<MessageQueue>>,
    pub(crate) memory: Option<Arc<SharedMemoryStore>>,
    pub(crate) governor: Arc<ConcurrencyGovernor>,
    pub(crate) progress: Arc<ProgressMultiplexer>,
    pub(crate) pattern_events: Arc<PatternEventBroadcaster>,
    pub(crate) patterns: Arc<MemoryPatternLibrary>,
    pub(crate) coordinator: Option<CoordinatorRuntime>,
    pub(crate) spawner: Option<SpawnedAgentManager>,
    pub(crate) executor: Option<Arc<WorkflowExecutor>>,
    pub(crate) scheduler: Option<SchedulerFacade>,
    pub(crate) executions: Arc<ExecutionStore>,
    pub(crate) questions: Arc<PendingQuestions>,
    pub(crate) models: Option<Arc<dyn ModelRegistry>>,
    pub(crate) factory: Option<Arc<dyn ProviderFactory>>,
    pub(crate) monitor: Mutex<Option<QueueMonitor>>,
    pub(crate) tool_sessions: Mutex<HashSet<String>>,
    pub(crate) shutdown: CancellationToken,
    started_at: Instant,
}

/// Builder wiring the server's collaborators.
pub struct WeftServerBuilder {
    config: ServerConfig,
    sessions: Arc<dyn SessionStorage>,
    orchestrator: Option<Arc<dyn Orchestrator>>,
    cron_engine: Option<Arc<dyn CronEngine>>,
    models: Option<Arc<dyn ModelRegistry>>,
    factory: Option<Arc<dyn ProviderFactory>>,
}

impl Default for WeftServerBuilder {
    fn default() -> Self {
        Self {
            config: ServerConfig::default(),
            sessions: Arc::new(MemorySessionStore::new()),
            orchestrator: None,
            cron_engine: None,
            models: None,
            factory: None,
        }
    }
}

impl WeftServerBuilder {
    /// Start a builder with default configuration and in-memory session
    /// storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a different session storage driver.
    pub fn session_storage(mut self, sessions: Arc<dyn SessionStorage>) -> Self {
        self.sessions = sessions;
        self
    }

    /// Attach the external workflow orchestrator.
    pub fn orchestrator(mut self, orchestrator: Arc<dyn Orchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Attach the external cron engine.
    pub fn cron_engine(mut self, engine: Arc<dyn CronEngine>) -> Self {
        self.cron_engine = Some(engine);
        self
    }

    /// Attach the model catalogue.
    pub fn model_registry(mut self, models: Arc<dyn ModelRegistry>) -> Self {
        self.models = Some(models);
        self
    }

    /// Attach the provider factory for dynamic model switches.
    pub fn provider_factory(mut self, factory: Arc<dyn ProviderFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Wire everything and start the background workers.
    pub fn build(self) -> Arc<WeftServer> {
        let shutdown = CancellationToken::new();
        let governor = Arc::new(ConcurrencyGovernor::new(self.config.llm_concurrency_limit));
        let progress = Arc::new(ProgressMultiplexer::new());
        let registry = Arc::new(AgentRegistry::new());
        let questions =
            Arc::new(PendingQuestions::new(self.config.clarification_send_timeout_ms));
        let executions = Arc::new(ExecutionStore::new(self.config.execution_retention));
        let patterns = Arc::new(MemoryPatternLibrary::new());

        // Every registered agent gets the communication tool set.
        registry.add_injector(Arc::new(|agent| {
            for tool in COMMUNICATION_TOOLS {
                agent.register_tool(tool);
            }
        }));

        // Question lifecycle is mirrored off the progress stream.
        {
            let questions = questions.clone();
            progress.add_listener(move |_session, event| match event {
                ProgressEvent::QuestionAsked { id, prompt } => {
                    questions.register(PendingQuestion {
                        id: id.clone(),
                        prompt: prompt.clone(),
                        answer_tx: None,
                        created_at: chrono::Utc::now(),
                    });
                }
                ProgressEvent::QuestionAnswered { question_id } if !question_id.is_empty() => {
                    questions.remove(question_id);
                }
                _ => {}
            });
        }

        let (bus, queue, memory, coordinator, spawner) = if self.config.enable_communication {
            let bus = Arc::new(MessageBus::new());
            let queue = Arc::new(MessageQueue::new());
            let memory = Arc::new(SharedMemoryStore::new());
            let coordinator = CoordinatorRuntime::new(
                queue.clone(),
                governor.clone(),
                registry.clone(),
                self.sessions.clone(),
                shutdown.clone(),
            );
            let spawner = SpawnedAgentManager::new(
                bus.clone(),
                queue.clone(),
                self.sessions.clone(),
                registry.clone(),
                governor.clone(),
                progress.clone(),
                self.config.spawn_limit_per_parent,
                shutdown.clone(),
            );
            (Some(bus), Some(queue), Some(memory), Some(coordinator), Some(spawner))
        } else {
            (None, None, None, None, None)
        };

        let executor = self.orchestrator.map(|orchestrator| {
            Arc::new(WorkflowExecutor::new(orchestrator, registry.clone(), executions.clone()))
        });
        let pattern_library: Arc<dyn weft_types::PatternLibrary> = patterns.clone();
        let scheduler = match (&executor, self.cron_engine) {
            (Some(executor), Some(engine)) => {
                Some(SchedulerFacade::new(engine, pattern_library, executor.clone()))
            }
            _ => None,
        };

        let monitor = match (&queue, &coordinator) {
            (Some(queue), Some(coordinator)) => {
                Some(QueueMonitor::start(queue.clone(), coordinator.clone(), &shutdown))
            }
            _ => None,
        };

        info!(
            communication = self.config.enable_communication,
            orchestrator = executor.is_some(),
            scheduler = scheduler.is_some(),
            "weft server started"
        );
        Arc::new(WeftServer {
            config: self.config,
            registry,
            sessions: self.sessions,
            bus,
            queue,
            memory,
            governor,
            progress,
            pattern_events: Arc::new(PatternEventBroadcaster::new()),
            patterns,
            coordinator,
            spawner,
            executor,
            scheduler,
            executions,
            questions,
            models: self.models,
            factory: self.factory,
            monitor: Mutex::new(monitor),
            tool_sessions: Mutex::new(HashSet::new()),
            shutdown,
            started_at: Instant::now(),
        })
    }
}

/// Health snapshot returned by `GetHealth`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Registered agents.
    pub agent_count: usize,
    /// Current default agent, if any.
    pub default_agent: Option<String>,
    /// Tracked coordinator/sub-agent loops.
    pub tracked_loops: usize,
    /// Live spawned agents.
    pub spawned_agents: usize,
    /// Pending clarification questions.
    pub pending_questions: usize,
    /// Retained workflow executions.
    pub executions: usize,
    /// Whether the communication planes are configured.
    pub communication: bool,
    /// Whether a workflow orchestrator is configured.
    pub orchestrator: bool,
    /// Whether the scheduler bridge is configured.
    pub scheduler: bool,
    /// Seconds since the server started.
    pub uptime_secs: u64,
}

impl WeftServer {
    /// The agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// The per-session progress multiplexer.
    pub fn progress(&self) -> &Arc<ProgressMultiplexer> {
        &self.progress
    }

    /// The pending-questions map.
    pub fn questions(&self) -> &Arc<PendingQuestions> {
        &self.questions
    }

    /// The pattern library.
    pub fn patterns(&self) -> &Arc<MemoryPatternLibrary> {
        &self.patterns
    }

    /// The LLM concurrency governor.
    pub fn governor(&self) -> &Arc<ConcurrencyGovernor> {
        &self.governor
    }

    /// Adjust the LLM concurrency ceiling at runtime.
    pub async fn set_llm_concurrency_limit(&self, limit: usize) {
        self.governor.set_limit(limit).await;
    }

    /// `GetHealth`.
    pub fn health(&self) -> HealthReport {
        HealthReport {
            agent_count: self.registry.len(),
            default_agent: self.registry.default_id(),
            tracked_loops: self.coordinator.as_ref().map_or(0, |c| c.tracked_count()),
            spawned_agents: self.spawner.as_ref().map_or(0, |s| s.total_count()),
            pending_questions: self.questions.count(),
            executions: self.executions.len(),
            communication: self.bus.is_some(),
            orchestrator: self.executor.is_some(),
            scheduler: self.scheduler.is_some(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Graceful shutdown: cancel the root token, stop the monitor (which
    /// tears the coordinator runtime down), despawn every spawned agent,
    /// close the pending questions and every communication plane.
    pub async fn stop(&self) {
        info!("weft server shutting down");
        self.shutdown.cancel();
        let monitor = self.monitor.lock().expect("monitor lock poisoned").take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        if let Some(coordinator) = &self.coordinator {
            coordinator.shutdown_all();
        }
        if let Some(spawner) = &self.spawner {
            spawner.shutdown_all().await;
        }
        self.questions.close_all();
        self.pattern_events.close();
        if let Some(bus) = &self.bus {
            bus.close();
        }
        if let Some(queue) = &self.queue {
            queue.close();
        }
        if let Some(memory) = &self.memory {
            memory.close();
        }
    }

    pub(crate) fn bus(&self) -> Result<&Arc<MessageBus>, WeftError> {
        self.bus
            .as_ref()
            .ok_or_else(|| WeftError::Unavailable("message bus not configured".into()))
    }

    pub(crate) fn queue(&self) -> Result<&Arc<MessageQueue>, WeftError> {
        self.queue
            .as_ref()
            .ok_or_else(|| WeftError::Unavailable("message queue not configured".into()))
    }

    pub(crate) fn memory(&self) -> Result<&Arc<SharedMemoryStore>, WeftError> {
        self.memory
            .as_ref()
            .ok_or_else(|| WeftError::Unavailable("shared memory not configured".into()))
    }

    pub(crate) fn executor(&self) -> Result<&Arc<WorkflowExecutor>, WeftError> {
        self.executor
            .as_ref()
            .ok_or_else(|| WeftError::FailedPrecondition("workflow orchestrator not configured".into()))
    }

    pub(crate) fn scheduler(&self) -> Result<&SchedulerFacade, WeftError> {
        self.scheduler
            .as_ref()
            .ok_or_else(|| WeftError::FailedPrecondition("scheduler not configured".into()))
    }
}
