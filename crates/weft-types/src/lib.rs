#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **weft-types** – Shared primitive data structures for Weft.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the data model of the control plane (messages, shared values,
//! executions, schedules), the uniform error-code table, and the traits that
//! describe external collaborators (LLM-backed agents, session storage, the
//! pattern orchestrator, the cron engine).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod error;
pub mod traits;

pub use error::{ErrorCode, WeftError};
pub use traits::{
    Agent, AgentDirectory, AgentMetadataExt, CronEngine, ModelRegistry, Orchestrator,
    PatternLibrary, ProgressCallback, ProviderFactory, ProviderHandle, SessionStorage,
    META_AUTO_DESPAWN_MINUTES, META_ROLE, META_WORKFLOW, ROLE_COORDINATOR,
};

//─────────────────────────────
//  Identifier validation
//─────────────────────────────

/// Maximum length of an agent identifier.
pub const MAX_AGENT_ID_LEN: usize = 63;

/// Base agent names that collide with gateway route segments and are
/// therefore rejected by the dynamic create APIs.
pub const RESERVED_AGENT_IDS: &[&str] = &[
    "agents", "sessions", "workflows", "schedules", "memory", "messages", "patterns", "health",
    "tools", "models",
];

/// Validate a *base* agent identifier: lowercase `[a-z0-9][a-z0-9-]{0,62}`,
/// not in the reserved-name set.
///
/// Namespaced sub-agent ids of the form `workflow:base` are composed
/// internally and are not run through this check; only the `base` part is.
pub fn validate_agent_id(id: &str) -> Result<(), WeftError> {
    if id.is_empty() {
        return Err(WeftError::InvalidArgument("agent id must not be empty".into()));
    }
    if id.len() > MAX_AGENT_ID_LEN {
        return Err(WeftError::InvalidArgument(format!(
            "agent id too long: {} > {MAX_AGENT_ID_LEN}",
            id.len()
        )));
    }
    match id.chars().next() {
        Some(first) if first.is_ascii_lowercase() || first.is_ascii_digit() => {}
        _ => {
            return Err(WeftError::InvalidArgument(format!(
                "agent id must start with a lowercase letter or digit: {id:?}"
            )));
        }
    }
    if !id.chars().skip(1).all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return Err(WeftError::InvalidArgument(format!(
            "agent id may only contain lowercase letters, digits, and hyphens: {id:?}"
        )));
    }
    if RESERVED_AGENT_IDS.contains(&id) {
        return Err(WeftError::InvalidArgument(format!("agent id {id:?} is reserved")));
    }
    Ok(())
}

//─────────────────────────────
//  Message payloads
//─────────────────────────────

/// Body of a queued or broadcast message.
///
/// A payload is either inline bytes or an indirection into an external
/// reference store, used when a body exceeds the inline size budget. Both
/// shapes must be handled by every consumer (injection, logging previews,
/// size accounting).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Inline bytes carried with the message.
    Inline {
        /// The raw message body.
        data: Vec<u8>,
    },
    /// A reference-id into an external reference store.
    Reference {
        /// Opaque reference identifier.
        id: String,
    },
}

impl MessagePayload {
    /// Payload from a UTF-8 string.
    pub fn text(s: impl Into<String>) -> Self {
        Self::Inline { data: s.into().into_bytes() }
    }

    /// Number of bytes accounted against size budgets. References count as
    /// the length of the id, not the referenced bytes.
    pub fn size_bytes(&self) -> usize {
        match self {
            Self::Inline { data } => data.len(),
            Self::Reference { id } => id.len(),
        }
    }

    /// Render the payload for injection into a conversation: inline bytes as
    /// lossy UTF-8, references as `[Reference: <id>]`.
    pub fn render(&self) -> String {
        match self {
            Self::Inline { data } => String::from_utf8_lossy(data).into_owned(),
            Self::Reference { id } => format!("[Reference: {id}]"),
        }
    }

    /// Short preview suitable for log lines.
    pub fn preview(&self, max_len: usize) -> String {
        let rendered = self.render();
        if rendered.len() <= max_len {
            rendered
        } else {
            let cut = rendered
                .char_indices()
                .take_while(|(i, _)| *i < max_len)
                .last()
                .map(|(i, c)| i + c.len_utf8())
                .unwrap_or(0);
            format!("{}...", &rendered[..cut])
        }
    }
}

//─────────────────────────────
//  Point-to-point queue messages
//─────────────────────────────

/// Acknowledgement state of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckState {
    /// Delivered (or deliverable) but not yet acknowledged.
    Pending,
    /// Acknowledged and removed from the queue.
    Acked,
}

/// A point-to-point message between two agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Unique message id.
    pub id: String,
    /// Sending agent id.
    pub from_agent: String,
    /// Destination agent id.
    pub to_agent: String,
    /// Application-level message type tag.
    pub message_type: String,
    /// Message body.
    pub payload: MessagePayload,
    /// Free-form metadata (correlation ids, reply routing).
    pub metadata: HashMap<String, String>,
    /// Enqueue timestamp.
    pub enqueued_at: DateTime<Utc>,
    /// Acknowledgement state.
    pub ack: AckState,
}

/// Metadata key correlating a reply to the message it answers.
pub const META_IN_REPLY_TO: &str = "in_reply_to";

//─────────────────────────────
//  Broadcast bus messages
//─────────────────────────────

/// A multicast message published on a topic. Distinct from [`QueuedMessage`]:
/// no per-recipient state is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Unique message id.
    pub id: String,
    /// Topic the message was published on.
    pub topic: String,
    /// Publishing agent id.
    pub from_agent: String,
    /// Message body.
    pub payload: MessagePayload,
    /// Free-form metadata.
    pub metadata: HashMap<String, String>,
    /// Publish time in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

//─────────────────────────────
//  Shared memory
//─────────────────────────────

/// Enumerated scope partitioning the shared key/value space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedNamespace {
    /// Visible to every agent.
    Global,
    /// Scoped to one workflow.
    Workflow,
    /// Scoped to one session.
    Session,
}

impl SharedNamespace {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Workflow => "workflow",
            Self::Session => "session",
        }
    }
}

impl std::fmt::Display for SharedNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A versioned value in the shared memory store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedValue {
    /// Namespace the value lives in.
    pub namespace: SharedNamespace,
    /// Key within the namespace.
    pub key: String,
    /// Raw bytes.
    pub value: Vec<u8>,
    /// Monotonic version, starting at 1 and strictly increasing per Put.
    pub version: u64,
    /// Agent that created the entry.
    pub created_by: String,
    /// Last write timestamp.
    pub updated_at: DateTime<Utc>,
}

/// A change record emitted to watchers of the shared memory store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedMemoryChange {
    /// Namespace of the changed key.
    pub namespace: SharedNamespace,
    /// The changed key.
    pub key: String,
    /// New value; empty on delete.
    pub value: Vec<u8>,
    /// Version after the change; the deleted version on delete.
    pub version: u64,
    /// Whether the change removed the entry.
    pub deleted: bool,
}

/// Aggregate statistics over the shared memory store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Number of live keys across all namespaces.
    pub key_count: u64,
    /// Total Put operations since the store was created.
    pub write_count: u64,
    /// Sum of live value sizes in bytes.
    pub total_bytes: u64,
}

//─────────────────────────────
//  Sessions
//─────────────────────────────

/// Conversation state for one (agent, user) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session id.
    pub id: String,
    /// Owning agent id.
    pub agent_id: String,
    /// Parent session for spawned children.
    pub parent_session_id: Option<String>,
    /// Creation timestamp (immutable).
    pub created_at: DateTime<Utc>,
    /// Last activity timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Role of a stored conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// Human input.
    User,
    /// Agent output.
    Agent,
    /// System-injected content.
    System,
}

/// One persisted conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Stable message id assigned by storage.
    pub id: String,
    /// Session the message belongs to.
    pub session_id: String,
    /// Speaker role.
    pub role: MessageRole,
    /// Message text.
    pub content: String,
    /// Persistence timestamp.
    pub created_at: DateTime<Utc>,
}

//─────────────────────────────
//  Chat outcomes
//─────────────────────────────

/// Token usage statistics for one chat turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt_tokens: u32,
    /// Tokens in the completion.
    pub completion_tokens: u32,
    /// Total tokens used.
    pub total_tokens: u32,
}

/// Result of one agent chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatOutcome {
    /// Final response text.
    pub text: String,
    /// Estimated provider cost in USD.
    pub cost_usd: f64,
    /// Token usage for the turn.
    pub usage: TokenUsage,
}

//─────────────────────────────
//  Progress events
//─────────────────────────────

/// Typed progress event emitted while an agent runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A coarse stage marker.
    Stage {
        /// Human-readable stage label.
        label: String,
    },
    /// A tool was invoked by the agent.
    ToolInvoked {
        /// Tool name.
        tool: String,
    },
    /// The agent asked a clarification question and is awaiting a human
    /// answer.
    QuestionAsked {
        /// Question id.
        id: String,
        /// Question prompt shown to the human.
        prompt: String,
    },
    /// A previously asked question was answered (or abandoned).
    QuestionAnswered {
        /// Id of the answered question.
        question_id: String,
    },
    /// A spawned agent processed a broadcast message on behalf of this
    /// session.
    PubSubMessage {
        /// Topic of the processed message.
        topic: String,
        /// Originating agent.
        from_agent: String,
        /// Short body preview.
        preview: String,
    },
    /// Terminal event: the turn completed. Always the last event of a
    /// successful stream.
    Completed {
        /// Final response text.
        text: String,
        /// Estimated cost in USD.
        cost_usd: f64,
    },
    /// Terminal event: the turn failed.
    Failed {
        /// Error description.
        error: String,
    },
}

impl ProgressEvent {
    /// Whether this event terminates a progress stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// Lifecycle event for a pattern in the pattern library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternEvent {
    /// What happened to the pattern.
    pub kind: PatternEventKind,
    /// Pattern name.
    pub name: String,
    /// Optional detail (validation error text, source path).
    pub detail: Option<String>,
}

/// Kind of pattern lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatternEventKind {
    /// A new pattern was created.
    PatternCreated,
    /// An existing pattern was replaced.
    PatternModified,
    /// A pattern was removed.
    PatternDeleted,
    /// A submitted pattern failed validation.
    PatternValidationFailed,
}

//─────────────────────────────
//  Workflow patterns & executions
//─────────────────────────────

/// One agent invocation inside a workflow pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternStep {
    /// Step id, unique within the pattern.
    pub id: String,
    /// Agent the step invokes.
    pub agent: String,
    /// Prompt template; `{{var}}` placeholders are interpolated before
    /// execution.
    pub prompt: String,
    /// Step ids this step depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A declarative workflow: a DAG of agent invocations. Compilation and
/// validation internals live outside the control plane; the control plane
/// only interpolates variables and extracts the referenced agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPattern {
    /// Pattern name.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// The invocation DAG.
    pub steps: Vec<PatternStep>,
}

impl WorkflowPattern {
    /// Distinct agent ids referenced by the pattern, in first-use order.
    pub fn agent_ids(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for step in &self.steps {
            if !seen.contains(&step.agent) {
                seen.push(step.agent.clone());
            }
        }
        seen
    }

    /// Replace `{{key}}` placeholders in every step prompt.
    pub fn interpolate(&self, variables: &HashMap<String, String>) -> WorkflowPattern {
        let mut out = self.clone();
        for step in &mut out.steps {
            for (key, value) in variables {
                step.prompt = step.prompt.replace(&format!("{{{{{key}}}}}"), value);
            }
        }
        out
    }
}

/// Status of a workflow execution. Transitions are monotonic forward: once a
/// terminal status is reached it never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The orchestrator is running the pattern.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped by the caller.
    Canceled,
}

impl ExecutionStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// In-memory record of one workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Execution id.
    pub execution_id: String,
    /// Name of the executed pattern.
    pub pattern_name: String,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time; set exactly once when a terminal status is reached.
    pub finished_at: Option<DateTime<Utc>>,
    /// Current status.
    pub status: ExecutionStatus,
    /// Error text when failed.
    pub error: Option<String>,
    /// Orchestrator result when completed.
    pub result: Option<serde_json::Value>,
}

/// A progress record streamed to workflow clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    /// Execution the record belongs to.
    pub execution_id: String,
    /// Stage label.
    pub stage: String,
    /// Completion percentage, 0-100.
    pub percent: u8,
    /// Optional partial result.
    #[serde(default)]
    pub partial_result: Option<serde_json::Value>,
}

//─────────────────────────────
//  Schedules
//─────────────────────────────

/// A cron-driven workflow trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSchedule {
    /// Schedule id. RPC-created ids follow
    /// `rpc-<workflow-name>-<unix-seconds>-<nanos>`.
    pub id: String,
    /// Workflow pattern the schedule triggers.
    pub workflow_name: String,
    /// Cron expression.
    pub cron_expr: String,
    /// Variables interpolated into the pattern on each trigger.
    #[serde(default)]
    pub variables: HashMap<String, String>,
    /// Source YAML path; non-empty marks the schedule YAML-sourced and
    /// immutable via RPC. Immutable after creation.
    #[serde(default)]
    pub yaml_path: String,
    /// Whether the schedule is currently paused.
    #[serde(default)]
    pub paused: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl WorkflowSchedule {
    /// Whether the schedule was loaded from YAML and is therefore immutable
    /// via the RPC surface.
    pub fn is_yaml_sourced(&self) -> bool {
        !self.yaml_path.is_empty()
    }
}

/// One historical run of a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRun {
    /// Schedule that fired.
    pub schedule_id: String,
    /// Workflow execution started by the run, when one was started.
    pub execution_id: Option<String>,
    /// Run start time.
    pub started_at: DateTime<Utc>,
    /// Run end time.
    pub finished_at: Option<DateTime<Utc>>,
    /// Whether the run succeeded.
    pub success: bool,
    /// Error text for failed runs.
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_agent_ids() {
        for id in ["demo", "a", "researcher-2", "0x", "wflow-alpha"] {
            assert!(validate_agent_id(id).is_ok(), "{id} should be valid");
        }
    }

    #[test]
    fn test_invalid_agent_ids() {
        for id in ["", "-lead", "UPPER", "has space", "agents", "a:b"] {
            assert!(validate_agent_id(id).is_err(), "{id} should be rejected");
        }
        let long = "a".repeat(MAX_AGENT_ID_LEN + 1);
        assert!(validate_agent_id(&long).is_err());
    }

    #[test]
    fn test_payload_render() {
        let inline = MessagePayload::text("ack");
        assert_eq!(inline.render(), "ack");
        assert_eq!(inline.size_bytes(), 3);

        let reference = MessagePayload::Reference { id: "ref-42".into() };
        assert_eq!(reference.render(), "[Reference: ref-42]");
        assert_eq!(reference.size_bytes(), 6);
    }

    #[test]
    fn test_payload_preview_truncates() {
        let payload = MessagePayload::text("0123456789");
        assert_eq!(payload.preview(4), "0123...");
        assert_eq!(payload.preview(32), "0123456789");
    }

    #[test]
    fn test_pattern_interpolation() {
        let pattern = WorkflowPattern {
            name: "report".into(),
            description: None,
            steps: vec![
                PatternStep {
                    id: "gather".into(),
                    agent: "researcher".into(),
                    prompt: "Collect data about {{topic}}".into(),
                    depends_on: vec![],
                },
                PatternStep {
                    id: "write".into(),
                    agent: "writer".into(),
                    prompt: "Summarize {{topic}} findings".into(),
                    depends_on: vec!["gather".into()],
                },
            ],
        };

        let vars = HashMap::from([("topic".to_string(), "rust".to_string())]);
        let resolved = pattern.interpolate(&vars);
        assert_eq!(resolved.steps[0].prompt, "Collect data about rust");
        assert_eq!(resolved.steps[1].prompt, "Summarize rust findings");
        assert_eq!(pattern.agent_ids(), vec!["researcher", "writer"]);
    }

    #[test]
    fn test_yaml_sourced_schedule() {
        let mut schedule = WorkflowSchedule {
            id: "rpc-report-1700000000-42".into(),
            workflow_name: "report".into(),
            cron_expr: "0 0 * * * *".into(),
            variables: HashMap::new(),
            yaml_path: String::new(),
            paused: false,
            created_at: Utc::now(),
        };
        assert!(!schedule.is_yaml_sourced());
        schedule.yaml_path = "schedules/report.yaml".into();
        assert!(schedule.is_yaml_sourced());
    }

    #[test]
    fn test_progress_event_terminal() {
        assert!(ProgressEvent::Completed { text: "done".into(), cost_usd: 0.01 }.is_terminal());
        assert!(ProgressEvent::Failed { error: "boom".into() }.is_terminal());
        assert!(!ProgressEvent::Stage { label: "loading".into() }.is_terminal());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Everything the grammar generates validates, except the
            // reserved set.
            #[test]
            fn prop_grammar_ids_validate(id in "[a-z0-9][a-z0-9-]{0,62}") {
                prop_assume!(!RESERVED_AGENT_IDS.contains(&id.as_str()));
                prop_assert!(validate_agent_id(&id).is_ok());
            }

            // No validated id ever exceeds the length bound or carries a
            // namespace separator.
            #[test]
            fn prop_valid_ids_are_bare(id in "\\PC{0,80}") {
                if validate_agent_id(&id).is_ok() {
                    prop_assert!(id.len() <= MAX_AGENT_ID_LEN);
                    prop_assert!(!id.contains(':'));
                }
            }
        }
    }
}
