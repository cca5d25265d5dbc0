//! Pending clarification questions and answer delivery.
//!
//! Questions are registered by the agent runtime (with an answer channel)
//! or observed on the progress stream (without one). An entry leaves the map
//! exactly once: on the first answer delivery, on an observed
//! question-answered event, or at shutdown when every answer channel is
//! closed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use weft_types::WeftError;

/// Default wait for a slow answer-channel consumer, in milliseconds.
pub const DEFAULT_ANSWER_SEND_TIMEOUT_MS: u64 = 100;

/// A clarification request awaiting a human answer.
pub struct PendingQuestion {
    /// Question id.
    pub id: String,
    /// Prompt shown to the human.
    pub prompt: String,
    /// Single-shot delivery channel; `None` for questions only observed via
    /// progress events.
    pub answer_tx: Option<mpsc::Sender<String>>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

/// Result of one answer-delivery attempt. Lookup misses are reported here,
/// not as RPC errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerResult {
    /// Whether the answer reached the asking agent.
    pub success: bool,
    /// Whether a pending question was found and consumed.
    pub accepted: bool,
    /// Failure description, when any.
    pub error: Option<String>,
}

/// Map of pending questions keyed by id.
pub struct PendingQuestions {
    inner: Mutex<HashMap<String, PendingQuestion>>,
    send_timeout: Duration,
}

impl PendingQuestions {
    /// Create an empty map with the given channel-send timeout (0 selects
    /// the default).
    pub fn new(send_timeout_ms: u64) -> Self {
        let ms = if send_timeout_ms == 0 { DEFAULT_ANSWER_SEND_TIMEOUT_MS } else { send_timeout_ms };
        Self { inner: Mutex::new(HashMap::new()), send_timeout: Duration::from_millis(ms) }
    }

    /// Register (or replace) a pending question.
    pub fn register(&self, question: PendingQuestion) {
        debug!(question = %question.id, "pending question registered");
        self.inner.lock().expect("question lock poisoned").insert(question.id.clone(), question);
    }

    /// Remove a question without answering (question-answered progress
    /// event, or an agent gave up waiting).
    pub fn remove(&self, question_id: &str) -> bool {
        self.inner.lock().expect("question lock poisoned").remove(question_id).is_some()
    }

    /// Number of pending questions.
    pub fn count(&self) -> usize {
        self.inner.lock().expect("question lock poisoned").len()
    }

    /// Deliver a human answer.
    ///
    /// The entry is atomically looked up and removed; a miss yields a
    /// non-error result with `accepted: false`. Delivery to a closed or
    /// blocked channel is reported as a clean
    /// `"answer channel closed or timeout"`, never a panic.
    pub async fn answer(
        &self,
        question_id: &str,
        answer: &str,
        cancel: &CancellationToken,
    ) -> Result<AnswerResult, WeftError> {
        if question_id.is_empty() {
            return Err(WeftError::InvalidArgument("question id must not be empty".into()));
        }
        if answer.is_empty() {
            return Err(WeftError::InvalidArgument("answer must not be empty".into()));
        }

        let entry = self.inner.lock().expect("question lock poisoned").remove(question_id);
        let Some(question) = entry else {
            return Ok(AnswerResult {
                success: false,
                accepted: false,
                error: Some("question not found or already answered".into()),
            });
        };
        let Some(answer_tx) = question.answer_tx else {
            return Ok(AnswerResult {
                success: false,
                accepted: true,
                error: Some("question has no answer channel".into()),
            });
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(WeftError::Canceled("answer delivery cancelled".into())),
            sent = answer_tx.send_timeout(answer.to_string(), self.send_timeout) => {
                match sent {
                    Ok(()) => {
                        info!(question = %question_id, "clarification answered");
                        Ok(AnswerResult { success: true, accepted: true, error: None })
                    }
                    Err(SendTimeoutError::Timeout(_)) | Err(SendTimeoutError::Closed(_)) => {
                        Ok(AnswerResult {
                            success: false,
                            accepted: true,
                            error: Some("answer channel closed or timeout".into()),
                        })
                    }
                }
            }
        }
    }

    /// Shutdown: close every pending answer channel and clear the map.
    pub fn close_all(&self) {
        let mut map = self.inner.lock().expect("question lock poisoned");
        let drained = map.len();
        map.clear();
        if drained > 0 {
            info!(count = drained, "pending questions dropped at shutdown");
        }
    }
}
