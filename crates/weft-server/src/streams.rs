//! Streaming surfaces: session subscriptions, pattern lifecycle, and the
//! clarification answer RPC.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use weft_runtime::validate_pattern;
use weft_types::{
    PatternEvent, PatternEventKind, PatternLibrary, StoredMessage, WeftError, WorkflowPattern,
};

use crate::{AnswerResult, WeftServer};

/// Buffer of one session subscription stream.
const SESSION_STREAM_BUFFER: usize = 32;

impl WeftServer {
    /// `SubscribeToSession`: stream new conversation messages to a client by
    /// polling storage and forwarding any suffix newer than the last-seen
    /// count. The stream ends when the client goes away, the session is
    /// deleted, or the server shuts down.
    pub async fn subscribe_to_session(
        &self,
        session_id: &str,
    ) -> Result<mpsc::Receiver<StoredMessage>, WeftError> {
        self.get_session(session_id).await?;
        let (tx, rx) = mpsc::channel(SESSION_STREAM_BUFFER);

        let sessions = self.sessions.clone();
        let cancel = self.shutdown.clone();
        let session_id = session_id.to_string();
        let tick = Duration::from_millis(self.config.session_stream_tick_ms.max(1));
        tokio::spawn(async move {
            let mut last_seen = 0usize;
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if sessions.get_session(&session_id).await.ok().flatten().is_none() {
                            break;
                        }
                        let messages = match sessions.list_messages(&session_id).await {
                            Ok(messages) => messages,
                            Err(err) => {
                                warn!(session = %session_id, error = %err, "message reload failed");
                                continue;
                            }
                        };
                        for message in messages.iter().skip(last_seen) {
                            if tx.send(message.clone()).await.is_err() {
                                return;
                            }
                        }
                        last_seen = messages.len();
                    }
                }
            }
        });
        Ok(rx)
    }

    /// `CreatePattern`: validate, insert (honoring `overwrite`), and
    /// broadcast the lifecycle event. Validation failures are broadcast as
    /// `PATTERN_VALIDATION_FAILED` and returned as `InvalidArgument`.
    pub fn create_pattern(
        &self,
        pattern: WorkflowPattern,
        overwrite: bool,
    ) -> Result<(), WeftError> {
        if let Err(err) = validate_pattern(&pattern) {
            self.pattern_events.broadcast(&PatternEvent {
                kind: PatternEventKind::PatternValidationFailed,
                name: pattern.name.clone(),
                detail: Some(err.to_string()),
            });
            return Err(err);
        }
        if !overwrite && self.patterns.get(&pattern.name).is_some() {
            return Err(WeftError::AlreadyExists(format!("pattern {:?}", pattern.name)));
        }
        let name = pattern.name.clone();
        let created = self.patterns.put(pattern);
        self.pattern_events.broadcast(&PatternEvent {
            kind: if created {
                PatternEventKind::PatternCreated
            } else {
                PatternEventKind::PatternModified
            },
            name,
            detail: None,
        });
        Ok(())
    }

    /// Remove a pattern and broadcast the deletion.
    pub fn delete_pattern(&self, name: &str) -> Result<(), WeftError> {
        if !self.patterns.remove(name) {
            return Err(WeftError::NotFound(format!("pattern {name:?}")));
        }
        self.pattern_events.broadcast(&PatternEvent {
            kind: PatternEventKind::PatternDeleted,
            name: name.to_string(),
            detail: None,
        });
        Ok(())
    }

    /// `StreamPatternUpdates`.
    pub fn stream_pattern_updates(
        &self,
    ) -> Result<(String, mpsc::Receiver<PatternEvent>), WeftError> {
        self.pattern_events.subscribe()
    }

    /// `AnswerClarificationQuestion`.
    pub async fn answer_clarification_question(
        &self,
        question_id: &str,
        answer: &str,
    ) -> Result<AnswerResult, WeftError> {
        self.questions.answer(question_id, answer, &self.shutdown).await
    }
}
