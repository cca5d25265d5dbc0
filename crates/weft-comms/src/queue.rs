//! Point-to-point message queue with acknowledgement and reply correlation.
//!
//! Each destination agent has its own FIFO queue. A message is handed out at
//! most once by [`dequeue`](MessageQueue::dequeue) and retained until
//! [`acknowledge`](MessageQueue::acknowledge) removes it; a durable driver
//! would re-deliver retained messages after a crash. Wake-up notification
//! channels let consumers sleep between sends instead of polling.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use weft_types::{AckState, MessagePayload, QueuedMessage, WeftError, META_IN_REPLY_TO};

/// Reply wait applied when a caller passes `0` to
/// [`send_and_receive`](MessageQueue::send_and_receive).
pub const DEFAULT_SEND_RECEIVE_TIMEOUT_SECS: u64 = 30;

struct PendingEntry {
    message: QueuedMessage,
    delivered: bool,
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<String, VecDeque<PendingEntry>>,
    notify: HashMap<String, mpsc::Sender<()>>,
    reply_waiters: HashMap<String, oneshot::Sender<QueuedMessage>>,
    closed: bool,
}

/// Point-to-point plane.
#[derive(Default)]
pub struct MessageQueue {
    inner: Mutex<QueueState>,
}

impl MessageQueue {
    /// Create an empty queue set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message for `to_agent`, returning its id.
    ///
    /// A message whose metadata carries `in_reply_to` matching an in-flight
    /// [`send_and_receive`](MessageQueue::send_and_receive) is routed to that
    /// waiter instead of being enqueued. If a notification channel is
    /// registered for the destination, an empty wake-up signal is pushed
    /// non-blockingly.
    pub fn send(
        &self,
        from_agent: &str,
        to_agent: &str,
        message_type: &str,
        payload: MessagePayload,
        metadata: HashMap<String, String>,
    ) -> Result<String, WeftError> {
        if to_agent.is_empty() {
            return Err(WeftError::InvalidArgument("destination agent must not be empty".into()));
        }
        let message = QueuedMessage {
            id: Uuid::new_v4().to_string(),
            from_agent: from_agent.to_string(),
            to_agent: to_agent.to_string(),
            message_type: message_type.to_string(),
            payload,
            metadata,
            enqueued_at: Utc::now(),
            ack: AckState::Pending,
        };
        let id = message.id.clone();

        let mut state = self.inner.lock().expect("queue lock poisoned");
        if state.closed {
            return Err(WeftError::Unavailable("message queue is shut down".into()));
        }
        if let Some(correlation) = message.metadata.get(META_IN_REPLY_TO) {
            if let Some(waiter) = state.reply_waiters.remove(correlation) {
                // Consumed by the waiting request; not enqueued.
                let _ = waiter.send(message);
                return Ok(id);
            }
        }
        state.queues.entry(to_agent.to_string()).or_default().push_back(PendingEntry {
            message,
            delivered: false,
        });
        if let Some(notify) = state.notify.get(to_agent) {
            let _ = notify.try_send(());
        }
        debug!(%id, from = %from_agent, to = %to_agent, "message enqueued");
        Ok(id)
    }

    /// Hand out the oldest undelivered message for `agent`, if any.
    ///
    /// Enqueue order is preserved per destination. The message stays in the
    /// queue until acknowledged.
    pub fn dequeue(&self, agent: &str) -> Option<QueuedMessage> {
        let mut state = self.inner.lock().expect("queue lock poisoned");
        let queue = state.queues.get_mut(agent)?;
        let entry = queue.iter_mut().find(|e| !e.delivered)?;
        entry.delivered = true;
        Some(entry.message.clone())
    }

    /// Remove a message from its queue.
    pub fn acknowledge(&self, message_id: &str) -> Result<(), WeftError> {
        let mut state = self.inner.lock().expect("queue lock poisoned");
        for queue in state.queues.values_mut() {
            if let Some(pos) = queue.iter().position(|e| e.message.id == message_id) {
                queue.remove(pos);
                return Ok(());
            }
        }
        Err(WeftError::NotFound(format!("message {message_id:?}")))
    }

    /// Send a request and wait for a message whose `in_reply_to` metadata
    /// names the request id. Fails `DeadlineExceeded` when no reply arrives
    /// within `timeout_secs` (0 selects the default).
    pub async fn send_and_receive(
        &self,
        from_agent: &str,
        to_agent: &str,
        message_type: &str,
        payload: MessagePayload,
        metadata: HashMap<String, String>,
        timeout_secs: u64,
    ) -> Result<MessagePayload, WeftError> {
        let timeout_secs =
            if timeout_secs == 0 { DEFAULT_SEND_RECEIVE_TIMEOUT_SECS } else { timeout_secs };
        let (reply_tx, reply_rx) = oneshot::channel();

        // Register the waiter and enqueue under one lock so the reply cannot
        // race past the registration.
        let message_id = {
            let mut state = self.inner.lock().expect("queue lock poisoned");
            if state.closed {
                return Err(WeftError::Unavailable("message queue is shut down".into()));
            }
            let message = QueuedMessage {
                id: Uuid::new_v4().to_string(),
                from_agent: from_agent.to_string(),
                to_agent: to_agent.to_string(),
                message_type: message_type.to_string(),
                payload,
                metadata,
                enqueued_at: Utc::now(),
                ack: AckState::Pending,
            };
            let id = message.id.clone();
            state.reply_waiters.insert(id.clone(), reply_tx);
            state.queues.entry(to_agent.to_string()).or_default().push_back(PendingEntry {
                message,
                delivered: false,
            });
            if let Some(notify) = state.notify.get(to_agent) {
                let _ = notify.try_send(());
            }
            id
        };

        match tokio::time::timeout(Duration::from_secs(timeout_secs), reply_rx).await {
            Ok(Ok(reply)) => Ok(reply.payload),
            Ok(Err(_)) => Err(WeftError::Unavailable("message queue is shut down".into())),
            Err(_) => {
                self.inner.lock().expect("queue lock poisoned").reply_waiters.remove(&message_id);
                Err(WeftError::DeadlineExceeded(format!(
                    "no reply to message {message_id} within {timeout_secs}s"
                )))
            }
        }
    }

    /// Attach a wake-up channel for one destination agent.
    pub fn register_notification_channel(&self, agent: &str, notify: mpsc::Sender<()>) {
        self.inner.lock().expect("queue lock poisoned").notify.insert(agent.to_string(), notify);
    }

    /// Detach the wake-up channel of one destination agent.
    pub fn unregister_notification_channel(&self, agent: &str) {
        self.inner.lock().expect("queue lock poisoned").notify.remove(agent);
    }

    /// Detach the wake-up channel of `agent` only if it is `tx`. An exiting
    /// loop uses this so it never tears down a replacement's registration.
    pub fn unregister_notification_channel_matching(&self, agent: &str, tx: &mpsc::Sender<()>) {
        let mut state = self.inner.lock().expect("queue lock poisoned");
        if state.notify.get(agent).is_some_and(|current| current.same_channel(tx)) {
            state.notify.remove(agent);
        }
    }

    /// Agents that currently have undelivered messages.
    pub fn agents_with_pending_messages(&self) -> Vec<String> {
        let state = self.inner.lock().expect("queue lock poisoned");
        state
            .queues
            .iter()
            .filter(|(_, q)| q.iter().any(|e| !e.delivered))
            .map(|(agent, _)| agent.clone())
            .collect()
    }

    /// Undelivered message count for one agent.
    pub fn pending_count(&self, agent: &str) -> usize {
        let state = self.inner.lock().expect("queue lock poisoned");
        state.queues.get(agent).map_or(0, |q| q.iter().filter(|e| !e.delivered).count())
    }

    /// Shut down: drop all queues, waiters, and notification channels.
    pub fn close(&self) {
        let mut state = self.inner.lock().expect("queue lock poisoned");
        state.closed = true;
        state.queues.clear();
        state.notify.clear();
        state.reply_waiters.clear();
    }
}
