//! Broadcast message bus with glob topic subscriptions.
//!
//! Delivery is best-effort: for each matched subscription the bus performs a
//! non-blocking send and counts a drop when the channel is full. Self-sent
//! messages are *not* filtered here; that belongs to the consumer layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use weft_types::{BusMessage, MessagePayload, WeftError};

/// Default delivery-channel capacity for new subscriptions.
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 100;

/// Predicate applied to a message before delivery to one subscription.
pub type MessageFilter = Arc<dyn Fn(&BusMessage) -> bool + Send + Sync>;

/// Public view of a live subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    /// Subscription id.
    pub id: String,
    /// Agent that owns the subscription.
    pub owner_agent_id: String,
    /// Topic pattern the subscription matches.
    pub topic_pattern: String,
    /// Delivery-channel capacity.
    pub buffer: usize,
}

/// Outcome of one publish call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// Subscriptions the message was handed to.
    pub delivered: usize,
    /// Subscriptions skipped because their channel was full or closed.
    pub dropped: usize,
}

struct SubEntry {
    owner: String,
    pattern: String,
    buffer: usize,
    filter: Option<MessageFilter>,
    tx: mpsc::Sender<BusMessage>,
    notify: Option<mpsc::Sender<()>>,
}

/// Topic broadcast plane.
///
/// The bus exclusively owns every delivery channel: a channel is closed
/// exactly once, on [`unsubscribe`](MessageBus::unsubscribe) or
/// [`close`](MessageBus::close), by dropping its sender.
pub struct MessageBus {
    subs: RwLock<HashMap<String, SubEntry>>,
    delivered_total: AtomicU64,
    dropped_total: AtomicU64,
    closed: AtomicBool,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            subs: RwLock::new(HashMap::new()),
            delivered_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a subscription and hand back its delivery channel.
    pub fn subscribe(
        &self,
        owner_agent_id: &str,
        topic_pattern: &str,
        filter: Option<MessageFilter>,
        buffer: usize,
    ) -> Result<(SubscriptionInfo, mpsc::Receiver<BusMessage>), WeftError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WeftError::Unavailable("message bus is shut down".into()));
        }
        if topic_pattern.is_empty() {
            return Err(WeftError::InvalidArgument("topic pattern must not be empty".into()));
        }
        let buffer = buffer.max(1);
        let (tx, rx) = mpsc::channel(buffer);
        let info = SubscriptionInfo {
            id: Uuid::new_v4().to_string(),
            owner_agent_id: owner_agent_id.to_string(),
            topic_pattern: topic_pattern.to_string(),
            buffer,
        };
        let entry = SubEntry {
            owner: info.owner_agent_id.clone(),
            pattern: info.topic_pattern.clone(),
            buffer,
            filter,
            tx,
            notify: None,
        };
        self.subs.write().expect("bus lock poisoned").insert(info.id.clone(), entry);
        debug!(subscription = %info.id, owner = %owner_agent_id, pattern = %topic_pattern, "subscribed");
        Ok((info, rx))
    }

    /// Remove a subscription, closing its delivery channel.
    pub fn unsubscribe(&self, subscription_id: &str) -> Result<(), WeftError> {
        let removed = self.subs.write().expect("bus lock poisoned").remove(subscription_id);
        match removed {
            // Dropping the entry drops both senders, closing the channels.
            Some(_) => Ok(()),
            None => Err(WeftError::NotFound(format!("subscription {subscription_id:?}"))),
        }
    }

    /// Attach a wake-up channel signalled (non-blockingly) whenever the
    /// subscription receives a message.
    pub fn register_notification_channel(
        &self,
        subscription_id: &str,
        notify: mpsc::Sender<()>,
    ) -> Result<(), WeftError> {
        let mut subs = self.subs.write().expect("bus lock poisoned");
        match subs.get_mut(subscription_id) {
            Some(entry) => {
                entry.notify = Some(notify);
                Ok(())
            }
            None => Err(WeftError::NotFound(format!("subscription {subscription_id:?}"))),
        }
    }

    /// Publish a message to every matching subscription.
    pub fn publish(
        &self,
        topic: &str,
        from_agent: &str,
        payload: MessagePayload,
        metadata: HashMap<String, String>,
    ) -> Result<(BusMessage, PublishReceipt), WeftError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WeftError::Unavailable("message bus is shut down".into()));
        }
        if topic.is_empty() {
            return Err(WeftError::InvalidArgument("topic must not be empty".into()));
        }
        let message = BusMessage {
            id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            from_agent: from_agent.to_string(),
            payload,
            metadata,
            timestamp_ms: Utc::now().timestamp_millis(),
        };

        let mut receipt = PublishReceipt::default();
        let subs = self.subs.read().expect("bus lock poisoned");
        for (id, entry) in subs.iter() {
            if !topic_matches(&entry.pattern, topic) {
                continue;
            }
            if let Some(filter) = &entry.filter {
                if !filter(&message) {
                    continue;
                }
            }
            match entry.tx.try_send(message.clone()) {
                Ok(()) => {
                    receipt.delivered += 1;
                    if let Some(notify) = &entry.notify {
                        let _ = notify.try_send(());
                    }
                }
                Err(_) => {
                    receipt.dropped += 1;
                    warn!(subscription = %id, topic, "subscriber channel full, dropping message");
                }
            }
        }
        drop(subs);

        self.delivered_total.fetch_add(receipt.delivered as u64, Ordering::Relaxed);
        self.dropped_total.fetch_add(receipt.dropped as u64, Ordering::Relaxed);
        Ok((message, receipt))
    }

    /// Live subscriptions owned by one agent.
    pub fn subscriptions_by_agent(&self, owner_agent_id: &str) -> Vec<SubscriptionInfo> {
        self.subs
            .read()
            .expect("bus lock poisoned")
            .iter()
            .filter(|(_, e)| e.owner == owner_agent_id)
            .map(|(id, e)| SubscriptionInfo {
                id: id.clone(),
                owner_agent_id: e.owner.clone(),
                topic_pattern: e.pattern.clone(),
                buffer: e.buffer,
            })
            .collect()
    }

    /// Lifetime delivered/dropped counters.
    pub fn totals(&self) -> (u64, u64) {
        (self.delivered_total.load(Ordering::Relaxed), self.dropped_total.load(Ordering::Relaxed))
    }

    /// Shut the bus down: every delivery channel is closed and the
    /// subscription map cleared. Subsequent calls fail `Unavailable`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subs.write().expect("bus lock poisoned").clear();
    }
}

/// Segment-wise topic matching.
///
/// Topics are `.`-separated. In a pattern, a `*` segment matches exactly one
/// topic segment, except in the final position where it matches one *or
/// more* remaining segments. All other segments match literally.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pat: Vec<&str> = pattern.split('.').collect();
    let top: Vec<&str> = topic.split('.').collect();
    for (i, seg) in pat.iter().enumerate() {
        if *seg == "*" && i == pat.len() - 1 {
            // Trailing wildcard swallows the rest, as long as there is a rest.
            return top.len() > i;
        }
        match top.get(i) {
            Some(t) if *seg == "*" || seg == t => {}
            _ => return false,
        }
    }
    pat.len() == top.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> MessagePayload {
        MessagePayload::text(s)
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("tasks.created", "tasks.created"));
        assert!(topic_matches("tasks.*", "tasks.created"));
        assert!(topic_matches("tasks.*", "tasks.a.b"));
        assert!(topic_matches("*.created", "tasks.created"));
        assert!(topic_matches("*", "anything"));
        assert!(topic_matches("*", "a.b.c"));

        assert!(!topic_matches("tasks.created", "tasks.deleted"));
        assert!(!topic_matches("tasks.*", "tasks"));
        assert!(!topic_matches("*.created", "tasks.created.now"));
        assert!(!topic_matches("tasks", "tasks.created"));
    }

    #[tokio::test]
    async fn test_publish_subscribe_roundtrip() {
        let bus = MessageBus::new();
        let (info, mut rx) = bus.subscribe("worker", "jobs.*", None, 8).unwrap();

        let (_, receipt) =
            bus.publish("jobs.created", "dispatcher", text("j1"), HashMap::new()).unwrap();
        assert_eq!(receipt.delivered, 1);
        assert_eq!(receipt.dropped, 0);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "jobs.created");
        assert_eq!(msg.from_agent, "dispatcher");
        assert_eq!(msg.payload.render(), "j1");

        // After unsubscribe, nothing is delivered and the channel closes.
        bus.unsubscribe(&info.id).unwrap();
        let (_, receipt) =
            bus.publish("jobs.created", "dispatcher", text("j2"), HashMap::new()).unwrap();
        assert_eq!(receipt.delivered, 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let bus = MessageBus::new();
        let (_info, mut rx) = bus.subscribe("slow", "events", None, 1).unwrap();

        let (_, first) = bus.publish("events", "a", text("1"), HashMap::new()).unwrap();
        let (_, second) = bus.publish("events", "a", text("2"), HashMap::new()).unwrap();
        assert_eq!(first.delivered, 1);
        assert_eq!(second.dropped, 1);

        assert_eq!(rx.recv().await.unwrap().payload.render(), "1");
        let (delivered, dropped) = bus.totals();
        assert_eq!((delivered, dropped), (1, 1));
    }

    #[tokio::test]
    async fn test_filter_and_notification_channel() {
        let bus = MessageBus::new();
        let filter: MessageFilter = Arc::new(|m: &BusMessage| m.from_agent != "noisy");
        let (info, mut rx) = bus.subscribe("worker", "events", Some(filter), 8).unwrap();

        let (notify_tx, mut notify_rx) = mpsc::channel(1);
        bus.register_notification_channel(&info.id, notify_tx).unwrap();

        bus.publish("events", "noisy", text("skip"), HashMap::new()).unwrap();
        bus.publish("events", "quiet", text("keep"), HashMap::new()).unwrap();

        assert_eq!(rx.recv().await.unwrap().payload.render(), "keep");
        assert!(notify_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_close_clears_subscriptions() {
        let bus = MessageBus::new();
        let (_info, mut rx) = bus.subscribe("worker", "events", None, 8).unwrap();
        assert_eq!(bus.subscriptions_by_agent("worker").len(), 1);

        bus.close();
        assert!(rx.recv().await.is_none());
        assert!(bus.subscribe("worker", "events", None, 8).is_err());
        assert!(bus.publish("events", "a", text("x"), HashMap::new()).is_err());
    }
}
