//! Progress and pattern event fan-out.
//!
//! [`ProgressMultiplexer`] routes typed progress events to at most one live
//! stream per session plus any number of server-side listeners (the
//! clarification bridge hooks question events here).
//! [`PatternEventBroadcaster`] fans pattern lifecycle events out to every
//! subscribed client. Both use non-blocking sends with drop-on-full so a
//! stalled consumer never blocks an emitter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use weft_types::{PatternEvent, ProgressEvent, WeftError};

/// Capacity of one per-session progress stream.
pub const PROGRESS_STREAM_BUFFER: usize = 10;

/// Capacity of one pattern event subscription.
pub const PATTERN_EVENT_BUFFER: usize = 100;

type Listener = Box<dyn Fn(&str, &ProgressEvent) + Send + Sync>;

/// Per-session progress event fan-out.
#[derive(Default)]
pub struct ProgressMultiplexer {
    streams: Mutex<HashMap<String, mpsc::Sender<ProgressEvent>>>,
    listeners: RwLock<Vec<Listener>>,
}

impl ProgressMultiplexer {
    /// Create an empty multiplexer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or replace) the progress stream of one session. Replacing
    /// closes the previous stream's channel.
    pub fn open_stream(&self, session_id: &str) -> mpsc::Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::channel(PROGRESS_STREAM_BUFFER);
        let previous =
            self.streams.lock().expect("progress lock poisoned").insert(session_id.to_string(), tx);
        if previous.is_some() {
            debug!(session = %session_id, "replaced existing progress stream");
        }
        rx
    }

    /// Close and remove the stream of one session.
    pub fn close_stream(&self, session_id: &str) {
        self.streams.lock().expect("progress lock poisoned").remove(session_id);
    }

    /// Whether a live stream exists for the session.
    pub fn has_stream(&self, session_id: &str) -> bool {
        self.streams.lock().expect("progress lock poisoned").contains_key(session_id)
    }

    /// Register a server-side listener invoked synchronously on every event.
    pub fn add_listener(&self, listener: impl Fn(&str, &ProgressEvent) + Send + Sync + 'static) {
        self.listeners.write().expect("listener lock poisoned").push(Box::new(listener));
    }

    /// Emit an event for a session. Returns `true` when a live stream
    /// accepted it (listeners always run).
    pub fn emit(&self, session_id: &str, event: ProgressEvent) -> bool {
        for listener in self.listeners.read().expect("listener lock poisoned").iter() {
            listener(session_id, &event);
        }
        let streams = self.streams.lock().expect("progress lock poisoned");
        match streams.get(session_id) {
            Some(tx) => match tx.try_send(event) {
                Ok(()) => true,
                Err(_) => {
                    warn!(session = %session_id, "progress stream full or closed, dropping event");
                    false
                }
            },
            None => false,
        }
    }
}

/// Broadcast of pattern lifecycle events to streaming clients.
#[derive(Default)]
pub struct PatternEventBroadcaster {
    subscribers: Mutex<HashMap<String, mpsc::Sender<PatternEvent>>>,
    closed: AtomicBool,
}

impl PatternEventBroadcaster {
    /// Create an empty broadcaster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber.
    pub fn subscribe(&self) -> Result<(String, mpsc::Receiver<PatternEvent>), WeftError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WeftError::Unavailable("pattern event broadcaster is shut down".into()));
        }
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(PATTERN_EVENT_BUFFER);
        self.subscribers.lock().expect("broadcaster lock poisoned").insert(id.clone(), tx);
        Ok((id, rx))
    }

    /// Remove a subscriber, closing its channel.
    pub fn unsubscribe(&self, subscriber_id: &str) {
        self.subscribers.lock().expect("broadcaster lock poisoned").remove(subscriber_id);
    }

    /// Broadcast to all subscribers with drop-on-full semantics. Returns
    /// `(delivered, dropped)`.
    pub fn broadcast(&self, event: &PatternEvent) -> (usize, usize) {
        let subscribers = self.subscribers.lock().expect("broadcaster lock poisoned");
        let mut delivered = 0;
        let mut dropped = 0;
        for tx in subscribers.values() {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => dropped += 1,
            }
        }
        (delivered, dropped)
    }

    /// Shut down, closing every subscriber channel.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscribers.lock().expect("broadcaster lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use weft_types::PatternEventKind;

    #[tokio::test]
    async fn test_stream_receives_events() {
        let mux = ProgressMultiplexer::new();
        let mut rx = mux.open_stream("s1");

        assert!(mux.emit("s1", ProgressEvent::Stage { label: "thinking".into() }));
        assert!(!mux.emit("s2", ProgressEvent::Stage { label: "elsewhere".into() }));

        match rx.recv().await.unwrap() {
            ProgressEvent::Stage { label } => assert_eq!(label, "thinking"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_replacing_stream_closes_previous() {
        let mux = ProgressMultiplexer::new();
        let mut first = mux.open_stream("s1");
        let mut second = mux.open_stream("s1");

        assert!(first.recv().await.is_none());
        mux.emit("s1", ProgressEvent::Stage { label: "go".into() });
        assert!(second.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_listeners_run_without_stream() {
        let mux = ProgressMultiplexer::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        mux.add_listener(move |session, _event| {
            assert_eq!(session, "s1");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        mux.emit("s1", ProgressEvent::QuestionAnswered { question_id: "q1".into() });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_full_stream_drops() {
        let mux = ProgressMultiplexer::new();
        let _rx = mux.open_stream("s1");
        for _ in 0..PROGRESS_STREAM_BUFFER {
            assert!(mux.emit("s1", ProgressEvent::Stage { label: "tick".into() }));
        }
        assert!(!mux.emit("s1", ProgressEvent::Stage { label: "overflow".into() }));
    }

    #[tokio::test]
    async fn test_pattern_broadcast() {
        let broadcaster = PatternEventBroadcaster::new();
        let (id_a, mut rx_a) = broadcaster.subscribe().unwrap();
        let (_id_b, mut rx_b) = broadcaster.subscribe().unwrap();

        let event = PatternEvent {
            kind: PatternEventKind::PatternCreated,
            name: "report".into(),
            detail: None,
        };
        assert_eq!(broadcaster.broadcast(&event), (2, 0));
        assert_eq!(rx_a.recv().await.unwrap().name, "report");
        assert_eq!(rx_b.recv().await.unwrap().name, "report");

        broadcaster.unsubscribe(&id_a);
        assert_eq!(broadcaster.broadcast(&event), (1, 0));
        assert!(rx_a.recv().await.is_none());

        broadcaster.close();
        assert!(rx_b.recv().await.is_some());
        assert!(rx_b.recv().await.is_none());
        assert!(broadcaster.subscribe().is_err());
    }
}
