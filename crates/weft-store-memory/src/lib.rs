#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **weft-store-memory** – In-memory session storage driver for Weft.
//!
//! This crate provides a fast, non-persistent [`SessionStorage`] backend
//! suitable for testing, development, and scenarios where conversation
//! durability is not required. All data is lost when the process terminates.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use weft_types::{Session, SessionStorage, StoredMessage};

//─────────────────────────────
//  In-memory session store
//─────────────────────────────

/// An in-memory, non-persistent session store.
///
/// Sessions and messages are held in `HashMap`s behind a single async
/// rw-lock. Message ids are assigned at append time so that re-reads return
/// stable identifiers, matching the contract of persistent drivers.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    inner: Arc<RwLock<StoreState>>,
}

#[derive(Debug, Default)]
struct StoreState {
    sessions: HashMap<String, Session>,
    messages: HashMap<String, Vec<StoredMessage>>,
}

impl MemorySessionStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }
}

#[async_trait]
impl SessionStorage for MemorySessionStore {
    async fn create_session(&self, session: Session) -> Result<()> {
        let mut state = self.inner.write().await;
        state.messages.entry(session.id.clone()).or_default();
        state.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.inner.read().await.sessions.get(id).cloned())
    }

    async fn list_sessions(&self, agent_id: Option<&str>) -> Result<Vec<Session>> {
        let state = self.inner.read().await;
        let mut sessions: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| agent_id.map_or(true, |a| s.agent_id == a))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        let mut state = self.inner.write().await;
        state.sessions.remove(id);
        state.messages.remove(id);
        Ok(())
    }

    async fn append_message(&self, mut message: StoredMessage) -> Result<()> {
        let mut state = self.inner.write().await;
        if message.id.is_empty() {
            message.id = Uuid::new_v4().to_string();
        }
        if let Some(session) = state.sessions.get_mut(&message.session_id) {
            session.updated_at = Utc::now();
        }
        state.messages.entry(message.session_id.clone()).or_default().push(message);
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        Ok(self.inner.read().await.messages.get(session_id).cloned().unwrap_or_default())
    }

    async fn touch_session(&self, id: &str) -> Result<()> {
        if let Some(session) = self.inner.write().await.sessions.get_mut(id) {
            session.updated_at = Utc::now();
        }
        Ok(())
    }
}
