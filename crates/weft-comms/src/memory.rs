//! Namespaced shared key/value memory with versioning and change watchers.
//!
//! Versions per (namespace, key) are strictly monotonic starting at 1 and
//! survive delete/recreate cycles, so a watcher can order every change it
//! observes. Watcher channels are closed only on store shutdown or when the
//! watcher is dropped by its owner.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use weft_types::{MemoryStats, SharedMemoryChange, SharedNamespace, SharedValue, WeftError};

use crate::bus::topic_matches;

/// Change-channel capacity for new watchers.
pub const WATCH_BUFFER: usize = 100;

struct Watcher {
    namespace: Option<SharedNamespace>,
    key_pattern: String,
    tx: mpsc::Sender<SharedMemoryChange>,
}

#[derive(Default)]
struct MemState {
    entries: HashMap<(SharedNamespace, String), SharedValue>,
    /// High-water version per key; never forgotten, so versions keep
    /// increasing across delete/recreate.
    versions: HashMap<(SharedNamespace, String), u64>,
    watchers: HashMap<String, Watcher>,
    closed: bool,
}

/// Shared key/value plane.
#[derive(Default)]
pub struct SharedMemoryStore {
    inner: RwLock<MemState>,
    write_count: AtomicU64,
}

impl SharedMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a value, returning `(new_version, created)`.
    pub fn put(
        &self,
        namespace: SharedNamespace,
        key: &str,
        value: Vec<u8>,
        created_by: &str,
    ) -> Result<(u64, bool), WeftError> {
        if key.is_empty() {
            return Err(WeftError::InvalidArgument("key must not be empty".into()));
        }
        let mut state = self.inner.write().expect("memory lock poisoned");
        if state.closed {
            return Err(WeftError::Unavailable("shared memory store is shut down".into()));
        }
        let slot = (namespace, key.to_string());
        let version = state.versions.get(&slot).copied().unwrap_or(0) + 1;
        state.versions.insert(slot.clone(), version);

        let created = !state.entries.contains_key(&slot);
        let creator = state
            .entries
            .get(&slot)
            .map(|existing| existing.created_by.clone())
            .unwrap_or_else(|| created_by.to_string());
        state.entries.insert(
            slot,
            SharedValue {
                namespace,
                key: key.to_string(),
                value: value.clone(),
                version,
                created_by: creator,
                updated_at: Utc::now(),
            },
        );
        self.write_count.fetch_add(1, Ordering::Relaxed);

        Self::notify_watchers(
            &state,
            SharedMemoryChange { namespace, key: key.to_string(), value, version, deleted: false },
        );
        debug!(namespace = %namespace, key, version, created, "shared value written");
        Ok((version, created))
    }

    /// Read one value.
    pub fn get(&self, namespace: SharedNamespace, key: &str) -> Option<SharedValue> {
        let state = self.inner.read().expect("memory lock poisoned");
        state.entries.get(&(namespace, key.to_string())).cloned()
    }

    /// Remove one value. Returns `true` when it existed.
    pub fn delete(&self, namespace: SharedNamespace, key: &str) -> bool {
        let mut state = self.inner.write().expect("memory lock poisoned");
        match state.entries.remove(&(namespace, key.to_string())) {
            Some(removed) => {
                Self::notify_watchers(
                    &state,
                    SharedMemoryChange {
                        namespace,
                        key: key.to_string(),
                        value: Vec::new(),
                        version: removed.version,
                        deleted: true,
                    },
                );
                true
            }
            None => false,
        }
    }

    /// Keys in a namespace, optionally filtered by prefix, together with the
    /// total live-key count across all namespaces. Order is unspecified.
    pub fn list(&self, namespace: SharedNamespace, key_prefix: Option<&str>) -> (Vec<String>, usize) {
        let state = self.inner.read().expect("memory lock poisoned");
        let keys = state
            .entries
            .keys()
            .filter(|(ns, key)| {
                *ns == namespace && key_prefix.map_or(true, |prefix| key.starts_with(prefix))
            })
            .map(|(_, key)| key.clone())
            .collect();
        (keys, state.entries.len())
    }

    /// Watch for changes to keys matching `key_pattern` (same glob grammar as
    /// bus topics), optionally restricted to one namespace. Returns the
    /// watcher id and its change channel; the channel closes only on store
    /// shutdown or [`unwatch`](Self::unwatch).
    pub fn watch(
        &self,
        namespace: Option<SharedNamespace>,
        key_pattern: &str,
    ) -> Result<(String, mpsc::Receiver<SharedMemoryChange>), WeftError> {
        if key_pattern.is_empty() {
            return Err(WeftError::InvalidArgument("key pattern must not be empty".into()));
        }
        let mut state = self.inner.write().expect("memory lock poisoned");
        if state.closed {
            return Err(WeftError::Unavailable("shared memory store is shut down".into()));
        }
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        state.watchers.insert(
            id.clone(),
            Watcher { namespace, key_pattern: key_pattern.to_string(), tx },
        );
        Ok((id, rx))
    }

    /// Drop one watcher, closing its channel.
    pub fn unwatch(&self, watcher_id: &str) {
        self.inner.write().expect("memory lock poisoned").watchers.remove(watcher_id);
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> MemoryStats {
        let state = self.inner.read().expect("memory lock poisoned");
        MemoryStats {
            key_count: state.entries.len() as u64,
            write_count: self.write_count.load(Ordering::Relaxed),
            total_bytes: state.entries.values().map(|v| v.value.len() as u64).sum(),
        }
    }

    /// Shut down: all watcher channels close and further writes fail.
    pub fn close(&self) {
        let mut state = self.inner.write().expect("memory lock poisoned");
        state.closed = true;
        state.watchers.clear();
    }

    fn notify_watchers(state: &MemState, change: SharedMemoryChange) {
        for watcher in state.watchers.values() {
            if let Some(ns) = watcher.namespace {
                if ns != change.namespace {
                    continue;
                }
            }
            if topic_matches(&watcher.key_pattern, &change.key) {
                // Drop-on-full; watchers must keep up or miss changes.
                let _ = watcher.tx.try_send(change.clone());
            }
        }
    }
}
