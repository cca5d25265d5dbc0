//! In-memory workflow execution records.
//!
//! Status transitions are monotonic forward: once a record reaches a
//! terminal status its status, end time, and result never change. Retention
//! is capped so a long-lived server does not grow without bound; the oldest
//! *terminal* records are evicted first and running records are never
//! evicted.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::Utc;
use tracing::warn;

use weft_types::{ExecutionStatus, WorkflowExecution};

/// Terminal records retained before eviction kicks in.
pub const DEFAULT_EXECUTION_RETENTION: usize = 1000;

#[derive(Default)]
struct ExecState {
    records: HashMap<String, WorkflowExecution>,
    order: VecDeque<String>,
}

/// Store of [`WorkflowExecution`] records.
pub struct ExecutionStore {
    inner: RwLock<ExecState>,
    retention: usize,
}

impl Default for ExecutionStore {
    fn default() -> Self {
        Self::new(DEFAULT_EXECUTION_RETENTION)
    }
}

impl ExecutionStore {
    /// Create a store retaining at most `retention` records.
    pub fn new(retention: usize) -> Self {
        Self { inner: RwLock::new(ExecState::default()), retention: retention.max(1) }
    }

    /// Record a new running execution.
    pub fn begin(&self, execution_id: &str, pattern_name: &str) -> WorkflowExecution {
        let record = WorkflowExecution {
            execution_id: execution_id.to_string(),
            pattern_name: pattern_name.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            status: ExecutionStatus::Running,
            error: None,
            result: None,
        };
        let mut state = self.inner.write().expect("execution lock poisoned");
        state.records.insert(record.execution_id.clone(), record.clone());
        state.order.push_back(record.execution_id.clone());
        Self::evict(&mut state, self.retention);
        record
    }

    /// Move an execution to a terminal status. Returns `false` (leaving the
    /// record untouched) when the record is unknown or already terminal.
    pub fn finish(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<String>,
        result: Option<serde_json::Value>,
    ) -> bool {
        if !status.is_terminal() {
            return false;
        }
        let mut state = self.inner.write().expect("execution lock poisoned");
        let Some(record) = state.records.get_mut(execution_id) else {
            warn!(execution = %execution_id, "finish for unknown execution");
            return false;
        };
        if record.status.is_terminal() {
            return false;
        }
        record.status = status;
        record.finished_at = Some(Utc::now());
        record.error = error;
        record.result = result;
        true
    }

    /// Load one record.
    pub fn get(&self, execution_id: &str) -> Option<WorkflowExecution> {
        self.inner.read().expect("execution lock poisoned").records.get(execution_id).cloned()
    }

    /// All retained records in insertion order.
    pub fn list(&self) -> Vec<WorkflowExecution> {
        let state = self.inner.read().expect("execution lock poisoned");
        state.order.iter().filter_map(|id| state.records.get(id).cloned()).collect()
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.inner.read().expect("execution lock poisoned").records.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(state: &mut ExecState, retention: usize) {
        while state.records.len() > retention {
            let Some(pos) = state
                .order
                .iter()
                .position(|id| state.records.get(id).is_some_and(|r| r.status.is_terminal()))
            else {
                break;
            };
            if let Some(id) = state.order.remove(pos) {
                state.records.remove(&id);
            }
        }
    }
}
