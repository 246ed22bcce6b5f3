use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// What an agent was doing when it handed work to a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTurn {
    pub agent_id: String,
    /// The user query the agent was answering.
    pub query: String,
    pub submitted_at: DateTime<Utc>,
}

impl PendingTurn {
    pub fn new(agent_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            query: query.into(),
            submitted_at: Utc::now(),
        }
    }
}

/// Request id -> originating agent turn.
///
/// Lives in process memory only. A completion whose entry is gone (restart,
/// eviction) is still surfaced, with a placeholder query.
#[derive(Default)]
pub struct Correlations {
    inner: Mutex<HashMap<String, PendingTurn>>,
}

impl Correlations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, request_id: impl Into<String>, turn: PendingTurn) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id.into(), turn);
    }

    pub fn get(&self, request_id: &str) -> Option<PendingTurn> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(request_id)
            .cloned()
    }

    /// Remove and return the entry for a request.
    pub fn take(&self, request_id: &str) -> Option<PendingTurn> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(request_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
