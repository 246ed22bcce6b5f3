use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use skein_core::error::{Result, SkeinError};
use skein_core::traits::PersistenceStore;
use skein_core::types::GraphState;

/// Process-local checkpoint store.
///
/// States are kept serialized so a load always returns an independent copy,
/// the same as reading back from SQLite.
#[derive(Default)]
pub struct MemoryStore {
    states: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistenceStore for MemoryStore {
    fn save_graph_state<'a>(
        &'a self,
        conversation_id: &'a str,
        state: &'a GraphState,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let json = serde_json::to_string(state)?;
            self.states
                .lock()
                .map_err(|e| SkeinError::Database(e.to_string()))?
                .insert(conversation_id.to_string(), json);
            Ok(())
        })
    }

    fn load_graph_state<'a>(
        &'a self,
        conversation_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<GraphState>>> {
        Box::pin(async move {
            let json = self
                .states
                .lock()
                .map_err(|e| SkeinError::Database(e.to_string()))?
                .get(conversation_id)
                .cloned();
            match json {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
    }
}
