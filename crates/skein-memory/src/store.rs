use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use skein_core::error::{Result, SkeinError};
use skein_core::traits::PersistenceStore;
use skein_core::types::GraphState;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS graph_states (
        conversation_id TEXT PRIMARY KEY,
        title TEXT,
        state_json TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_graph_states_updated
        ON graph_states(updated_at DESC);";

/// A stored conversation, without its state.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub title: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed checkpoint store. One row per conversation holding the
/// latest `GraphState` as JSON.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SkeinError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SkeinError::Database(e.to_string()))
    }

    /// Stored conversations, most recently updated first.
    pub fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT conversation_id, title, updated_at FROM graph_states
                 ORDER BY updated_at DESC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let title: Option<String> = row.get(1)?;
                let ts_str: String = row.get(2)?;
                Ok((id, title, ts_str))
            })
            .map_err(db_err)?;

        let mut out = Vec::new();
        for row in rows {
            let (conversation_id, title, ts_str) = row.map_err(db_err)?;
            let updated_at = DateTime::parse_from_rfc3339(&ts_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            out.push(ConversationSummary {
                conversation_id,
                title,
                updated_at,
            });
        }
        Ok(out)
    }

    /// Set the title column and the title inside the stored state.
    /// Returns `false` if the conversation is unknown.
    pub fn rename(&self, conversation_id: &str, title: &str) -> Result<bool> {
        let conn = self.lock()?;
        let state_json: Option<String> = conn
            .query_row(
                "SELECT state_json FROM graph_states WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let Some(state_json) = state_json else {
            return Ok(false);
        };

        let mut state: GraphState = serde_json::from_str(&state_json)?;
        state.conversation_state.title = Some(title.to_string());
        conn.execute(
            "UPDATE graph_states SET title = ?2, state_json = ?3 WHERE conversation_id = ?1",
            params![conversation_id, title, serde_json::to_string(&state)?],
        )
        .map_err(db_err)?;
        Ok(true)
    }

    /// Returns `true` if a row was deleted.
    pub fn delete(&self, conversation_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn
            .execute(
                "DELETE FROM graph_states WHERE conversation_id = ?1",
                params![conversation_id],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }
}

impl PersistenceStore for SqliteStore {
    fn save_graph_state<'a>(
        &'a self,
        conversation_id: &'a str,
        state: &'a GraphState,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let state_json = serde_json::to_string(state)?;
            let title = state.conversation_state.title.clone();
            let updated_at = state.conversation_state.last_updated.to_rfc3339();

            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO graph_states (conversation_id, title, state_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                     title = excluded.title,
                     state_json = excluded.state_json,
                     updated_at = excluded.updated_at",
                params![conversation_id, title, state_json, updated_at],
            )
            .map_err(db_err)?;

            debug!(
                conversation_id = %conversation_id,
                messages = state.messages.len(),
                "Checkpoint saved"
            );
            Ok(())
        })
    }

    fn load_graph_state<'a>(
        &'a self,
        conversation_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<GraphState>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let state_json: Option<String> = conn
                .query_row(
                    "SELECT state_json FROM graph_states WHERE conversation_id = ?1",
                    params![conversation_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            match state_json {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
    }
}

fn db_err(e: rusqlite::Error) -> SkeinError {
    SkeinError::Database(e.to_string())
}
