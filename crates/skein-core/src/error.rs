use thiserror::Error;

use crate::types::TaskStatus;

#[derive(Debug, Error)]
pub enum SkeinError {
    // State errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("State update rejected: {0}")]
    StateUpdate(String),

    #[error("Illegal task transition: {from} -> {to}")]
    StateTransition { from: TaskStatus, to: TaskStatus },

    #[error("State error: {0}")]
    State(String),

    // Graph errors
    #[error("Node execution failed: {node}: {message}")]
    NodeExecution { node: String, message: String },

    #[error("Execution aborted: {0}")]
    Execution(String),

    // Agent errors
    #[error("Agent error: {0}")]
    Agent(String),

    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool request not found: {0}")]
    RequestNotFound(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SkeinError {
    /// Wrap any error raised inside a node so the branch can be isolated.
    pub fn node(node: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::NodeExecution {
            node: node.into(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SkeinError>;
