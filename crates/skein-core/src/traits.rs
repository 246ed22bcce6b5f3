use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::GraphState;

/// Conversational agent: turns a prompt into a reply.
///
/// Prompt construction and model access live behind this trait; the engine
/// only inspects the reply for a tool call.
pub trait Agent: Send + Sync + 'static {
    fn chat(&self, prompt: &str) -> BoxFuture<'_, Result<String>>;
}

/// Persistence backend for graph state checkpoints.
pub trait PersistenceStore: Send + Sync + 'static {
    /// Save (overwrite) the checkpoint for a conversation.
    fn save_graph_state<'a>(
        &'a self,
        conversation_id: &'a str,
        state: &'a GraphState,
    ) -> BoxFuture<'a, Result<()>>;

    /// Load the latest checkpoint, `None` if the conversation is unknown.
    fn load_graph_state<'a>(
        &'a self,
        conversation_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<GraphState>>>;
}

/// Out-of-band tool execution.
pub trait ToolExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        tool_name: &str,
        args: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;
}

/// A single named capability a `ToolExecutor` can dispatch to.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in agent tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Execute the tool with the given arguments.
    fn execute(&self, args: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>>;
}
