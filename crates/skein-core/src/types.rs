use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique conversation identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// Metadata attached to a message.
///
/// The well-known fields are typed; anything else lands in `extra` and is
/// flattened on the wire so older and newer writers stay compatible.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MessageMetadata {
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..Default::default()
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_request(mut self, request_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn with_error(mut self, is_error: bool) -> Self {
        self.is_error = is_error;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// A single message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>, metadata: MessageMetadata) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
            metadata,
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.metadata.agent_id.as_deref()
    }
}

/// Lifecycle of the conversation's current task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Free-form per-agent state. Must carry a `status` entry.
pub type AgentState = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationState {
    pub conversation_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub messages: Vec<Message>,
    pub last_updated: DateTime<Utc>,
    pub current_task_status: TaskStatus,
}

impl ConversationState {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            title: None,
            messages: Vec::new(),
            last_updated: Utc::now(),
            current_task_status: TaskStatus::Pending,
        }
    }
}

/// A task label stamped with the time it was started.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub label: String,
    pub started_at: DateTime<Utc>,
}

/// Outcome recorded for a task label or a failed branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success { result: String },
    Error { error: String },
}

impl TaskOutcome {
    pub fn success(result: impl Into<String>) -> Self {
        Self::Success {
            result: result.into(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn result(&self) -> Option<&str> {
        match self {
            Self::Success { result } => Some(result),
            Self::Error { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error { error } => Some(error),
            Self::Success { .. } => None,
        }
    }
}

/// The full state of one conversation session.
///
/// `messages` mirrors `conversation_state.messages`; both are appended
/// together by the state manager and never diverge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphState {
    pub messages: Vec<Message>,
    pub conversation_state: ConversationState,
    #[serde(default)]
    pub agent_states: HashMap<String, AgentState>,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub task_history: Vec<TaskRecord>,
    #[serde(default)]
    pub agent_results: HashMap<String, TaskOutcome>,
    #[serde(default)]
    pub final_result: Option<String>,
}

impl GraphState {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            messages: Vec::new(),
            conversation_state: ConversationState::new(conversation_id),
            agent_states: HashMap::new(),
            current_task: None,
            task_history: Vec::new(),
            agent_results: HashMap::new(),
            final_result: None,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_state.conversation_id
    }

    pub fn status(&self) -> TaskStatus {
        self.conversation_state.current_task_status
    }

    /// Content of the most recent user message, if any.
    pub fn latest_user_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    /// Content of the most recent assistant message, if any.
    pub fn latest_assistant_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }
}

/// Counters exposed by the state manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ErrorStats {
    pub error_count: u64,
    pub update_count: u64,
}

/// Status of an out-of-band tool request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolRequestStatus {
    Pending,
    Completed,
    Error,
}

impl ToolRequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ToolRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A tool call submitted for asynchronous execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolRequestRecord {
    pub request_id: String,
    pub tool_name: String,
    pub args: serde_json::Value,
    pub status: ToolRequestStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub response: Option<serde_json::Value>,
    #[serde(default)]
    pub processed_by_owner: bool,
    /// Conversation that submitted the request.
    #[serde(default)]
    pub owner: Option<String>,
}

impl ToolRequestRecord {
    pub fn new(tool_name: impl Into<String>, args: serde_json::Value, owner: Option<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            args,
            status: ToolRequestStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            response: None,
            processed_by_owner: false,
            owner,
        }
    }
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A user turn started.
    TurnStarted { conversation_id: String, task: String },
    /// One wave of node executions finished.
    WaveCompleted { wave: usize, nodes: Vec<String> },
    /// A branch failed and was isolated.
    NodeFailed { node_id: String, error: String },
    /// A user turn finished.
    TurnCompleted {
        conversation_id: String,
        status: TaskStatus,
        waves: usize,
    },
    /// A tool call was handed to the executor.
    ToolSubmitted { request_id: String, tool_name: String },
    /// The executor wrote a terminal result.
    ToolCompleted { request_id: String, is_error: bool },
    /// A completion was surfaced back into the conversation.
    ToolReconciled { request_id: String, recovered: bool },
    /// Saving a checkpoint failed.
    CheckpointFailed { conversation_id: String, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_extra_is_flattened() {
        let meta = MessageMetadata::for_agent("mail")
            .with_extra("thread", serde_json::json!("t-42"));
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["agent_id"], "mail");
        assert_eq!(json["thread"], "t-42");
        assert!(json.get("is_error").is_none());

        let parsed: MessageMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn unknown_metadata_fields_survive() {
        let parsed: MessageMetadata =
            serde_json::from_str(r#"{"node_id":"n1","priority":3}"#).unwrap();
        assert_eq!(parsed.node_id.as_deref(), Some("n1"));
        assert_eq!(parsed.extra.get("priority"), Some(&serde_json::json!(3)));
    }

    #[test]
    fn task_outcome_tagging() {
        let ok = TaskOutcome::success("done");
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["outcome"], "success");
        assert_eq!(ok.result(), Some("done"));

        let err = TaskOutcome::error("bad");
        assert!(err.is_error());
        assert_eq!(err.error_message(), Some("bad"));
    }

    #[test]
    fn latest_user_content_skips_assistant() {
        let mut state = GraphState::new("c1");
        state
            .messages
            .push(Message::new(Role::User, "first", MessageMetadata::default()));
        state
            .messages
            .push(Message::new(Role::Assistant, "reply", MessageMetadata::default()));
        assert_eq!(state.latest_user_content(), Some("first"));
        assert_eq!(state.latest_assistant_content(), Some("reply"));
    }

    #[test]
    fn tool_request_starts_pending() {
        let rec = ToolRequestRecord::new("echo", serde_json::json!({}), Some("c1".into()));
        assert_eq!(rec.status, ToolRequestStatus::Pending);
        assert!(!rec.status.is_terminal());
        assert!(!rec.processed_by_owner);
        assert!(!rec.request_id.is_empty());
    }
}
