use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A tool invocation requested by an agent reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default = "empty_args")]
    pub args: serde_json::Value,
}

fn empty_args() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

fn fenced_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced block pattern is valid")
    })
}

/// Detect a tool call in an agent reply.
///
/// Accepted shapes:
/// - the whole reply is a JSON object `{"tool": "...", "args": {...}}`
/// - a fenced ```json block containing such an object
///
/// `args` must be a JSON object when present. Anything else is plain text.
pub fn detect_tool_call(reply: &str) -> Option<ToolCall> {
    let trimmed = reply.trim();
    if trimmed.starts_with('{') {
        if let Some(call) = parse_call(trimmed) {
            return Some(call);
        }
    }

    fenced_block()
        .captures_iter(reply)
        .filter_map(|caps| caps.get(1))
        .find_map(|m| parse_call(m.as_str()))
}

fn parse_call(candidate: &str) -> Option<ToolCall> {
    let call: ToolCall = serde_json::from_str(candidate).ok()?;
    if call.tool.trim().is_empty() || !call.args.is_object() {
        return None;
    }
    Some(call)
}

/// Instructions appended to agent system prompts so replies use the
/// shape `detect_tool_call` understands.
pub fn tool_call_instructions(tool_names: &[String]) -> String {
    if tool_names.is_empty() {
        return String::new();
    }
    format!(
        "You can call one tool per reply. To call a tool, reply with ONLY a JSON object \
         of the form {{\"tool\": \"<name>\", \"args\": {{...}}}}. Tool results arrive later \
         as a separate message. Available tools: {}.",
        tool_names.join(", ")
    )
}
