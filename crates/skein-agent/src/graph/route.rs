use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use skein_core::types::GraphState;

/// A conditional route out of a control node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Route {
    /// Expression evaluated against the routing context.
    pub when: String,
    /// Node id to activate when the expression holds.
    pub to: String,
}

impl Route {
    pub fn new(when: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            when: when.into(),
            to: to.into(),
        }
    }

    pub fn matches(&self, context: &HashMap<String, serde_json::Value>) -> bool {
        evaluate_condition(&self.when, context)
    }
}

/// Flatten the parts of a state routes may look at.
///
/// Keys:
/// - `input`: latest user message
/// - `task_status`: current task status
/// - `task`: current task label, if any
/// - `<agent>_status`: each agent's `status` entry
pub fn route_context(state: &GraphState) -> HashMap<String, serde_json::Value> {
    let mut ctx = HashMap::new();
    if let Some(input) = state.latest_user_content() {
        ctx.insert("input".to_string(), serde_json::json!(input));
    }
    ctx.insert(
        "task_status".to_string(),
        serde_json::json!(state.status().to_string()),
    );
    if let Some(ref task) = state.current_task {
        ctx.insert("task".to_string(), serde_json::json!(task));
    }
    for (agent_id, agent_state) in &state.agent_states {
        if let Some(status) = agent_state.get("status") {
            ctx.insert(format!("{}_status", agent_id), status.clone());
        }
    }
    ctx
}

/// Evaluate a simple conditional expression against context data.
///
/// Supported expressions:
/// - `key == "value"`: exact match
/// - `key != "value"`: not equal
/// - `key contains "substr"`: case-insensitive substring match
///
/// Returns `false` for unparseable expressions and missing keys.
pub fn evaluate_condition(expr: &str, context: &HashMap<String, serde_json::Value>) -> bool {
    let expr = expr.trim();

    if let Some((key, substr)) = parse_operator(expr, " contains ") {
        return context
            .get(key)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s.to_lowercase().contains(&substr.to_lowercase()));
    }

    if let Some((key, value)) = parse_operator(expr, "!=") {
        return context
            .get(key)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s != value);
    }

    if let Some((key, value)) = parse_operator(expr, "==") {
        return context
            .get(key)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s == value);
    }

    false
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, val.trim().trim_matches('"')))
}
