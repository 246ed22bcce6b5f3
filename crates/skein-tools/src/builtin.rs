use chrono::Utc;
use futures::future::BoxFuture;

use skein_core::error::Result;
use skein_core::traits::Tool;

// ── EchoTool ────────────────────────────────────────────────────

/// Returns its arguments unchanged.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echo the given arguments back."
    }
    fn execute(&self, args: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move { Ok(args) })
    }
}

// ── CurrentTimeTool ─────────────────────────────────────────────

pub struct CurrentTimeTool;

impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }
    fn description(&self) -> &str {
        "Current UTC date and time."
    }
    fn execute(&self, _args: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let now = Utc::now();
            Ok(serde_json::json!({
                "utc": now.to_rfc3339(),
                "unix": now.timestamp(),
            }))
        })
    }
}
