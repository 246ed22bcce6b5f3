//! Mocks and fixtures shared by the Skein crates' tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use skein_core::config::AppConfig;
use skein_core::error::{Result, SkeinError};
use skein_core::traits::{Agent, ToolExecutor};

// ── Agents ──────────────────────────────────────────────────────

/// Replies from a fixed script, repeating the last line once exhausted.
/// Every prompt it receives is recorded.
pub struct ScriptedAgent {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedAgent {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            last: Mutex::new("ok".to_string()),
            prompts: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// A single reply, repeated forever.
    pub fn always(reply: impl Into<String>) -> Self {
        Self::new([reply.into()])
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

impl Agent for ScriptedAgent {
    fn chat(&self, prompt: &str) -> BoxFuture<'_, Result<String>> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let reply = {
            let mut last = self.last.lock().unwrap();
            if let Some(next) = self.replies.lock().unwrap().pop_front() {
                *last = next;
            }
            last.clone()
        };
        let delay = self.delay;
        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            Ok(reply)
        })
    }
}

/// Always fails.
pub struct FailingAgent {
    message: String,
    calls: AtomicUsize,
}

impl FailingAgent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Agent for FailingAgent {
    fn chat(&self, _prompt: &str) -> BoxFuture<'_, Result<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let message = self.message.clone();
        Box::pin(async move { Err(SkeinError::Agent(message)) })
    }
}

/// Reply text an agent would produce to request a tool call.
pub fn tool_call_reply(tool: &str, args: serde_json::Value) -> String {
    serde_json::json!({ "tool": tool, "args": args }).to_string()
}

// ── Tool executors ──────────────────────────────────────────────

/// Completes immediately with `{"tool": name, "args": args}`.
pub struct EchoExecutor;

impl ToolExecutor for EchoExecutor {
    fn execute(
        &self,
        tool_name: &str,
        args: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        let tool = tool_name.to_string();
        Box::pin(async move { Ok(serde_json::json!({ "tool": tool, "args": args })) })
    }
}

/// Fails every call.
pub struct FailingExecutor;

impl ToolExecutor for FailingExecutor {
    fn execute(
        &self,
        tool_name: &str,
        _args: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        let tool = tool_name.to_string();
        Box::pin(async move {
            Err(SkeinError::ToolExecution {
                tool,
                message: "service unavailable".into(),
            })
        })
    }
}

/// Never completes; tests drive the request table by hand.
pub struct PendingExecutor;

impl ToolExecutor for PendingExecutor {
    fn execute(
        &self,
        _tool_name: &str,
        _args: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(futures::future::pending())
    }
}

// ── Fixtures ────────────────────────────────────────────────────

/// Minimal parsed config.
pub fn test_config() -> AppConfig {
    toml::from_str(
        r#"
[model]
model_id = "test-model"
"#,
    )
    .expect("fixture config parses")
}

/// Temporary directory that lives as long as the returned guard.
pub fn temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("create temp dir")
}
