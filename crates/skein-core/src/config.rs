use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SkeinError};

/// Top-level Skein configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub graph: Option<GraphConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on traversal waves per user message.
    #[serde(default = "default_max_waves")]
    pub max_waves: usize,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Agent used for tool follow-ups whose correlation was lost.
    #[serde(default)]
    pub default_agent: Option<String>,
    #[serde(default = "default_workspace")]
    pub workspace: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_waves: default_max_waves(),
            rate_limit: RateLimitConfig::default(),
            default_agent: None,
            workspace: default_workspace(),
        }
    }
}

/// Fixed-window limit on conversation updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_updates")]
    pub max_updates: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_updates: default_max_updates(),
            window_secs: default_window_secs(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// How tool completions reach the poller.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMode {
    /// Scan the request table on a fixed interval.
    #[default]
    Poll,
    /// Wake on executor notifications, with the interval as a fallback.
    Push,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub mode: CompletionMode,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Tool names exposed to agents (empty = all registered tools).
    #[serde(default)]
    pub enabled: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            mode: CompletionMode::default(),
            poll_interval_ms: default_poll_interval_ms(),
            enabled: vec![],
        }
    }
}

impl ToolsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite path. Default: <workspace>/skein.db
    #[serde(default)]
    pub path: Option<String>,
    /// Keep checkpoints in process memory only.
    #[serde(default)]
    pub in_memory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Per-agent settings. Unset fields fall back to `[model]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub model: Option<ModelConfig>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// Declarative workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    pub start: String,
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub edges: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Agent,
    Control,
    Terminal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub kind: NodeKind,
    /// Agent id for `agent` nodes (defaults to the node id).
    #[serde(default)]
    pub agent: Option<String>,
    /// Successor override for `agent` nodes.
    #[serde(default)]
    pub next: Vec<String>,
    /// Conditional routes for `control` nodes, first match wins.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// Targets a `control` node always fans out to.
    #[serde(default)]
    pub fan_out: Vec<String>,
    /// Target when no route matches.
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Expression such as `input contains "email"`.
    pub when: String,
    pub to: String,
}

fn default_max_waves() -> usize { 25 }
fn default_max_updates() -> u32 { 100 }
fn default_window_secs() -> u64 { 60 }
fn default_poll_interval_ms() -> u64 { 1000 }
fn default_workspace() -> String { "~/.skein".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| SkeinError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| SkeinError::Config(e.to_string()))
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.engine.workspace)
    }

    /// Resolve the SQLite checkpoint path.
    pub fn store_path(&self) -> PathBuf {
        match self.store.path {
            Some(ref p) => expand_home(p),
            None => self.workspace_dir().join("skein.db"),
        }
    }

    /// Model settings for an agent, falling back to `[model]`.
    pub fn model_for(&self, agent_id: &str) -> &ModelConfig {
        self.agents
            .get(agent_id)
            .and_then(|a| a.model.as_ref())
            .unwrap_or(&self.model)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_SKEIN_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_SKEIN_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_SKEIN_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_SKEIN_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_SKEIN_VAR}\"");
    }

    #[test]
    fn test_defaults_from_minimal_toml() {
        let toml_str = r#"
[model]
model_id = "gpt-4o-mini"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.max_waves, 25);
        assert_eq!(config.engine.rate_limit.max_updates, 100);
        assert_eq!(config.engine.rate_limit.window_secs, 60);
        assert_eq!(config.tools.mode, CompletionMode::Poll);
        assert_eq!(config.tools.poll_interval_ms, 1000);
        assert_eq!(config.model.provider, "openai");
        assert!(config.graph.is_none());
        assert!(!config.store.in_memory);
    }

    #[test]
    fn test_graph_section() {
        let toml_str = r#"
[model]
model_id = "gpt-4o-mini"

[graph]
start = "router"

[[graph.nodes]]
id = "router"
kind = "control"
fan_out = ["mail"]
default = "chat"

[[graph.nodes]]
id = "router2"
kind = "control"
routes = [{ when = 'input contains "calendar"', to = "cal" }]

[[graph.nodes]]
id = "chat"
kind = "agent"

[[graph.nodes]]
id = "end"
kind = "terminal"

[graph.edges]
chat = ["end"]
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        let graph = config.graph.unwrap();
        assert_eq!(graph.start, "router");
        assert_eq!(graph.nodes.len(), 4);
        assert_eq!(graph.nodes[0].kind, NodeKind::Control);
        assert_eq!(graph.nodes[0].fan_out, vec!["mail"]);
        assert_eq!(graph.nodes[1].routes[0].to, "cal");
        assert_eq!(graph.edges["chat"], vec!["end"]);
    }

    #[test]
    fn test_model_for_falls_back() {
        let toml_str = r#"
[model]
model_id = "base"

[agents.mail]
system_prompt = "You handle email."

[agents.research.model]
model_id = "big"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.model_for("mail").model_id, "base");
        assert_eq!(config.model_for("research").model_id, "big");
        assert_eq!(config.model_for("unknown").model_id, "base");
    }

    #[test]
    fn test_store_path_override() {
        let toml_str = r#"
[engine]
workspace = "/tmp/skein-ws"

[model]
model_id = "m"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.store_path(), PathBuf::from("/tmp/skein-ws/skein.db"));
    }
}
