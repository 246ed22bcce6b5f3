use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use skein_core::config::{CompletionMode, ToolsConfig};
use skein_core::error::Result;
use skein_core::event::EventBus;
use skein_core::traits::{Agent, PersistenceStore};
use skein_core::types::{
    AgentState, EngineEvent, MessageMetadata, Role, ToolRequestRecord, ToolRequestStatus,
};
use skein_tools::ToolRequestTable;

use crate::correlation::Correlations;
use crate::state::StateManager;

/// Query used for follow-ups whose originating turn is unknown.
pub const PLACEHOLDER_QUERY: &str = "(original request unavailable)";

/// A completion that was surfaced into the conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub request_id: String,
    pub tool_name: String,
    pub agent_id: Option<String>,
    pub is_error: bool,
    /// The correlation entry was missing and a placeholder was used.
    pub recovered: bool,
}

/// Background reconciler for out-of-band tool results.
///
/// Each cycle scans the request table for terminal records owned by this
/// conversation, claims them, and appends the tool result plus an agent
/// follow-up. Claiming is a compare-and-swap on the record, so concurrent
/// pollers never surface the same completion twice.
pub struct ToolPoller {
    table: Arc<ToolRequestTable>,
    state: Arc<StateManager>,
    store: Arc<dyn PersistenceStore>,
    correlations: Arc<Correlations>,
    agents: HashMap<String, Arc<dyn Agent>>,
    default_agent: Option<String>,
    event_bus: Option<Arc<EventBus>>,
    notices: Option<broadcast::Receiver<String>>,
    mode: CompletionMode,
    interval: Duration,
}

impl ToolPoller {
    pub fn new(
        table: Arc<ToolRequestTable>,
        state: Arc<StateManager>,
        store: Arc<dyn PersistenceStore>,
        correlations: Arc<Correlations>,
        agents: HashMap<String, Arc<dyn Agent>>,
    ) -> Self {
        let tools = ToolsConfig::default();
        Self {
            table,
            state,
            store,
            correlations,
            agents,
            default_agent: None,
            event_bus: None,
            notices: None,
            mode: tools.mode,
            interval: tools.poll_interval(),
        }
    }

    /// Agent used when a completion's correlation entry is missing.
    pub fn with_default_agent(mut self, agent_id: Option<String>) -> Self {
        self.default_agent = agent_id;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Completion notices from the dispatcher, used in push mode.
    pub fn with_notifications(mut self, notices: broadcast::Receiver<String>) -> Self {
        self.notices = Some(notices);
        self
    }

    pub fn with_config(mut self, config: &ToolsConfig) -> Self {
        self.mode = config.mode;
        self.interval = config.poll_interval();
        self
    }

    /// Run until cancelled. In push mode a completion notice triggers an
    /// immediate scan; the interval still applies as a fallback.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            mode = ?self.mode,
            interval_ms = self.interval.as_millis() as u64,
            "Tool poller started"
        );
        let mut notices = match self.mode {
            CompletionMode::Push => self.notices.take(),
            CompletionMode::Poll => None,
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Tool poller shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {}
                _ = next_notice(&mut notices) => {}
            }

            if let Err(e) = self.poll_once().await {
                warn!(error = %e, "Tool poll cycle failed");
            }
        }
    }

    /// Reconcile every terminal, unclaimed record for this conversation.
    ///
    /// Returns the completions surfaced by this call. The state is
    /// checkpointed when anything changed.
    pub async fn poll_once(&self) -> Result<Vec<Reconciled>> {
        let owner = self.state.conversation_id();
        let ready = self.table.terminal_unprocessed(Some(&owner));
        if ready.is_empty() {
            return Ok(vec![]);
        }

        let mut done = Vec::new();
        for record in ready {
            if !self.table.claim(&record.request_id) {
                debug!(request_id = %record.request_id, "Already claimed elsewhere");
                continue;
            }
            let request_id = record.request_id.clone();
            match self.reconcile(record).await {
                Ok(reconciled) => done.push(reconciled),
                Err(e) => {
                    // Nothing was written; let a later pass retry.
                    self.table.release(&request_id);
                    error!(request_id = %request_id, error = %e, "Could not surface tool result")
                }
            }
        }

        if !done.is_empty() {
            let snapshot = self.state.snapshot();
            self.store.save_graph_state(&owner, &snapshot).await?;
        }
        Ok(done)
    }

    async fn reconcile(&self, record: ToolRequestRecord) -> Result<Reconciled> {
        let request_id = record.request_id.clone();
        let is_error = record.status == ToolRequestStatus::Error;

        let (agent_id, query, recovered) = match self.correlations.get(&request_id) {
            Some(turn) => (Some(turn.agent_id), turn.query, false),
            None => {
                warn!(
                    request_id = %request_id,
                    tool = %record.tool_name,
                    "No correlation for completed request, using placeholder"
                );
                (self.fallback_agent(), PLACEHOLDER_QUERY.to_string(), true)
            }
        };

        let body = render_response(&record);
        let mut metadata = MessageMetadata::default()
            .with_request(&request_id, &record.tool_name)
            .with_error(is_error);
        metadata.agent_id = agent_id.clone();

        let follow_up = self
            .follow_up(agent_id.as_deref(), &query, &record, &body)
            .await;
        let tool_text = format!("{} {}: {}", record.tool_name, record.status, body);
        self.state.update_conversation_batch(vec![
            (Role::Tool, tool_text.as_str(), metadata.clone()),
            (
                Role::Assistant,
                follow_up.as_str(),
                metadata.with_extra("follow_up", serde_json::json!(true)),
            ),
        ])?;
        self.correlations.take(&request_id);

        if let Some(ref agent_id) = agent_id {
            let mut partial = AgentState::new();
            partial.insert("status".into(), serde_json::json!("responded"));
            if let Err(e) = self.state.update_agent_state(agent_id, partial) {
                warn!(agent_id = %agent_id, error = %e, "Could not update agent status");
            }
        }

        self.table.remove(&request_id);
        info!(request_id = %request_id, tool = %record.tool_name, recovered, "Tool result surfaced");
        if let Some(ref bus) = self.event_bus {
            bus.publish(EngineEvent::ToolReconciled {
                request_id: request_id.clone(),
                recovered,
            });
        }

        Ok(Reconciled {
            request_id,
            tool_name: record.tool_name,
            agent_id,
            is_error,
            recovered,
        })
    }

    /// Ask the agent to turn the raw result into a reply. Falls back to a
    /// plain summary when no agent is available or the agent fails.
    async fn follow_up(
        &self,
        agent_id: Option<&str>,
        query: &str,
        record: &ToolRequestRecord,
        body: &str,
    ) -> String {
        let verb = if record.status == ToolRequestStatus::Error {
            "failed"
        } else {
            "finished"
        };
        let summary = format!("The {} request {}: {}", record.tool_name, verb, body);

        let Some(agent) = agent_id.and_then(|id| self.agents.get(id)) else {
            return summary;
        };

        let prompt = format!(
            "{}\n\nThe {} tool {} with this result:\n{}\n\nUse it to answer the request above.",
            query, record.tool_name, verb, body
        );
        match agent.chat(&prompt).await {
            Ok(reply) if !reply.trim().is_empty() => reply,
            Ok(_) => summary,
            Err(e) => {
                warn!(request_id = %record.request_id, error = %e, "Follow-up failed");
                summary
            }
        }
    }

    fn fallback_agent(&self) -> Option<String> {
        if let Some(ref id) = self.default_agent {
            if self.agents.contains_key(id) {
                return Some(id.clone());
            }
        }
        let mut ids: Vec<&String> = self.agents.keys().collect();
        ids.sort();
        ids.first().map(|id| id.to_string())
    }
}

async fn next_notice(notices: &mut Option<broadcast::Receiver<String>>) {
    let closed = match notices {
        Some(rx) => matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)),
        None => return futures::future::pending().await,
    };
    if closed {
        *notices = None;
    }
}

fn render_response(record: &ToolRequestRecord) -> String {
    match record.response {
        Some(serde_json::Value::String(ref s)) => s.clone(),
        Some(serde_json::Value::Object(ref map)) if record.status == ToolRequestStatus::Error => map
            .get("error")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| serde_json::Value::Object(map.clone()).to_string()),
        Some(ref other) => other.to_string(),
        None => "(no response)".to_string(),
    }
}
