use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use skein_core::config::{EngineConfig, RateLimitConfig};
use skein_core::error::{Result, SkeinError};
use skein_core::event::EventBus;
use skein_core::traits::PersistenceStore;
use skein_core::types::{
    ConversationId, EngineEvent, GraphState, Message, MessageMetadata, Role, TaskOutcome,
    TaskStatus,
};
use skein_tools::ToolDispatcher;

use crate::correlation::Correlations;
use crate::graph::{Graph, NodeContext, NodeOutcome};
use crate::poller::ToolPoller;
use crate::state::StateManager;

const FALLBACK_REPLY: &str = "Sorry, something went wrong while handling that request.";

/// A branch that failed during a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchFailure {
    pub node_id: String,
    pub error: String,
}

/// Result of one `process_message` call.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Task label for the turn (`turn-<n>`).
    pub task: String,
    pub status: TaskStatus,
    pub waves: usize,
    /// Non-user messages appended during the turn.
    pub replies: Vec<Message>,
    pub failures: Vec<BranchFailure>,
}

pub struct EngineBuilder {
    graph: Graph,
    store: Arc<dyn PersistenceStore>,
    conversation_id: Option<String>,
    rate_limit: RateLimitConfig,
    max_waves: usize,
    tools: Option<Arc<ToolDispatcher>>,
    event_bus: Option<Arc<EventBus>>,
    default_agent: Option<String>,
}

impl EngineBuilder {
    pub fn conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn max_waves(mut self, max_waves: usize) -> Self {
        self.max_waves = max_waves;
        self
    }

    /// Agent that answers tool completions whose originating turn is unknown.
    pub fn default_agent(mut self, agent_id: Option<String>) -> Self {
        self.default_agent = agent_id;
        self
    }

    /// Apply the `[engine]` section.
    pub fn config(self, config: &EngineConfig) -> Self {
        self.rate_limit(config.rate_limit.clone())
            .max_waves(config.max_waves)
            .default_agent(config.default_agent.clone())
    }

    pub fn tools(mut self, tools: Arc<ToolDispatcher>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Validate the graph and load the conversation's last checkpoint, or
    /// start empty if there is none.
    pub async fn build(self) -> Result<Engine> {
        self.graph.validate()?;
        if self.max_waves == 0 {
            return Err(SkeinError::Config("max_waves must be at least 1".into()));
        }

        let conversation_id = self
            .conversation_id
            .unwrap_or_else(|| ConversationId::new().to_string());

        let state = match self.store.load_graph_state(&conversation_id).await? {
            Some(state) => {
                info!(
                    conversation_id = %conversation_id,
                    messages = state.messages.len(),
                    tasks = state.task_history.len(),
                    "Resumed conversation from checkpoint"
                );
                state
            }
            None => {
                debug!(conversation_id = %conversation_id, "Starting new conversation");
                GraphState::new(&conversation_id)
            }
        };

        Ok(Engine {
            graph: Arc::new(self.graph),
            state: Arc::new(StateManager::new(state, &self.rate_limit)),
            store: self.store,
            tools: self.tools,
            correlations: Arc::new(Correlations::new()),
            event_bus: self.event_bus.unwrap_or_default(),
            max_waves: self.max_waves,
            default_agent: self.default_agent,
            turn_lock: AsyncMutex::new(()),
        })
    }
}

/// Drives one conversation through the workflow graph.
///
/// Each user message is a task. Nodes run in waves: every node in the
/// current work set runs concurrently, their outcomes form the next set,
/// and state is checkpointed after each wave. A failing branch fails the
/// task but does not stop its siblings.
pub struct Engine {
    graph: Arc<Graph>,
    state: Arc<StateManager>,
    store: Arc<dyn PersistenceStore>,
    tools: Option<Arc<ToolDispatcher>>,
    correlations: Arc<Correlations>,
    event_bus: Arc<EventBus>,
    max_waves: usize,
    default_agent: Option<String>,
    turn_lock: AsyncMutex<()>,
}

impl Engine {
    pub fn builder(graph: Graph, store: Arc<dyn PersistenceStore>) -> EngineBuilder {
        EngineBuilder {
            graph,
            store,
            conversation_id: None,
            rate_limit: RateLimitConfig::default(),
            max_waves: EngineConfig::default().max_waves,
            tools: None,
            event_bus: None,
            default_agent: None,
        }
    }

    /// Open an existing conversation (or a new one under that id) with
    /// default settings.
    pub async fn resume(
        conversation_id: &str,
        graph: Graph,
        store: Arc<dyn PersistenceStore>,
    ) -> Result<Self> {
        Self::builder(graph, store)
            .conversation(conversation_id)
            .build()
            .await
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub fn conversation_id(&self) -> String {
        self.state.conversation_id()
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn tools(&self) -> Option<&Arc<ToolDispatcher>> {
        self.tools.as_ref()
    }

    pub fn correlations(&self) -> &Arc<Correlations> {
        &self.correlations
    }

    /// A poller that surfaces this conversation's tool completions, using
    /// the graph's agents for follow-ups and the engine's default agent
    /// for completions with no known origin. `None` without a dispatcher.
    pub fn tool_poller(&self) -> Option<ToolPoller> {
        let tools = self.tools.as_ref()?;
        Some(
            ToolPoller::new(
                tools.table().clone(),
                self.state.clone(),
                self.store.clone(),
                self.correlations.clone(),
                self.graph.agents(),
            )
            .with_event_bus(self.event_bus.clone())
            .with_notifications(tools.subscribe())
            .with_default_agent(self.default_agent.clone()),
        )
    }

    pub async fn rename(&self, title: &str) -> Result<()> {
        self.state.rename(title)?;
        self.checkpoint().await;
        Ok(())
    }

    /// Run one user message through the graph.
    ///
    /// Manager errors on the user message itself (blank input, rate limit)
    /// are returned before anything runs. Branch failures are isolated and
    /// reported in the outcome. Exceeding the wave limit fails the task and
    /// returns `SkeinError::Execution`.
    pub async fn process_message(&self, input: &str) -> Result<TurnOutcome> {
        let _turn = self.turn_lock.lock().await;
        let conversation_id = self.state.conversation_id();

        if let Some(task) = self.state.current_task() {
            warn!(conversation_id = %conversation_id, task = %task, "Previous task never finished");
            self.state.fail_task("interrupted before completion")?;
        }
        self.state.reset_task()?;

        let start = self.state.message_count();
        self.state
            .update_conversation(Role::User, input, MessageMetadata::default())?;

        let task = format!("turn-{}", self.state.task_count() + 1);
        self.state.set_task(&task)?;
        self.event_bus.publish(EngineEvent::TurnStarted {
            conversation_id: conversation_id.clone(),
            task: task.clone(),
        });

        let mut work = vec![self.graph.start().to_string()];
        let mut waves = 0;
        let mut failures = Vec::new();

        while !work.is_empty() {
            if waves >= self.max_waves {
                let message = format!(
                    "traversal did not finish within {} waves (pending: {})",
                    self.max_waves,
                    work.join(", ")
                );
                error!(conversation_id = %conversation_id, task = %task, "{}", message);
                if self.state.current_task().is_some() {
                    self.state.fail_task(&message)?;
                }
                self.checkpoint().await;
                self.event_bus.publish(EngineEvent::TurnCompleted {
                    conversation_id,
                    status: self.state.task_status(),
                    waves,
                });
                return Err(SkeinError::Execution(message));
            }
            waves += 1;

            let ctx = NodeContext {
                state: self.state.clone(),
                tools: self.tools.clone(),
                correlations: self.correlations.clone(),
                wave: waves,
            };
            let results = join_all(work.iter().map(|id| self.run_node(id, &ctx))).await;

            let mut next = Vec::new();
            for (node_id, result) in results {
                match result {
                    Ok(NodeOutcome::Continue) => {
                        next.extend(self.graph.successors(&node_id).iter().cloned())
                    }
                    Ok(NodeOutcome::Route(targets)) => next.extend(targets),
                    Ok(NodeOutcome::Halt) => {}
                    Err(e) => failures.push(self.isolate_failure(&node_id, &e)),
                }
            }

            debug!(wave = waves, nodes = ?work, next = ?next, "Wave finished");
            self.event_bus.publish(EngineEvent::WaveCompleted {
                wave: waves,
                nodes: work,
            });
            self.checkpoint().await;
            work = dedupe(next);
        }

        let replies: Vec<Message> = self
            .state
            .messages_since(start)
            .into_iter()
            .filter(|m| m.role != Role::User)
            .collect();
        if !replies.iter().any(|m| m.role == Role::Assistant) {
            let metadata = MessageMetadata::default().with_error(!failures.is_empty());
            if let Err(e) = self
                .state
                .update_conversation(Role::Assistant, FALLBACK_REPLY, metadata)
            {
                warn!(error = %e, "Could not record fallback reply");
            }
        }

        if self.state.current_task().is_some() {
            debug!(task = %task, "Traversal ended without a terminal node");
            let result = self.state.latest_assistant_content().unwrap_or_default();
            self.state.complete_task(&result)?;
        }

        self.checkpoint().await;
        let status = self.state.task_status();
        info!(
            conversation_id = %conversation_id,
            task = %task,
            status = %status,
            waves,
            failures = failures.len(),
            "Turn finished"
        );
        self.event_bus.publish(EngineEvent::TurnCompleted {
            conversation_id,
            status,
            waves,
        });

        Ok(TurnOutcome {
            task,
            status,
            waves,
            replies: self
                .state
                .messages_since(start)
                .into_iter()
                .filter(|m| m.role != Role::User)
                .collect(),
            failures,
        })
    }

    async fn run_node(&self, node_id: &str, ctx: &NodeContext) -> (String, Result<NodeOutcome>) {
        let Some(node) = self.graph.node(node_id) else {
            return (
                node_id.to_string(),
                Err(SkeinError::node(node_id, "node not found in graph")),
            );
        };
        debug!(node_id = %node_id, wave = ctx.wave, "Executing node");
        let result = node.execute(ctx).await.map_err(|e| match e {
            SkeinError::NodeExecution { .. } => e,
            other => SkeinError::node(node_id, other),
        });
        (node_id.to_string(), result)
    }

    /// Fail the task (if still active) and record the branch error, leaving
    /// sibling branches to run on.
    fn isolate_failure(&self, node_id: &str, err: &SkeinError) -> BranchFailure {
        let message = err.to_string();
        warn!(node_id = %node_id, error = %message, "Branch failed");

        if self.state.current_task().is_some() {
            if let Err(e) = self.state.fail_task(&message) {
                warn!(node_id = %node_id, error = %e, "Could not fail task");
            }
        }
        self.state
            .record_result(&format!("node:{}", node_id), TaskOutcome::error(&message));
        self.event_bus.publish(EngineEvent::NodeFailed {
            node_id: node_id.to_string(),
            error: message.clone(),
        });

        BranchFailure {
            node_id: node_id.to_string(),
            error: message,
        }
    }

    async fn checkpoint(&self) {
        let snapshot = self.state.snapshot();
        let conversation_id = snapshot.conversation_id().to_string();
        if let Err(e) = self
            .store
            .save_graph_state(&conversation_id, &snapshot)
            .await
        {
            error!(conversation_id = %conversation_id, error = %e, "Checkpoint failed");
            self.event_bus.publish(EngineEvent::CheckpointFailed {
                conversation_id,
                error: e.to_string(),
            });
        }
    }
}

/// Drop repeated ids, keeping first occurrences in order.
fn dedupe(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}
