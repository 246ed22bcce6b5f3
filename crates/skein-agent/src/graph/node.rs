use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info};

use skein_core::error::{Result, SkeinError};
use skein_core::toolcall::detect_tool_call;
use skein_core::traits::Agent;
use skein_core::types::{AgentState, MessageMetadata, Role};
use skein_tools::ToolDispatcher;

use super::route::{route_context, Route};
use crate::correlation::{Correlations, PendingTurn};
use crate::state::StateManager;

/// What the engine should activate after a node ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Follow the node's static edges.
    Continue,
    /// Activate exactly these node ids (an empty list ends the branch).
    Route(Vec<String>),
    /// End this branch.
    Halt,
}

/// Everything a node may touch while it runs.
pub struct NodeContext {
    pub state: Arc<StateManager>,
    pub tools: Option<Arc<ToolDispatcher>>,
    pub correlations: Arc<Correlations>,
    /// 1-based wave number within the current turn.
    pub wave: usize,
}

/// A unit of work in the workflow graph.
pub trait Node: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn execute<'a>(&'a self, ctx: &'a NodeContext) -> BoxFuture<'a, Result<NodeOutcome>>;

    /// The agent behind this node, if it wraps one.
    fn agent(&self) -> Option<(&str, Arc<dyn Agent>)> {
        None
    }
}

/// Runs one agent against the latest user message.
///
/// A reply carrying a tool call is submitted to the dispatcher and answered
/// with an acknowledgement; the tool result shows up later through the
/// poller. Any other reply is recorded as the agent's answer.
pub struct AgentNode {
    id: String,
    agent_id: String,
    agent: Arc<dyn Agent>,
    next: Option<Vec<String>>,
}

impl AgentNode {
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            agent,
            next: None,
        }
    }

    /// Override the static edges with an explicit successor list.
    pub fn with_next(mut self, next: Vec<String>) -> Self {
        self.next = Some(next);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn run(&self, ctx: &NodeContext) -> Result<NodeOutcome> {
        let prompt = ctx
            .state
            .latest_user_content()
            .ok_or_else(|| SkeinError::node(&self.id, "no user message to answer"))?;

        self.set_status(ctx, "working")?;
        let reply = match self.agent.chat(&prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                // Best effort; the failure itself is what matters.
                let _ = self.set_status(ctx, "error");
                return Err(SkeinError::node(&self.id, e));
            }
        };

        let metadata = MessageMetadata::for_agent(&self.agent_id).with_node(&self.id);
        match detect_tool_call(&reply) {
            Some(call) => {
                let tools = ctx.tools.as_ref().ok_or_else(|| {
                    SkeinError::node(
                        &self.id,
                        format!("agent asked for tool '{}' but no tools are configured", call.tool),
                    )
                })?;

                let owner = ctx.state.conversation_id();
                let request_id = tools.submit(&call.tool, call.args.clone(), Some(owner));
                ctx.correlations
                    .insert(request_id.clone(), PendingTurn::new(&self.agent_id, &prompt));
                info!(
                    node_id = %self.id,
                    agent_id = %self.agent_id,
                    tool = %call.tool,
                    request_id = %request_id,
                    "Agent handed off to tool"
                );

                let ack = format!(
                    "Working on it: running {} in the background. I'll follow up when it finishes.",
                    call.tool
                );
                ctx.state
                    .update_conversation(
                        Role::Assistant,
                        &ack,
                        metadata
                            .with_request(&request_id, &call.tool)
                            .with_extra("pending", serde_json::json!(true)),
                    )
                    .map_err(|e| SkeinError::node(&self.id, e))?;
                self.set_status(ctx, "awaiting_tool")?;
            }
            None => {
                ctx.state
                    .update_conversation(Role::Assistant, &reply, metadata)
                    .map_err(|e| SkeinError::node(&self.id, e))?;
                self.set_status(ctx, "responded")?;
                debug!(node_id = %self.id, chars = reply.len(), "Agent replied");
            }
        }

        Ok(match self.next {
            Some(ref next) => NodeOutcome::Route(next.clone()),
            None => NodeOutcome::Continue,
        })
    }

    fn set_status(&self, ctx: &NodeContext, status: &str) -> Result<()> {
        let mut partial = AgentState::new();
        partial.insert("status".into(), serde_json::json!(status));
        partial.insert("last_node".into(), serde_json::json!(self.id));
        ctx.state
            .update_agent_state(&self.agent_id, partial)
            .map_err(|e| SkeinError::node(&self.id, e))
    }
}

impl Node for AgentNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn execute<'a>(&'a self, ctx: &'a NodeContext) -> BoxFuture<'a, Result<NodeOutcome>> {
        Box::pin(self.run(ctx))
    }

    fn agent(&self) -> Option<(&str, Arc<dyn Agent>)> {
        Some((&self.agent_id, self.agent.clone()))
    }
}

type RoutingFn = dyn Fn(&skein_core::types::GraphState) -> Vec<String> + Send + Sync;

/// Pure routing: reads a state snapshot and names the next nodes.
///
/// Returning several ids fans out; returning none ends the branch.
pub struct ControlNode {
    id: String,
    routing: Box<RoutingFn>,
}

impl ControlNode {
    pub fn new<F>(id: impl Into<String>, routing: F) -> Self
    where
        F: Fn(&skein_core::types::GraphState) -> Vec<String> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            routing: Box::new(routing),
        }
    }

    /// Declarative router: `fan_out` targets always fire, then the first
    /// matching route, else `default`.
    pub fn from_routes(
        id: impl Into<String>,
        routes: Vec<Route>,
        fan_out: Vec<String>,
        default: Option<String>,
    ) -> Self {
        Self::new(id, move |state| {
            let ctx = route_context(state);
            let mut targets = fan_out.clone();
            match routes.iter().find(|r| r.matches(&ctx)) {
                Some(route) => targets.push(route.to.clone()),
                None => targets.extend(default.iter().cloned()),
            }
            targets
        })
    }

    /// Every node id this router could ever name, when declared with
    /// `from_routes`. Closures are opaque, so this is supplied separately.
    pub fn declared_targets(
        routes: &[Route],
        fan_out: &[String],
        default: Option<&String>,
    ) -> Vec<String> {
        routes
            .iter()
            .map(|r| r.to.clone())
            .chain(fan_out.iter().cloned())
            .chain(default.cloned())
            .collect()
    }
}

impl Node for ControlNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn execute<'a>(&'a self, ctx: &'a NodeContext) -> BoxFuture<'a, Result<NodeOutcome>> {
        Box::pin(async move {
            let snapshot = ctx.state.snapshot();
            let targets = (self.routing)(&snapshot);
            debug!(node_id = %self.id, targets = ?targets, "Routing");
            Ok(NodeOutcome::Route(targets))
        })
    }
}

/// Ends a branch and completes the active task with the latest assistant
/// reply. If the task was already finished (for example failed by a sibling
/// branch) it only ends the branch.
pub struct TerminalNode {
    id: String,
}

impl TerminalNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Node for TerminalNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn execute<'a>(&'a self, ctx: &'a NodeContext) -> BoxFuture<'a, Result<NodeOutcome>> {
        Box::pin(async move {
            if ctx.state.current_task().is_none() {
                debug!(node_id = %self.id, "No active task at terminal");
                return Ok(NodeOutcome::Halt);
            }
            let result = ctx
                .state
                .latest_assistant_content()
                .unwrap_or_else(|| "done".to_string());
            ctx.state
                .complete_task(&result)
                .map_err(|e| SkeinError::node(&self.id, e))?;
            Ok(NodeOutcome::Halt)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skein_core::config::RateLimitConfig;
    use skein_core::types::TaskStatus;
    use skein_test_utils::{tool_call_reply, EchoExecutor, FailingAgent, ScriptedAgent};
    use skein_tools::ToolRequestTable;

    fn context(tools: Option<Arc<ToolDispatcher>>) -> NodeContext {
        let state = Arc::new(StateManager::fresh("c1", &RateLimitConfig::default()));
        state
            .update_conversation(Role::User, "what's on today?", MessageMetadata::default())
            .unwrap();
        NodeContext {
            state,
            tools,
            correlations: Arc::new(Correlations::new()),
            wave: 1,
        }
    }

    #[tokio::test]
    async fn agent_node_records_reply() {
        let ctx = context(None);
        let agent = Arc::new(ScriptedAgent::always("Nothing scheduled."));
        let node = AgentNode::new("chat", "chat", agent.clone());

        let outcome = node.execute(&ctx).await.unwrap();
        assert_eq!(outcome, NodeOutcome::Continue);
        assert_eq!(agent.prompts(), vec!["what's on today?".to_string()]);

        let state = ctx.state.snapshot();
        let last = state.messages.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, "Nothing scheduled.");
        assert_eq!(last.metadata.node_id.as_deref(), Some("chat"));
        assert_eq!(state.agent_states["chat"]["status"], "responded");
    }

    #[tokio::test]
    async fn agent_node_with_next_routes_explicitly() {
        let ctx = context(None);
        let node = AgentNode::new("chat", "chat", Arc::new(ScriptedAgent::always("hi")))
            .with_next(vec!["end".into()]);
        assert_eq!(
            node.execute(&ctx).await.unwrap(),
            NodeOutcome::Route(vec!["end".into()])
        );
    }

    #[tokio::test]
    async fn agent_node_submits_tool_call() {
        let table = Arc::new(ToolRequestTable::new());
        let dispatcher = Arc::new(ToolDispatcher::new(table.clone(), Arc::new(EchoExecutor)));
        let ctx = context(Some(dispatcher));
        let reply = tool_call_reply("calendar", json!({"day": "today"}));
        let node = AgentNode::new("cal", "calendar", Arc::new(ScriptedAgent::always(&reply)));

        node.execute(&ctx).await.unwrap();

        let records = table.list();
        assert_eq!(records.len(), 1);
        let id = &records[0].request_id;
        assert_eq!(records[0].owner.as_deref(), Some("c1"));
        assert_eq!(records[0].tool_name, "calendar");
        assert_eq!(ctx.correlations.get(id).unwrap().query, "what's on today?");

        let last = ctx.state.snapshot().messages.last().cloned().unwrap();
        assert!(last.content.starts_with("Working on it"));
        assert_eq!(last.metadata.request_id.as_deref(), Some(id.as_str()));
        assert_eq!(last.metadata.extra["pending"], json!(true));
        assert_eq!(
            ctx.state.agent_state("calendar").unwrap()["status"],
            "awaiting_tool"
        );
    }

    #[tokio::test]
    async fn tool_call_without_dispatcher_fails_node() {
        let ctx = context(None);
        let reply = tool_call_reply("calendar", json!({}));
        let node = AgentNode::new("cal", "calendar", Arc::new(ScriptedAgent::always(&reply)));
        let err = node.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, SkeinError::NodeExecution { ref node, .. } if node == "cal"));
    }

    #[tokio::test]
    async fn agent_failure_is_wrapped() {
        let ctx = context(None);
        let node = AgentNode::new("mail", "mail", Arc::new(FailingAgent::new("smtp down")));
        let err = node.execute(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("smtp down"));
        assert_eq!(ctx.state.agent_state("mail").unwrap()["status"], "error");
    }

    #[tokio::test]
    async fn control_node_routes_on_input() {
        let ctx = context(None);
        let node = ControlNode::from_routes(
            "router",
            vec![
                Route::new(r#"input contains "email""#, "mail"),
                Route::new(r#"input contains "today""#, "calendar"),
            ],
            vec!["audit".into()],
            Some("chat".into()),
        );
        assert_eq!(
            node.execute(&ctx).await.unwrap(),
            NodeOutcome::Route(vec!["audit".into(), "calendar".into()])
        );
    }

    #[tokio::test]
    async fn control_node_falls_back_to_default() {
        let ctx = context(None);
        let node = ControlNode::from_routes(
            "router",
            vec![Route::new(r#"input contains "email""#, "mail")],
            vec![],
            Some("chat".into()),
        );
        assert_eq!(
            node.execute(&ctx).await.unwrap(),
            NodeOutcome::Route(vec!["chat".into()])
        );
    }

    #[tokio::test]
    async fn terminal_completes_active_task() {
        let ctx = context(None);
        ctx.state.set_task("turn-1").unwrap();
        ctx.state
            .update_conversation(Role::Assistant, "All clear.", MessageMetadata::default())
            .unwrap();

        let node = TerminalNode::new("end");
        assert_eq!(node.execute(&ctx).await.unwrap(), NodeOutcome::Halt);
        let state = ctx.state.snapshot();
        assert_eq!(state.status(), TaskStatus::Completed);
        assert_eq!(state.final_result.as_deref(), Some("All clear."));
    }

    #[tokio::test]
    async fn terminal_without_task_just_halts() {
        let ctx = context(None);
        ctx.state.set_task("turn-1").unwrap();
        ctx.state.fail_task("branch failed").unwrap();

        let node = TerminalNode::new("end");
        assert_eq!(node.execute(&ctx).await.unwrap(), NodeOutcome::Halt);
        assert_eq!(ctx.state.task_status(), TaskStatus::Failed);
        assert_eq!(ctx.state.error_stats().error_count, 0);
    }
}
