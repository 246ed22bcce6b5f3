//! Workflow graph: nodes keyed by id plus static successor edges.
//!
//! Nodes are agents, routers, or terminals. The engine walks the graph in
//! waves starting from `start`; a node's outcome decides whether its static
//! edges are followed, replaced by an explicit target list, or dropped.

pub mod node;
pub mod route;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use skein_core::config::{GraphConfig, NodeKind};
use skein_core::error::{Result, SkeinError};
use skein_core::traits::Agent;

pub use node::{AgentNode, ControlNode, Node, NodeContext, NodeOutcome, TerminalNode};
pub use route::{evaluate_condition, route_context, Route};

pub struct Graph {
    start: String,
    nodes: HashMap<String, Arc<dyn Node>>,
    edges: HashMap<String, Vec<String>>,
}

impl Graph {
    pub fn new(start: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            nodes: HashMap::new(),
            edges: HashMap::new(),
        }
    }

    /// One agent followed by a terminal. Used when no graph is configured.
    pub fn chat(agent_id: &str, agent: Arc<dyn Agent>) -> Self {
        Self::new(agent_id)
            .with_node(AgentNode::new(agent_id, agent_id, agent))
            .with_node(TerminalNode::new("end"))
            .with_edge(agent_id, "end")
    }

    pub fn with_node(mut self, node: impl Node) -> Self {
        self.add_node(Arc::new(node));
        self
    }

    pub fn with_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.add_edge(from, to);
        self
    }

    /// Insert a node, replacing any node with the same id.
    pub fn add_node(&mut self, node: Arc<dyn Node>) {
        self.nodes.insert(node.id().to_string(), node);
    }

    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.edges.entry(from.into()).or_default().push(to.into());
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn node(&self, id: &str) -> Option<&Arc<dyn Node>> {
        self.nodes.get(id)
    }

    /// Static successors of a node, in declaration order.
    pub fn successors(&self, id: &str) -> &[String] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Agents wrapped by the graph's nodes, keyed by agent id.
    pub fn agents(&self) -> HashMap<String, Arc<dyn Agent>> {
        self.nodes
            .values()
            .filter_map(|n| n.agent())
            .map(|(id, agent)| (id.to_string(), agent))
            .collect()
    }

    /// Check that the start node and every edge endpoint exist.
    pub fn validate(&self) -> Result<()> {
        if !self.nodes.contains_key(&self.start) {
            return Err(SkeinError::Config(format!(
                "start node '{}' not found in graph",
                self.start
            )));
        }
        for (from, targets) in &self.edges {
            if !self.nodes.contains_key(from) {
                return Err(SkeinError::Config(format!(
                    "edge source '{}' not found in graph",
                    from
                )));
            }
            self.check_targets(from, targets)?;
        }
        Ok(())
    }

    fn check_targets(&self, from: &str, targets: &[String]) -> Result<()> {
        match targets.iter().find(|t| !self.nodes.contains_key(*t)) {
            Some(missing) => Err(SkeinError::Config(format!(
                "node '{}' points at unknown node '{}'",
                from, missing
            ))),
            None => Ok(()),
        }
    }

    /// Build a graph from its TOML description. `agents` supplies the
    /// agent behind each `agent` node.
    pub fn from_config(
        config: &GraphConfig,
        agents: &HashMap<String, Arc<dyn Agent>>,
    ) -> Result<Self> {
        let mut graph = Graph::new(&config.start);
        let mut seen = HashSet::new();
        let mut declared: Vec<(String, Vec<String>)> = Vec::new();

        for node in &config.nodes {
            if !seen.insert(node.id.clone()) {
                return Err(SkeinError::Config(format!("duplicate node id '{}'", node.id)));
            }
            match node.kind {
                NodeKind::Agent => {
                    let agent_id = node.agent.clone().unwrap_or_else(|| node.id.clone());
                    let agent = agents.get(&agent_id).cloned().ok_or_else(|| {
                        SkeinError::Config(format!(
                            "node '{}' uses unknown agent '{}'",
                            node.id, agent_id
                        ))
                    })?;
                    let mut agent_node = AgentNode::new(&node.id, agent_id, agent);
                    if !node.next.is_empty() {
                        agent_node = agent_node.with_next(node.next.clone());
                        declared.push((node.id.clone(), node.next.clone()));
                    }
                    graph.add_node(Arc::new(agent_node));
                }
                NodeKind::Control => {
                    let routes: Vec<Route> = node
                        .routes
                        .iter()
                        .map(|r| Route::new(&r.when, &r.to))
                        .collect();
                    declared.push((
                        node.id.clone(),
                        ControlNode::declared_targets(&routes, &node.fan_out, node.default.as_ref()),
                    ));
                    graph.add_node(Arc::new(ControlNode::from_routes(
                        &node.id,
                        routes,
                        node.fan_out.clone(),
                        node.default.clone(),
                    )));
                }
                NodeKind::Terminal => graph.add_node(Arc::new(TerminalNode::new(&node.id))),
            }
        }

        for (from, targets) in &config.edges {
            for to in targets {
                graph.add_edge(from, to);
            }
        }

        graph.validate()?;
        for (from, targets) in &declared {
            graph.check_targets(from, targets)?;
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::config::{NodeConfig, RouteConfig};
    use skein_test_utils::ScriptedAgent;

    fn node(id: &str, kind: NodeKind) -> NodeConfig {
        NodeConfig {
            id: id.into(),
            kind,
            agent: None,
            next: vec![],
            routes: vec![],
            fan_out: vec![],
            default: None,
        }
    }

    fn agents(ids: &[&str]) -> HashMap<String, Arc<dyn Agent>> {
        ids.iter()
            .map(|id| {
                let agent: Arc<dyn Agent> = Arc::new(ScriptedAgent::always("ok"));
                (id.to_string(), agent)
            })
            .collect()
    }

    #[test]
    fn chat_graph_is_valid() {
        let graph = Graph::chat("chat", Arc::new(ScriptedAgent::always("hi")));
        graph.validate().unwrap();
        assert_eq!(graph.start(), "chat");
        assert_eq!(graph.successors("chat"), ["end".to_string()]);
        assert!(graph.successors("end").is_empty());
        assert_eq!(graph.agents().len(), 1);
    }

    #[test]
    fn missing_start_is_rejected() {
        let graph = Graph::new("nowhere").with_node(TerminalNode::new("end"));
        assert!(matches!(graph.validate(), Err(SkeinError::Config(_))));
    }

    #[test]
    fn dangling_edge_is_rejected() {
        let graph = Graph::new("end")
            .with_node(TerminalNode::new("end"))
            .with_edge("end", "ghost");
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn from_config_builds_router_graph() {
        let mut router = node("router", NodeKind::Control);
        router.routes = vec![RouteConfig {
            when: r#"input contains "email""#.into(),
            to: "mail".into(),
        }];
        router.fan_out = vec!["audit".into()];
        router.default = Some("chat".into());

        let mut audit = node("audit", NodeKind::Agent);
        audit.agent = Some("auditor".into());

        let config = GraphConfig {
            start: "router".into(),
            nodes: vec![
                router,
                node("mail", NodeKind::Agent),
                node("chat", NodeKind::Agent),
                audit,
                node("end", NodeKind::Terminal),
            ],
            edges: HashMap::from([
                ("mail".to_string(), vec!["end".to_string()]),
                ("chat".to_string(), vec!["end".to_string()]),
                ("audit".to_string(), vec!["end".to_string()]),
            ]),
        };

        let graph = Graph::from_config(&config, &agents(&["mail", "chat", "auditor"])).unwrap();
        assert_eq!(graph.len(), 5);
        let mut agent_ids: Vec<String> = graph.agents().into_keys().collect();
        agent_ids.sort();
        assert_eq!(agent_ids, vec!["auditor", "chat", "mail"]);
    }

    #[test]
    fn from_config_rejects_unknown_agent() {
        let config = GraphConfig {
            start: "mail".into(),
            nodes: vec![node("mail", NodeKind::Agent)],
            edges: HashMap::new(),
        };
        let err = Graph::from_config(&config, &agents(&[])).err().unwrap();
        assert!(err.to_string().contains("unknown agent"));
    }

    #[test]
    fn from_config_rejects_unknown_route_target() {
        let mut router = node("router", NodeKind::Control);
        router.default = Some("missing".into());
        let config = GraphConfig {
            start: "router".into(),
            nodes: vec![router],
            edges: HashMap::new(),
        };
        let err = Graph::from_config(&config, &agents(&[])).err().unwrap();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn from_config_rejects_duplicate_ids() {
        let config = GraphConfig {
            start: "end".into(),
            nodes: vec![node("end", NodeKind::Terminal), node("end", NodeKind::Terminal)],
            edges: HashMap::new(),
        };
        assert!(Graph::from_config(&config, &agents(&[])).is_err());
    }
}
