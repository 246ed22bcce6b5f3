pub mod correlation;
pub mod engine;
pub mod graph;
pub mod poller;
pub mod rate_limit;
pub mod state;

pub use correlation::{Correlations, PendingTurn};
pub use engine::{BranchFailure, Engine, EngineBuilder, TurnOutcome};
pub use graph::{AgentNode, ControlNode, Graph, Node, NodeContext, NodeOutcome, Route, TerminalNode};
pub use poller::{Reconciled, ToolPoller};
pub use rate_limit::UpdateWindow;
pub use state::StateManager;
