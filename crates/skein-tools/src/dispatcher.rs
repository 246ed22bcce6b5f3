use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use skein_core::event::EventBus;
use skein_core::traits::ToolExecutor;
use skein_core::types::{EngineEvent, ToolRequestRecord};

use crate::table::ToolRequestTable;

/// Hands tool calls to the executor without waiting for them.
///
/// Every submission gets a `Pending` record in the shared table; a spawned
/// task runs the executor and writes the result back. Completed request ids
/// are also pushed on a broadcast channel for pollers running in push mode.
pub struct ToolDispatcher {
    table: Arc<ToolRequestTable>,
    executor: Arc<dyn ToolExecutor>,
    completions: broadcast::Sender<String>,
    event_bus: Option<Arc<EventBus>>,
}

impl ToolDispatcher {
    pub fn new(table: Arc<ToolRequestTable>, executor: Arc<dyn ToolExecutor>) -> Self {
        let (completions, _) = broadcast::channel(64);
        Self {
            table,
            executor,
            completions,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn table(&self) -> &Arc<ToolRequestTable> {
        &self.table
    }

    /// Subscribe to completion notices (request ids).
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.completions.subscribe()
    }

    /// Submit a tool call and return its request id immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(
        &self,
        tool_name: &str,
        args: serde_json::Value,
        owner: Option<String>,
    ) -> String {
        let record = ToolRequestRecord::new(tool_name, args.clone(), owner);
        let request_id = self.table.insert(record);

        info!(request_id = %request_id, tool = %tool_name, "Tool request submitted");
        if let Some(ref bus) = self.event_bus {
            bus.publish(EngineEvent::ToolSubmitted {
                request_id: request_id.clone(),
                tool_name: tool_name.to_string(),
            });
        }

        let table = self.table.clone();
        let executor = self.executor.clone();
        let completions = self.completions.clone();
        let event_bus = self.event_bus.clone();
        let tool_name = tool_name.to_string();
        let id = request_id.clone();

        tokio::spawn(async move {
            let (written, is_error) = match executor.execute(&tool_name, args).await {
                Ok(response) => (table.complete(&id, response), false),
                Err(e) => {
                    warn!(request_id = %id, tool = %tool_name, error = %e, "Tool execution failed");
                    (table.fail(&id, &e.to_string()), true)
                }
            };

            match written {
                Ok(true) => {
                    debug!(request_id = %id, is_error, "Tool result recorded");
                    if let Some(bus) = event_bus {
                        bus.publish(EngineEvent::ToolCompleted {
                            request_id: id.clone(),
                            is_error,
                        });
                    }
                    // Ignore error if no poller is listening
                    let _ = completions.send(id);
                }
                Ok(false) => debug!(request_id = %id, "Tool request already terminal"),
                Err(e) => warn!(request_id = %id, error = %e, "Tool request vanished before completion"),
            }
        });

        request_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skein_core::types::ToolRequestStatus;
    use skein_test_utils::{EchoExecutor, FailingExecutor, PendingExecutor};

    #[tokio::test]
    async fn submit_returns_before_execution_finishes() {
        let table = Arc::new(ToolRequestTable::new());
        let dispatcher = ToolDispatcher::new(table.clone(), Arc::new(PendingExecutor));

        let id = dispatcher.submit("search", json!({"q": "x"}), Some("c1".into()));
        let rec = table.get(&id).unwrap();
        assert_eq!(rec.status, ToolRequestStatus::Pending);
        assert_eq!(rec.owner.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn result_is_written_back_and_announced() {
        let table = Arc::new(ToolRequestTable::new());
        let dispatcher = ToolDispatcher::new(table.clone(), Arc::new(EchoExecutor));
        let mut rx = dispatcher.subscribe();

        let id = dispatcher.submit("echo", json!({"text": "hi"}), None);
        let done = rx.recv().await.unwrap();
        assert_eq!(done, id);

        let rec = table.get(&id).unwrap();
        assert_eq!(rec.status, ToolRequestStatus::Completed);
        assert_eq!(rec.response.unwrap()["args"]["text"], "hi");
    }

    #[tokio::test]
    async fn executor_error_marks_record_error() {
        let table = Arc::new(ToolRequestTable::new());
        let dispatcher = ToolDispatcher::new(table.clone(), Arc::new(FailingExecutor));
        let mut rx = dispatcher.subscribe();

        let id = dispatcher.submit("calendar", json!({}), None);
        rx.recv().await.unwrap();

        let rec = table.get(&id).unwrap();
        assert_eq!(rec.status, ToolRequestStatus::Error);
        assert!(rec.response.unwrap()["error"]
            .as_str()
            .unwrap()
            .contains("calendar"));
    }
}
