use crate::types::EngineEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::NodeFailed {
            node_id: "a".into(),
            error: "boom".into(),
        });
        match rx.recv().await.unwrap() {
            EngineEvent::NodeFailed { node_id, .. } => assert_eq!(node_id, "a"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(EngineEvent::WaveCompleted {
            wave: 1,
            nodes: vec![],
        });
    }
}
